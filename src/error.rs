use crate::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("deadlock detected while locking {path:?} at offset {offset}")]
    Deadlock { path: PathBuf, offset: u64 },
    #[error(
        "lock on {path:?} at offset {offset} was created by pid {created} \
         but used from pid {current}"
    )]
    ForeignPid {
        path: PathBuf,
        offset: u64,
        created: u32,
        current: u32,
    },
    #[error("released a lock that the current thread does not hold")]
    NotHeld,
}
