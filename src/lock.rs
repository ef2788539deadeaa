use crate::prelude::*;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};

/// One logical mutex per (lock file, byte offset) pair.
///
/// Exclusive between threads and between processes, reentrant within a
/// thread. The cross-process side is a 1-byte advisory fcntl lock at the
/// given offset; the intra-process side is an owner/depth record guarded by
/// a plain mutex, so the OS lock is only ever taken on the 0 -> 1
/// transition and released on the 1 -> 0 transition.
///
/// Instances record the pid that created them and refuse to operate from
/// any other process: POSIX record locks are owned per process and fd, so a
/// forked child must go back to the registry for a fresh lock.
#[derive(Debug)]
pub struct RangedLock {
    file: Arc<File>,
    path: PathBuf,
    offset: u64,
    pid: u32,
    state: Mutex<HoldState>,
    unlocked: Condvar,
}

#[derive(Debug, Default)]
struct HoldState {
    owner: Option<ThreadId>,
    depth: u32,
}

impl RangedLock {
    pub(crate) fn new(file: Arc<File>, path: PathBuf, offset: u64) -> RangedLock {
        RangedLock {
            file,
            path,
            offset,
            pid: std::process::id(),
            state: Mutex::new(HoldState::default()),
            unlocked: Condvar::new(),
        }
    }

    /// Whether any thread of this process currently holds the lock.
    pub fn is_locked(&self) -> bool {
        // unwrap rationale: the state mutex is never held across a panic
        self.state.lock().unwrap().depth > 0
    }

    /// Acquire the lock. Returns `Ok(false)` only for a non-blocking
    /// attempt that would have had to wait; a kernel-detected deadlock or
    /// use from a foreign process is an error.
    pub fn acquire(&self, blocking: bool) -> Result<bool> {
        self.assert_pid()?;
        let me = thread::current().id();
        {
            let mut state = self.state.lock().unwrap();
            loop {
                match state.owner {
                    Some(owner) if owner == me => {
                        state.depth += 1;
                        return Ok(true);
                    }
                    Some(_) if !blocking => return Ok(false),
                    Some(_) => state = self.unlocked.wait(state).unwrap(),
                    None => {
                        state.owner = Some(me);
                        break;
                    }
                }
            }
        }
        // This thread now owns the intra-process side with depth 0. Take
        // the OS byte-range lock without holding the state mutex, so
        // is_locked() and reentrant checks stay responsive while we wait.
        debug!(
            path = %self.path.display(),
            offset = self.offset,
            blocking,
            "lockf"
        );
        match self.os_lock(blocking) {
            Ok(true) => {
                self.state.lock().unwrap().depth = 1;
                Ok(true)
            }
            Ok(false) => {
                self.abandon();
                Ok(false)
            }
            Err(err) => {
                self.abandon();
                Err(err)
            }
        }
    }

    /// Undo a first-level claim whose OS lock never materialized.
    fn abandon(&self) {
        let mut state = self.state.lock().unwrap();
        state.owner = None;
        drop(state);
        self.unlocked.notify_one();
    }

    /// Release one level of the lock. The OS lock is dropped on the final
    /// release, byte-range first, owner slot second, even if the syscall
    /// fails.
    pub fn release(&self) -> Result<()> {
        self.assert_pid()?;
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        if state.owner != Some(me) || state.depth == 0 {
            return Err(CacheError::NotHeld.into());
        }
        state.depth -= 1;
        if state.depth > 0 {
            return Ok(());
        }
        debug!(path = %self.path.display(), offset = self.offset, "unlockf");
        let result = self.os_unlock();
        state.owner = None;
        drop(state);
        self.unlocked.notify_one();
        result
    }

    /// Scoped blocking acquisition; released when the guard drops.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.acquire(true)?;
        Ok(LockGuard { lock: self })
    }

    fn assert_pid(&self) -> Result<()> {
        let current = std::process::id();
        if current != self.pid {
            return Err(CacheError::ForeignPid {
                path: self.path.clone(),
                offset: self.offset,
                created: self.pid,
                current,
            }
            .into());
        }
        Ok(())
    }

    fn os_lock(&self, blocking: bool) -> Result<bool> {
        let record = self.flock_record(libc::F_WRLCK);
        loop {
            let arg = if blocking {
                FcntlArg::F_SETLKW(&record)
            } else {
                FcntlArg::F_SETLK(&record)
            };
            match fcntl(self.file.as_raw_fd(), arg) {
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) | Err(Errno::EACCES) if !blocking => return Ok(false),
                Err(Errno::EDEADLK) => {
                    return Err(CacheError::Deadlock {
                        path: self.path.clone(),
                        offset: self.offset,
                    }
                    .into())
                }
                Err(err) => {
                    return Err(err).wrap_err_with(|| {
                        format!(
                            "lockf({}, offset={}) failed",
                            self.path.display(),
                            self.offset
                        )
                    })
                }
            }
        }
    }

    fn os_unlock(&self) -> Result<()> {
        let record = self.flock_record(libc::F_UNLCK);
        loop {
            match fcntl(self.file.as_raw_fd(), FcntlArg::F_SETLK(&record)) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    return Err(err).wrap_err_with(|| {
                        format!(
                            "unlockf({}, offset={}) failed",
                            self.path.display(),
                            self.offset
                        )
                    })
                }
            }
        }
    }

    fn flock_record(&self, l_type: i32) -> libc::flock {
        libc::flock {
            l_type: l_type as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: self.offset as libc::off_t,
            l_len: 1,
            l_pid: 0,
        }
    }
}

pub struct LockGuard<'a> {
    lock: &'a RangedLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release() {
            warn!("Failed to release cache lock: {err:#}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::OpenOptions;
    use std::sync::mpsc;

    fn test_lock(dir: &Path, offset: u64) -> RangedLock {
        let path = dir.join("test.lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        RangedLock::new(Arc::new(file), path, offset)
    }

    #[test]
    fn test_reentrant_within_thread() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = test_lock(tmp.path(), 7);

        assert!(!lock.is_locked());
        assert!(lock.acquire(true).unwrap());
        assert!(lock.acquire(false).unwrap());
        assert!(lock.is_locked());

        lock.release().unwrap();
        // still held: two acquires need two releases
        assert!(lock.is_locked());
        lock.release().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_excludes_other_threads() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = test_lock(tmp.path(), 0);

        assert!(lock.acquire(true).unwrap());
        assert!(lock.acquire(true).unwrap());
        lock.release().unwrap();

        thread::scope(|scope| {
            let handle = scope.spawn(|| lock.acquire(false).unwrap());
            assert!(!handle.join().unwrap());
        });

        lock.release().unwrap();

        // fully released now, another thread can take it
        thread::scope(|scope| {
            let handle = scope.spawn(|| {
                let acquired = lock.acquire(false).unwrap();
                if acquired {
                    lock.release().unwrap();
                }
                acquired
            });
            assert!(handle.join().unwrap());
        });
    }

    #[test]
    fn test_blocking_handoff() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = test_lock(tmp.path(), 3);
        let (started_tx, started_rx) = mpsc::channel();

        lock.acquire(true).unwrap();
        thread::scope(|scope| {
            let handle = scope.spawn(|| {
                started_tx.send(()).unwrap();
                assert!(lock.acquire(true).unwrap());
                lock.release().unwrap();
            });
            started_rx.recv().unwrap();
            lock.release().unwrap();
            handle.join().unwrap();
        });
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_distinct_offsets_do_not_contend() {
        let tmp = tempfile::tempdir().unwrap();
        let a = test_lock(tmp.path(), 1);
        let b = test_lock(tmp.path(), 2);

        assert!(a.acquire(true).unwrap());
        thread::scope(|scope| {
            let handle = scope.spawn(|| {
                let acquired = b.acquire(false).unwrap();
                if acquired {
                    b.release().unwrap();
                }
                acquired
            });
            assert!(handle.join().unwrap());
        });
        a.release().unwrap();
    }

    #[test]
    fn test_release_without_hold_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = test_lock(tmp.path(), 9);
        assert!(lock.release().is_err());

        lock.acquire(true).unwrap();
        thread::scope(|scope| {
            // a thread that does not hold the lock cannot release it
            let handle = scope.spawn(|| lock.release().is_err());
            assert!(handle.join().unwrap());
        });
        lock.release().unwrap();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = test_lock(tmp.path(), 11);
        {
            let _held = lock.lock().unwrap();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }
}
