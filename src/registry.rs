use crate::lock::RangedLock;
use crate::prelude::*;
use std::fs::{File, OpenOptions};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// A per-process interning map, aka thread-local storage but for processes:
/// any lookup that observes a changed pid atomically wipes the map first,
/// so a forked child never reuses entries created by its parent.
pub struct ProcessLocalRegistry<K, V> {
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    pid: u32,
    map: HashMap<K, V>,
}

impl<K: Eq + Hash, V: Clone> ProcessLocalRegistry<K, V> {
    pub fn new() -> ProcessLocalRegistry<K, V> {
        ProcessLocalRegistry {
            // pid 0 never matches a real process, so the first lookup
            // initializes the map
            inner: Mutex::new(Inner {
                pid: 0,
                map: HashMap::new(),
            }),
        }
    }

    pub fn get_or_create<F>(&self, key: K, create: F) -> Result<V>
    where
        F: FnOnce(&K) -> Result<V>,
    {
        // unwrap rationale: the registry mutex is never held across a panic
        let mut inner = self.inner.lock().unwrap();
        let pid = std::process::id();
        if inner.pid != pid {
            inner.pid = pid;
            inner.map = HashMap::new();
        }
        if let Some(value) = inner.map.get(&key) {
            return Ok(value.clone());
        }
        let value = create(&key)?;
        inner.map.insert(key, value.clone());
        Ok(value)
    }
}

static LOCK_FILES: Lazy<ProcessLocalRegistry<PathBuf, Arc<File>>> =
    Lazy::new(ProcessLocalRegistry::new);

static LOCKS: Lazy<ProcessLocalRegistry<(PathBuf, u64), Arc<RangedLock>>> =
    Lazy::new(ProcessLocalRegistry::new);

/// The interned lock for `(path, offset)`, opening the lock file on first
/// use. Each process keeps exactly one descriptor per lock file, cached for
/// the life of the process: closing any descriptor to a file drops every
/// byte-range lock the process holds on it.
pub fn ranged_lock(path: &Path, offset: u64) -> Result<Arc<RangedLock>> {
    LOCKS.get_or_create((path.to_path_buf(), offset), |(path, offset)| {
        let file = lock_file(path)?;
        Ok(Arc::new(RangedLock::new(file, path.clone(), *offset)))
    })
}

fn lock_file(path: &Path) -> Result<Arc<File>> {
    LOCK_FILES.get_or_create(path.to_path_buf(), |path| {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("Failed to open lock file {}", path.display()))?;
        Ok(Arc::new(file))
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::exit_status_in_child;

    #[test]
    fn test_interns_per_identifier() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.lock");

        let first = ranged_lock(&path, 5).unwrap();
        let again = ranged_lock(&path, 5).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let other_offset = ranged_lock(&path, 6).unwrap();
        assert!(!Arc::ptr_eq(&first, &other_offset));

        let other_file = ranged_lock(&tmp.path().join("b.lock"), 5).unwrap();
        assert!(!Arc::ptr_eq(&first, &other_file));
    }

    #[test]
    fn test_can_acquire_many_locks() {
        let tmp = tempfile::tempdir().unwrap();
        let mut held = Vec::new();
        for file_i in 0..3 {
            let path = tmp.path().join(format!("lock_{file_i}"));
            for offset in 0..100 {
                let lock = ranged_lock(&path, offset).unwrap();
                assert!(lock.acquire(true).unwrap());
                held.push(lock);
            }
        }
        for lock in held {
            lock.release().unwrap();
        }
    }

    #[test]
    fn test_fork_gets_fresh_locks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("forked.lock");

        let lock = ranged_lock(&path, 42).unwrap();
        assert!(lock.acquire(true).unwrap());

        let status = exit_status_in_child(|| {
            // the child's registry resets, so this is a fresh object with a
            // fresh descriptor, not the parent's held lock
            let child_lock = match ranged_lock(&path, 42) {
                Ok(lock) => lock,
                Err(_) => return 2,
            };
            if child_lock.is_locked() {
                return 3;
            }
            // the parent process still holds the OS range lock
            match child_lock.acquire(false) {
                Ok(false) => 0,
                Ok(true) => 4,
                Err(_) => 5,
            }
        });
        assert_eq!(status, 0);

        lock.release().unwrap();
    }

    #[test]
    fn test_parent_lock_object_is_unusable_after_fork() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("misuse.lock");
        let lock = ranged_lock(&path, 1).unwrap();

        let status = exit_status_in_child(|| match lock.acquire(false) {
            Err(_) => 0,
            Ok(_) => 1,
        });
        assert_eq!(status, 0);
    }
}
