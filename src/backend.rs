use crate::hash;
use crate::layout::{Layout, LEGACY_TYPE_SUFFIX, METADATA_SUFFIX, PAYLOAD_SUFFIX};
use crate::lock::RangedLock;
use crate::prelude::*;
use crate::registry;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use nix::sys::stat::utimes;
use nix::sys::time::TimeVal;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

// Each entry is a `.payload` file plus a `.metadata` sidecar. Updates build
// both files next to the live ones (same directory, so the rename cannot
// cross a filesystem) and then rename them into place under the key's
// write lock: metadata first, payload second, matching the order readers
// consume them. A reader that takes the lock therefore always sees a
// coherent pair; a reader that skips the lock is outside the contract.
//
// The payload's mtime doubles as the entry's recency stamp for TTL checks
// and LRU ordering, so both files are touched to one timestamp sampled at
// the start of the write.

const DEFAULT_CACHE_SIZE: u64 = 1024 * 1024 * 1024; // 1 GiB
const COPY_CHUNK: usize = 1024 * 1024;

/// Construction options shared by both backends.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache root; created if missing.
    pub base_dir: PathBuf,
    /// Per-entry TTL. Entries older than this read as misses and are
    /// collected by the next prune. `None` disables expiration.
    pub expiration_time: Option<Duration>,
    /// Global byte budget enforced by LRU eviction on every write. `None`
    /// disables the budget.
    pub cache_size: Option<u64>,
    /// Whether a value backed by a real path may be renamed into the cache
    /// instead of copied. The caller must not reuse the file afterwards.
    pub file_movable: bool,
    /// When true, `get_mutex` hands out a cross-process byte-range lock;
    /// otherwise it returns `None` and the region falls back to its own
    /// in-process mutex.
    pub distributed_lock: bool,
}

impl CacheConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> CacheConfig {
        CacheConfig {
            base_dir: base_dir.into(),
            expiration_time: None,
            cache_size: Some(DEFAULT_CACHE_SIZE),
            file_movable: false,
            distributed_lock: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum PayloadKind {
    Value,
    File,
}

/// Sidecar record stored in `.metadata` files, CBOR-encoded.
#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    kind: PayloadKind,
    original_file_offset: Option<u64>,
    #[serde(with = "serde_bytes")]
    outer_metadata: Option<Vec<u8>>,
}

/// A byte-stream value handed to [`RawFsBackend::set`].
#[derive(Debug)]
pub struct FileValue {
    pub file: File,
    source_path: Option<PathBuf>,
    outer_metadata: Option<Vec<u8>>,
}

impl FileValue {
    pub fn new(file: File) -> FileValue {
        FileValue {
            file,
            source_path: None,
            outer_metadata: None,
        }
    }

    /// A value backed by a real path that the cache may consume by rename
    /// when the backend is configured with `file_movable`.
    pub fn movable(file: File, path: impl Into<PathBuf>) -> FileValue {
        FileValue {
            file,
            source_path: Some(path.into()),
            outer_metadata: None,
        }
    }

    /// Attach the surrounding region's bookkeeping blob; stored opaquely
    /// and handed back on `get`.
    pub fn with_outer_metadata(mut self, blob: Vec<u8>) -> FileValue {
        self.outer_metadata = Some(blob);
        self
    }
}

/// A hit from [`RawFsBackend::get`]: the payload stream positioned where
/// the caller's stream was at `set` time, plus the passthrough blob.
#[derive(Debug)]
pub struct FileHit {
    pub file: File,
    pub outer_metadata: Option<Vec<u8>>,
}

enum StagedPayload {
    Staged(NamedTempFile),
    Move(PathBuf),
}

/// The raw backend: values are opaque byte streams stored verbatim.
#[derive(Debug)]
pub struct RawFsBackend {
    layout: Layout,
    expiration_time: Option<Duration>,
    cache_size: Option<u64>,
    file_movable: bool,
    distributed_lock: bool,
}

impl RawFsBackend {
    pub fn new(config: CacheConfig) -> Result<RawFsBackend> {
        Ok(RawFsBackend {
            layout: Layout::new(&config.base_dir)?,
            expiration_time: config.expiration_time,
            cache_size: config.cache_size,
            file_movable: config.file_movable,
            distributed_lock: config.distributed_lock,
        })
    }

    /// Lowercase hex of SHA-256: the mangler the surrounding region applies
    /// before keys reach this backend.
    pub fn key_mangler(key: &str) -> String {
        hash::key_identifier(key)
    }

    pub fn values_dir(&self) -> &Path {
        self.layout.values_dir()
    }

    fn rw_lock(&self, key: &str) -> Result<Arc<RangedLock>> {
        registry::ranged_lock(self.layout.rw_lock_path(), hash::key_offset(key))
    }

    fn dogpile_lock(&self, key: &str) -> Result<Arc<RangedLock>> {
        registry::ranged_lock(self.layout.dogpile_lock_path(), hash::key_offset(key))
    }

    /// The single-flight recomputation lock the surrounding region should
    /// use for this key, or `None` when distributed locking is disabled.
    pub fn get_mutex(&self, key: &str) -> Result<Option<Arc<RangedLock>>> {
        if self.distributed_lock {
            Ok(Some(self.dogpile_lock(key)?))
        } else {
            Ok(None)
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<FileHit>> {
        let now = SystemTime::now();
        let payload_path = self.layout.payload_path(key);
        let metadata_path = self.layout.metadata_path(key);

        let lock = self.rw_lock(key)?;
        let _held = lock.lock()?;

        if !payload_path.exists() || !metadata_path.exists() {
            return Ok(None);
        }
        if let Some(ttl) = self.expiration_time {
            let last_modified = last_modified_or_epoch(stat_or_warn(&payload_path).as_ref());
            // expired entries read as misses; removal is the pruner's job
            if is_expired(last_modified, ttl, now) {
                return Ok(None);
            }
        }

        let metadata = read_metadata(&metadata_path)?;
        let mut file = File::open(&payload_path)
            .wrap_err_with(|| format!("Failed to open {}", payload_path.display()))?;
        file.seek(SeekFrom::Start(metadata.original_file_offset.unwrap_or(0)))?;
        Ok(Some(FileHit {
            file,
            outer_metadata: metadata.outer_metadata,
        }))
    }

    pub fn get_multi(&self, keys: &[&str]) -> Result<Vec<Option<FileHit>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    pub fn set(&self, key: &str, value: &mut FileValue) -> Result<()> {
        self.set_impl(key, value, PayloadKind::File)
    }

    fn set_impl(&self, key: &str, value: &mut FileValue, kind: PayloadKind) -> Result<()> {
        let now = SystemTime::now();
        self.prune()?;

        let original_file_offset = value.file.stream_position()?;
        let staged = if self.file_movable && value.source_path.is_some() {
            // unwrap rationale: is_some checked just above
            StagedPayload::Move(value.source_path.take().unwrap())
        } else {
            value.file.rewind()?;
            let mut tmp = NamedTempFile::new_in(self.layout.values_dir())?;
            let copied = copy_in_chunks(&mut value.file, tmp.as_file_mut());
            // the caller's stream position survives set, copy or no copy
            value.file.seek(SeekFrom::Start(original_file_offset))?;
            copied?;
            StagedPayload::Staged(tmp)
        };

        let metadata = Metadata {
            kind,
            original_file_offset: match kind {
                PayloadKind::File => Some(original_file_offset),
                PayloadKind::Value => None,
            },
            outer_metadata: value.outer_metadata.clone(),
        };
        let mut metadata_tmp = NamedTempFile::new_in(self.layout.values_dir())?;
        ciborium::ser::into_writer(&metadata, metadata_tmp.as_file_mut())
            .wrap_err("Failed to encode cache metadata")?;

        let payload_path = self.layout.payload_path(key);
        let metadata_path = self.layout.metadata_path(key);

        let lock = self.rw_lock(key)?;
        let _held = lock.lock()?;
        persist_tmp(metadata_tmp, &metadata_path)?;
        match staged {
            StagedPayload::Staged(tmp) => persist_tmp(tmp, &payload_path)?,
            StagedPayload::Move(source) => rename_or_copy(&source, &payload_path)?,
        }
        touch(&metadata_path, now)?;
        touch(&payload_path, now)?;
        Ok(())
    }

    pub fn set_multi(&self, entries: &mut [(&str, FileValue)]) -> Result<()> {
        for (key, value) in entries.iter_mut() {
            self.set(key, value)?;
        }
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let lock = self.rw_lock(key)?;
        let _held = lock.lock()?;
        self.delete_key_files(key);
        Ok(())
    }

    pub fn delete_multi(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }

    fn delete_key_files(&self, key: &str) {
        remove_or_warn(&self.layout.payload_path(key));
        remove_or_warn(&self.layout.metadata_path(key));
    }

    /// Non-blocking delete used by the pruner: keys whose lock is busy are
    /// left for a later pass rather than stalling the writer that triggered
    /// the prune.
    fn attempt_delete_key(&self, key: &str) -> Result<()> {
        let lock = self.rw_lock(key)?;
        if lock.acquire(false)? {
            self.delete_key_files(key);
            lock.release()?;
        }
        Ok(())
    }

    fn list_entries(&self) -> Result<HashMap<String, EntryStat>> {
        const SUFFIXES: &[&str] = &[PAYLOAD_SUFFIX, METADATA_SUFFIX, LEGACY_TYPE_SUFFIX];

        let values_dir = self.layout.values_dir();
        let mut stats: HashMap<String, Option<fs::Metadata>> = HashMap::new();
        for dirent in fs::read_dir(values_dir)
            .wrap_err_with(|| format!("Failed to list {}", values_dir.display()))?
        {
            let dirent = dirent?;
            let name = match dirent.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if !SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
                continue;
            }
            let stat = stat_or_warn(&dirent.path());
            stats.insert(name, stat);
        }

        let keys: HashSet<String> = stats
            .keys()
            .map(|name| strip_suffixes(name, SUFFIXES).to_owned())
            .collect();

        Ok(keys
            .into_iter()
            .map(|key| {
                let payload = stats.get(&format!("{key}{PAYLOAD_SUFFIX}"));
                let metadata = stats.get(&format!("{key}{METADATA_SUFFIX}"));
                let stat = EntryStat {
                    size: size_or_zero(payload.and_then(|s| s.as_ref()))
                        + size_or_zero(metadata.and_then(|s| s.as_ref())),
                    last_modified: last_modified_or_epoch(payload.and_then(|s| s.as_ref())),
                };
                (key, stat)
            })
            .collect())
    }

    /// TTL + LRU eviction pass. Runs at the start of every `set`, but is
    /// also safe to call explicitly at any time.
    pub fn prune(&self) -> Result<()> {
        let now = SystemTime::now();
        let mut entries = self.list_entries()?;

        if let Some(ttl) = self.expiration_time {
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, stat)| is_expired(stat.last_modified, ttl, now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                self.attempt_delete_key(&key)?;
                entries.remove(&key);
            }
        }

        let Some(cache_size) = self.cache_size else {
            return Ok(());
        };
        let mut by_newest: Vec<(String, EntryStat)> = entries.into_iter().collect();
        by_newest.sort_by(|a, b| b.1.last_modified.cmp(&a.1.last_modified));
        let mut total: u64 = by_newest.iter().map(|(_, stat)| stat.size).sum();
        // Each key is popped at most once whether or not its delete attempt
        // lands, so a fully locked cache cannot make this spin. Going
        // slightly over budget when everything left is busy is acceptable.
        while total > cache_size {
            let Some((key, stat)) = by_newest.pop() else {
                break;
            };
            self.attempt_delete_key(&key)?;
            total -= stat.size;
        }
        Ok(())
    }
}

/// Wrapper backend storing any serde-serializable value: `set` encodes into
/// a temp file it owns and hands that to the raw backend as a movable file,
/// `get` decodes the raw payload.
#[derive(Debug)]
pub struct GenericFsBackend {
    raw: RawFsBackend,
}

impl GenericFsBackend {
    pub fn new(config: CacheConfig) -> Result<GenericFsBackend> {
        // the temp files handed down are ours, so they are always movable
        let config = CacheConfig {
            file_movable: true,
            ..config
        };
        Ok(GenericFsBackend {
            raw: RawFsBackend::new(config)?,
        })
    }

    pub fn key_mangler(key: &str) -> String {
        hash::key_identifier(key)
    }

    pub fn values_dir(&self) -> &Path {
        self.raw.values_dir()
    }

    pub fn get_mutex(&self, key: &str) -> Result<Option<Arc<RangedLock>>> {
        self.raw.get_mutex(key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(hit) = self.raw.get(key)? else {
            return Ok(None);
        };
        let value = ciborium::de::from_reader(hit.file).wrap_err("Corrupt cache value")?;
        Ok(Some(value))
    }

    pub fn get_multi<T: DeserializeOwned>(&self, keys: &[&str]) -> Result<Vec<Option<T>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(self.raw.values_dir())?;
        ciborium::ser::into_writer(value, tmp.as_file_mut())
            .wrap_err("Failed to encode cache value")?;
        tmp.as_file_mut().rewind()?;

        let (file, temp_path) = tmp.into_parts();
        let path = temp_path
            .keep()
            .wrap_err("Failed to detach cache temp file")?;
        let mut staged = FileValue::movable(file, path.clone());
        let result = self.raw.set_impl(key, &mut staged, PayloadKind::Value);
        if result.is_err() {
            remove_or_warn(&path);
        }
        result
    }

    pub fn set_multi<T: Serialize>(&self, entries: &[(&str, T)]) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.raw.delete(key)
    }

    pub fn delete_multi(&self, keys: &[&str]) -> Result<()> {
        self.raw.delete_multi(keys)
    }

    pub fn prune(&self) -> Result<()> {
        self.raw.prune()
    }
}

#[derive(Debug, Clone, Copy)]
struct EntryStat {
    size: u64,
    last_modified: SystemTime,
}

fn read_metadata(path: &Path) -> Result<Metadata> {
    let file =
        File::open(path).wrap_err_with(|| format!("Failed to open {}", path.display()))?;
    ciborium::de::from_reader(file)
        .wrap_err_with(|| format!("Corrupt cache metadata in {}", path.display()))
}

fn persist_tmp(tmp: NamedTempFile, path: &Path) -> Result<()> {
    tmp.persist(path)
        .wrap_err_with(|| format!("Failed to move cache file into place at {}", path.display()))?;
    Ok(())
}

/// Rename a caller-provided movable file into the cache. The caller's file
/// may live on another filesystem, where rename is impossible; copy and
/// delete is the non-atomic fallback, safe because we hold the write lock.
fn rename_or_copy(source: &Path, dest: &Path) -> Result<()> {
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(source, dest).wrap_err_with(|| {
                format!(
                    "Failed to copy {} into cache at {}",
                    source.display(),
                    dest.display()
                )
            })?;
            remove_or_warn(source);
            Ok(())
        }
        Err(err) => Err(err).wrap_err_with(|| {
            format!(
                "Failed to move {} into cache at {}",
                source.display(),
                dest.display()
            )
        }),
    }
}

fn copy_in_chunks(source: &mut File, dest: &mut File) -> Result<()> {
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        match source.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => dest.write_all(&buf[..n])?,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

fn touch(path: &Path, when: SystemTime) -> Result<()> {
    let since_epoch = when.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let stamp = TimeVal::new(
        since_epoch.as_secs() as libc::time_t,
        since_epoch.subsec_micros() as libc::suseconds_t,
    );
    utimes(path, &stamp, &stamp)
        .wrap_err_with(|| format!("Failed to set mtime on {}", path.display()))
}

fn remove_or_warn(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() == io::ErrorKind::NotFound {
            debug!("Already removed: {}", path.display());
        } else {
            warn!("Cannot remove file {}: {err}", path.display());
        }
    }
}

fn stat_or_warn(path: &Path) -> Option<fs::Metadata> {
    match fs::metadata(path) {
        Ok(stat) => Some(stat),
        Err(err) => {
            warn!("Cannot stat file {}: {err}", path.display());
            None
        }
    }
}

fn size_or_zero(stat: Option<&fs::Metadata>) -> u64 {
    stat.map(|stat| stat.len()).unwrap_or(0)
}

fn last_modified_or_epoch(stat: Option<&fs::Metadata>) -> SystemTime {
    stat.and_then(|stat| stat.modified().ok()).unwrap_or(UNIX_EPOCH)
}

fn is_expired(last_modified: SystemTime, ttl: Duration, now: SystemTime) -> bool {
    match now.duration_since(last_modified) {
        Ok(age) => age > ttl,
        // an mtime in the future counts as fresh
        Err(_) => false,
    }
}

fn strip_suffixes<'a>(name: &'a str, suffixes: &[&str]) -> &'a str {
    for suffix in suffixes {
        if let Some(stripped) = name.strip_suffix(suffix) {
            return stripped;
        }
    }
    name
}
