use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use pattern_memory_core::{CacheRecord, PatternError, PatternId, PatternRecord, PendingClarification};
use ulid::Ulid;

const MEMORIES_DIR: &str = "memories";
const CACHE_DIR: &str = "external-cache";
const PENDING_DIR: &str = "pending";
const TMP_PREFIX: &str = ".tmp-";
const RECORD_EXT: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("record validation failed: {0}")]
    Validation(#[from] PatternError),
    #[error("invalid namespace segment `{0}`: only ASCII alphanumerics, `-`, `_` are allowed")]
    Namespace(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt { path: path.to_path_buf(), reason: reason.into() }
    }
}

/// File-backed durable store: one JSON document per record, made visible by
/// an atomic rename so a reader never observes a partially written file.
#[derive(Debug)]
pub struct FsStore {
    memories_dir: PathBuf,
    cache_dir: PathBuf,
    pending_dir: PathBuf,
}

impl FsStore {
    /// Open (and create if needed) the store's directory tree under `root`.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when a namespace directory cannot be created.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let memories_dir = root.join(MEMORIES_DIR);
        let cache_dir = root.join(CACHE_DIR);
        let pending_dir = root.join(PENDING_DIR);

        for dir in [&memories_dir, &cache_dir, &pending_dir] {
            fs::create_dir_all(dir).map_err(|source| StoreError::io(dir, source))?;
        }

        Ok(Self { memories_dir, cache_dir, pending_dir })
    }

    fn pattern_path(&self, id: PatternId) -> PathBuf {
        self.memories_dir.join(format!("{id}.{RECORD_EXT}"))
    }

    /// Persist one validated pattern record with all-or-nothing visibility.
    ///
    /// # Errors
    /// Returns [`StoreError::Validation`] when the record is malformed, or
    /// [`StoreError::Io`] when the temp write or rename fails.
    pub fn put_pattern(&self, record: &PatternRecord) -> Result<(), StoreError> {
        record.validate()?;
        let bytes = serialize_pretty(record, &self.pattern_path(record.id))?;
        write_atomic(&self.memories_dir, &self.pattern_path(record.id), &bytes)
    }

    /// Load one pattern record by id. A missing file is `Ok(None)`; a file
    /// that cannot be parsed or fails validation is [`StoreError::Corrupt`].
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] or [`StoreError::Corrupt`] as above.
    pub fn get_pattern(&self, id: PatternId) -> Result<Option<PatternRecord>, StoreError> {
        let path = self.pattern_path(id);
        let body = match fs::read_to_string(&path) {
            Ok(body) => body,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::io(&path, source)),
        };

        let record = parse_pattern(&path, &body)?;
        if record.id != id {
            return Err(StoreError::corrupt(
                &path,
                format!("record id {} does not match file name", record.id),
            ));
        }
        Ok(Some(record))
    }

    /// Lazy, restartable walk over every stored pattern record. Corrupt
    /// entries are yielded as `Err` so the caller can report the anomaly;
    /// in-flight temp files are invisible.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when the record directory cannot be read.
    pub fn scan_patterns(&self) -> Result<PatternScan, StoreError> {
        let entries = fs::read_dir(&self.memories_dir)
            .map_err(|source| StoreError::io(&self.memories_dir, source))?;
        Ok(PatternScan { entries })
    }

    /// Scan restricted by a cheap record predicate (category equality and the
    /// like). Corrupt entries still surface as `Err` so the anomaly is never
    /// hidden by the filter.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when the record directory cannot be read.
    pub fn scan_patterns_where<F>(&self, predicate: F) -> Result<FilteredPatternScan<F>, StoreError>
    where
        F: Fn(&PatternRecord) -> bool,
    {
        Ok(FilteredPatternScan { inner: self.scan_patterns()?, predicate })
    }

    fn consultation_dir(&self, source: &str, key: &str) -> Result<PathBuf, StoreError> {
        validate_namespace(source)?;
        validate_namespace(key)?;
        Ok(self.cache_dir.join(source).join(key))
    }

    /// Append a new consultation version under its derived key. Prior
    /// versions are never touched: a fresh store supersedes, it does not
    /// delete.
    ///
    /// # Errors
    /// Returns [`StoreError::Namespace`] for a malformed source or key, or
    /// [`StoreError::Io`] when the write fails.
    pub fn put_consultation(&self, key: &str, record: &CacheRecord) -> Result<(), StoreError> {
        let dir = self.consultation_dir(&record.source, key)?;
        fs::create_dir_all(&dir).map_err(|source| StoreError::io(&dir, source))?;

        let path = dir.join(format!("{}.{RECORD_EXT}", Ulid::new()));
        let bytes = serialize_pretty(record, &path)?;
        write_atomic(&dir, &path, &bytes)
    }

    /// Newest stored consultation for a derived key, or `None` when the key
    /// has never been answered.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] or [`StoreError::Corrupt`] when a version
    /// file cannot be read or parsed.
    pub fn latest_consultation(
        &self,
        source: &str,
        key: &str,
    ) -> Result<Option<CacheRecord>, StoreError> {
        let dir = self.consultation_dir(source, key)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::io(&dir, source)),
        };

        let mut latest: Option<(VersionOrder, CacheRecord)> = None;
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::io(&dir, source))?;
            let path = entry.path();
            let Some(name) = record_file_name(&path) else { continue };

            let record = read_cache_file(&path)?;
            let order_key = VersionOrder { timestamp: record.timestamp, name: name.to_string() };
            let newer = match &latest {
                Some((current, _)) => order_key > *current,
                None => true,
            };
            if newer {
                latest = Some((order_key, record));
            }
        }

        Ok(latest.map(|(_, record)| record))
    }

    /// Lazy walk over every consultation version across all source
    /// namespaces, oldest directories first as the filesystem yields them.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when the cache root cannot be read.
    pub fn scan_consultations(&self) -> Result<CacheScan, StoreError> {
        let entries =
            fs::read_dir(&self.cache_dir).map_err(|source| StoreError::io(&self.cache_dir, source))?;
        Ok(CacheScan { stack: vec![entries] })
    }

    fn pending_path(&self, pending_id: &str) -> Result<PathBuf, StoreError> {
        validate_namespace(pending_id)?;
        Ok(self.pending_dir.join(format!("{pending_id}.{RECORD_EXT}")))
    }

    /// Park an unresolved clarification outside the record namespace.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when the write fails.
    pub fn put_pending(&self, pending: &PendingClarification) -> Result<(), StoreError> {
        let path = self.pending_path(&pending.pending_id)?;
        let bytes = serialize_pretty(pending, &path)?;
        write_atomic(&self.pending_dir, &path, &bytes)
    }

    /// # Errors
    /// Returns [`StoreError::Io`] or [`StoreError::Corrupt`] when the pending
    /// file exists but cannot be read or parsed.
    pub fn get_pending(&self, pending_id: &str) -> Result<Option<PendingClarification>, StoreError> {
        let path = self.pending_path(pending_id)?;
        let body = match fs::read_to_string(&path) {
            Ok(body) => body,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::io(&path, source)),
        };

        let pending = serde_json::from_str::<PendingClarification>(&body)
            .map_err(|err| StoreError::corrupt(&path, err.to_string()))?;
        Ok(Some(pending))
    }

    /// Drop a clarification once it has been resolved. Resolution is the only
    /// deletion in the store; records themselves are never removed.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when the file exists but cannot be removed.
    pub fn remove_pending(&self, pending_id: &str) -> Result<(), StoreError> {
        let path = self.pending_path(pending_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::io(&path, source)),
        }
    }

    /// All parked clarifications, for scope-blocking checks and listings.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] or [`StoreError::Corrupt`] on unreadable
    /// pending files.
    pub fn list_pending(&self) -> Result<Vec<PendingClarification>, StoreError> {
        let entries = fs::read_dir(&self.pending_dir)
            .map_err(|source| StoreError::io(&self.pending_dir, source))?;

        let mut pending = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::io(&self.pending_dir, source))?;
            let path = entry.path();
            if record_file_name(&path).is_none() {
                continue;
            }
            let body =
                fs::read_to_string(&path).map_err(|source| StoreError::io(&path, source))?;
            let parsed = serde_json::from_str::<PendingClarification>(&body)
                .map_err(|err| StoreError::corrupt(&path, err.to_string()))?;
            pending.push(parsed);
        }

        pending.sort_by(|lhs, rhs| lhs.pending_id.cmp(&rhs.pending_id));
        Ok(pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct VersionOrder {
    timestamp: time::OffsetDateTime,
    name: String,
}

pub struct PatternScan {
    entries: fs::ReadDir,
}

impl Iterator for PatternScan {
    type Item = Result<PatternRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(source) => {
                    return Some(Err(StoreError::Io { path: PathBuf::new(), source }));
                }
            };

            let path = entry.path();
            if record_file_name(&path).is_none() {
                continue;
            }

            let body = match fs::read_to_string(&path) {
                Ok(body) => body,
                Err(source) => return Some(Err(StoreError::io(&path, source))),
            };
            return Some(parse_pattern(&path, &body));
        }
    }
}

pub struct FilteredPatternScan<F> {
    inner: PatternScan,
    predicate: F,
}

impl<F> Iterator for FilteredPatternScan<F>
where
    F: Fn(&PatternRecord) -> bool,
{
    type Item = Result<PatternRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(record) if (self.predicate)(&record) => return Some(Ok(record)),
                Ok(_) => {}
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

pub struct CacheScan {
    stack: Vec<fs::ReadDir>,
}

impl Iterator for CacheScan {
    type Item = Result<CacheRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let reader = self.stack.last_mut()?;
            let Some(entry) = reader.next() else {
                self.stack.pop();
                continue;
            };

            let entry = match entry {
                Ok(entry) => entry,
                Err(source) => {
                    return Some(Err(StoreError::Io { path: PathBuf::new(), source }));
                }
            };

            let path = entry.path();
            if path.is_dir() {
                match fs::read_dir(&path) {
                    Ok(next_reader) => self.stack.push(next_reader),
                    Err(source) => return Some(Err(StoreError::io(&path, source))),
                }
                continue;
            }

            if record_file_name(&path).is_none() {
                continue;
            }
            return Some(read_cache_file(&path));
        }
    }
}

fn validate_namespace(value: &str) -> Result<(), StoreError> {
    let valid = !value.is_empty()
        && value.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::Namespace(value.to_string()))
    }
}

fn record_file_name(path: &Path) -> Option<&str> {
    let name = path.file_name().and_then(OsStr::to_str)?;
    if name.starts_with(TMP_PREFIX) {
        return None;
    }
    let stem = name.strip_suffix(".json")?;
    if stem.is_empty() {
        return None;
    }
    Some(stem)
}

fn serialize_pretty<T: serde::Serialize>(value: &T, path: &Path) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(value).map_err(|err| StoreError::corrupt(path, err.to_string()))
}

/// Temp-write, fsync, then a single rename into the final path. A crash
/// before the rename leaves only an ignorable temp file; a crash after it
/// leaves the complete new document.
fn write_atomic(dir: &Path, final_path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp_path = dir.join(format!("{TMP_PREFIX}{}", Ulid::new()));
    let result = write_then_rename(&tmp_path, final_path, bytes);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_then_rename(tmp_path: &Path, final_path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = File::create(tmp_path).map_err(|source| StoreError::io(tmp_path, source))?;
    file.write_all(bytes).map_err(|source| StoreError::io(tmp_path, source))?;
    file.sync_all().map_err(|source| StoreError::io(tmp_path, source))?;
    drop(file);
    fs::rename(tmp_path, final_path).map_err(|source| StoreError::io(final_path, source))
}

fn parse_pattern(path: &Path, body: &str) -> Result<PatternRecord, StoreError> {
    let record = serde_json::from_str::<PatternRecord>(body).map_err(|err| {
        tracing::warn!(path = %path.display(), error = %err, "unparseable pattern record");
        StoreError::corrupt(path, err.to_string())
    })?;

    if let Err(err) = record.validate() {
        tracing::warn!(path = %path.display(), error = %err, "stored pattern record fails validation");
        return Err(StoreError::corrupt(path, err.to_string()));
    }

    Ok(record)
}

fn read_cache_file(path: &Path) -> Result<CacheRecord, StoreError> {
    let body = fs::read_to_string(path).map_err(|source| StoreError::io(path, source))?;
    serde_json::from_str::<CacheRecord>(&body).map_err(|err| {
        tracing::warn!(path = %path.display(), error = %err, "unparseable consultation record");
        StoreError::corrupt(path, err.to_string())
    })
}
