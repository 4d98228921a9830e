//! File-backed coordination store
//!
//! Three JSON collections (work, agents, coordination log) plus append-only
//! JSONL logs, all guarded by advisory file locks on `{name}.lock` sidecars
//! so short-lived CLI processes and the long-running coordinator share state
//! safely. Writes go through temp-file + rename with fsync of both the file
//! and its directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::config::CoordinationConfig;
use crate::{CancelToken, SwarmError, SwarmResult};

/// ISO-8601 UTC timestamps with millisecond precision, the persisted format
/// for every human-readable time field.
pub mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Optional variant of [`iso_millis`]; absent fields are omitted, never null.
pub mod iso_millis_opt {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        dt: &Option<DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match dt {
            Some(dt) => s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Named collections, in lock-acquisition order. Callers needing several
/// collections at once acquire them in this order: work, then agents, then
/// the coordination log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Collection {
    Work,
    Agents,
    Log,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Work => "work_claims",
            Collection::Agents => "agent_status",
            Collection::Log => "coordination_log",
        }
    }

    fn file_name(&self) -> &'static str {
        match self {
            Collection::Work => "work_claims.json",
            Collection::Agents => "agent_status.json",
            Collection::Log => "coordination_log.json",
        }
    }
}

/// Outcome of a JSONL archival pass.
#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub archived: usize,
    pub retained: usize,
    pub archive_path: PathBuf,
}

/// Locked persistence over the coordination directory.
///
/// The store exclusively owns mutable access to the collections; components
/// read snapshots by copy and mutate through [`Store::update`] /
/// [`Store::update_pair`].
pub struct Store {
    root: PathBuf,
    lock_timeout: Duration,
}

impl Store {
    pub fn open(config: &CoordinationConfig) -> SwarmResult<Self> {
        let root = config.coordination_dir.clone();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join("backups"))?;
        fs::create_dir_all(root.join("archives"))?;
        Ok(Self {
            root,
            lock_timeout: config.lock_timeout,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_path(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.file_name())
    }

    pub fn spans_path(&self) -> PathBuf {
        self.root.join("telemetry_spans.jsonl")
    }

    pub fn fast_claims_path(&self) -> PathBuf {
        self.root.join("work_claims_fast.jsonl")
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.root.join("archives")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    /// Acquire the advisory lock for `label`, polling until `lock_timeout`.
    fn acquire(
        &self,
        lock_path: &Path,
        label: &str,
        exclusive: bool,
        cancel: &CancelToken,
    ) -> SwarmResult<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path)?;

        let started = Instant::now();
        let contended = fs2::lock_contended_error();
        loop {
            cancel.check()?;
            // Fully qualified: std::fs::File grew same-named inherent
            // locking methods with different signatures.
            let attempt = if exclusive {
                fs2::FileExt::try_lock_exclusive(&file)
            } else {
                fs2::FileExt::try_lock_shared(&file)
            };
            match attempt {
                Ok(()) => {
                    debug!(lock = label, exclusive, waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
                    return Ok(file);
                }
                Err(e)
                    if e.raw_os_error() == contended.raw_os_error()
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
            if started.elapsed() >= self.lock_timeout {
                return Err(SwarmError::LockTimeout {
                    collection: label.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }

    fn collection_lock_path(&self, collection: Collection) -> PathBuf {
        self.root.join(format!("{}.lock", collection.name()))
    }

    /// Sidecar lock for an append-only log file; the sidecar itself is never
    /// renamed, so archival and appends serialize on a stable inode.
    fn jsonl_lock_path(&self, path: &Path) -> PathBuf {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("jsonl");
        path.with_file_name(format!("{stem}.lock"))
    }

    fn load<E: DeserializeOwned>(&self, collection: Collection) -> SwarmResult<Vec<E>> {
        let path = self.collection_path(collection);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&raw).map_err(|e| SwarmError::StoreCorruption {
            collection: collection.name().to_string(),
            detail: e.to_string(),
        })
    }

    /// Crash-safe replacement of a collection file: write to a temp sibling,
    /// fsync it, rename over the primary, fsync the directory.
    fn write_atomic<E: Serialize>(&self, path: &Path, items: &[E]) -> SwarmResult<()> {
        let payload = serde_json::to_vec_pretty(items)
            .map_err(|e| SwarmError::Internal(format!("serialize collection: {e}")))?;
        self.write_atomic_bytes(path, &payload)
    }

    fn write_atomic_bytes(&self, path: &Path, payload: &[u8]) -> SwarmResult<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let tmp = dir.join(format!(
            ".{}.tmp.{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("collection"),
            std::process::id()
        ));

        {
            let mut file = File::create(&tmp)?;
            file.write_all(payload)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Ok(dir_handle) = File::open(dir) {
            let _ = dir_handle.sync_all();
        }
        Ok(())
    }

    /// Shared-mode snapshot read: overlapping readers allowed, no write-back.
    pub fn read<E, T>(
        &self,
        collection: Collection,
        cancel: &CancelToken,
        f: impl FnOnce(&[E]) -> T,
    ) -> SwarmResult<T>
    where
        E: DeserializeOwned,
    {
        let _lock = self.acquire(
            &self.collection_lock_path(collection),
            collection.name(),
            false,
            cancel,
        )?;
        let items = self.load::<E>(collection)?;
        Ok(f(&items))
    }

    /// Exclusive read-modify-write over one collection. The closure mutates
    /// the in-memory snapshot; the whole collection is rewritten atomically
    /// on success. On any error the primary file is untouched.
    #[instrument(skip_all, fields(collection = collection.name()))]
    pub fn update<E, T>(
        &self,
        collection: Collection,
        cancel: &CancelToken,
        f: impl FnOnce(&mut Vec<E>) -> SwarmResult<T>,
    ) -> SwarmResult<T>
    where
        E: Serialize + DeserializeOwned,
    {
        let _lock = self.acquire(
            &self.collection_lock_path(collection),
            collection.name(),
            true,
            cancel,
        )?;
        let mut items = self.load::<E>(collection)?;
        let result = f(&mut items)?;
        self.write_atomic(&self.collection_path(collection), &items)?;
        Ok(result)
    }

    /// Exclusive read-modify-write over two collections, locks taken in the
    /// fixed work -> agents -> log order to stay deadlock-free.
    pub fn update_pair<A, B, T>(
        &self,
        first: Collection,
        second: Collection,
        cancel: &CancelToken,
        f: impl FnOnce(&mut Vec<A>, &mut Vec<B>) -> SwarmResult<T>,
    ) -> SwarmResult<T>
    where
        A: Serialize + DeserializeOwned,
        B: Serialize + DeserializeOwned,
    {
        debug_assert!(first < second, "collections must be locked in order");
        let _first_lock = self.acquire(
            &self.collection_lock_path(first),
            first.name(),
            true,
            cancel,
        )?;
        let _second_lock = self.acquire(
            &self.collection_lock_path(second),
            second.name(),
            true,
            cancel,
        )?;
        let mut first_items = self.load::<A>(first)?;
        let mut second_items = self.load::<B>(second)?;
        let result = f(&mut first_items, &mut second_items)?;
        self.write_atomic(&self.collection_path(first), &first_items)?;
        self.write_atomic(&self.collection_path(second), &second_items)?;
        Ok(result)
    }

    /// Append one compact JSON record plus trailing newline to a JSONL log,
    /// serialized against concurrent appenders and archival by the sidecar
    /// lock.
    pub fn append_jsonl<E: Serialize>(
        &self,
        path: &Path,
        entry: &E,
        cancel: &CancelToken,
    ) -> SwarmResult<()> {
        let label = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("jsonl");
        let _lock = self.acquire(&self.jsonl_lock_path(path), label, true, cancel)?;

        let mut line = serde_json::to_vec(entry)
            .map_err(|e| SwarmError::Internal(format!("serialize log entry: {e}")))?;
        line.push(b'\n');

        let mut file = OpenOptions::new().append(true).create(true).open(path)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    /// Number of records in a JSONL log; missing file counts as empty.
    pub fn jsonl_len(&self, path: &Path) -> SwarmResult<usize> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        Ok(BufReader::new(file).lines().count())
    }

    /// Parse every record of a JSONL log; malformed lines are skipped with a
    /// warning rather than poisoning the whole read.
    pub fn read_jsonl<E: DeserializeOwned>(&self, path: &Path) -> SwarmResult<Vec<E>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping malformed jsonl record"),
            }
        }
        Ok(records)
    }

    /// Split the oldest records of a JSONL log into a timestamped archive
    /// file, retaining the newest `retain` lines in the primary.
    pub fn archive_jsonl(
        &self,
        path: &Path,
        archive_stem: &str,
        retain: usize,
        cancel: &CancelToken,
    ) -> SwarmResult<ArchiveOutcome> {
        let label = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("jsonl");
        let _lock = self.acquire(&self.jsonl_lock_path(path), label, true, cancel)?;

        let lines: Vec<String> = match File::open(path) {
            Ok(f) => BufReader::new(f).lines().collect::<Result<_, _>>()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let archive_path = self.archives_dir().join(format!(
            "{}_{}.jsonl",
            archive_stem,
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        ));

        if lines.len() <= retain {
            return Ok(ArchiveOutcome {
                archived: 0,
                retained: lines.len(),
                archive_path,
            });
        }

        let split = lines.len() - retain;
        {
            let mut archive = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&archive_path)?;
            for line in &lines[..split] {
                archive.write_all(line.as_bytes())?;
                archive.write_all(b"\n")?;
            }
            archive.sync_all()?;
        }

        // Primary rewrite goes through the same temp+rename discipline.
        let dir = path.parent().unwrap_or(&self.root);
        let tmp = dir.join(format!(".{label}.tmp.{}", std::process::id()));
        {
            let mut file = File::create(&tmp)?;
            for line in &lines[split..] {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Ok(dir_handle) = File::open(dir) {
            let _ = dir_handle.sync_all();
        }

        Ok(ArchiveOutcome {
            archived: split,
            retained: retain,
            archive_path,
        })
    }

    /// Copy a collection's primary file into `backups/` before a mutation
    /// cycle. Missing primaries (nothing persisted yet) are not an error.
    pub fn backup_collection(&self, collection: Collection) -> SwarmResult<Option<PathBuf>> {
        let primary = self.collection_path(collection);
        if !primary.exists() {
            return Ok(None);
        }
        let backup = self.backups_dir().join(format!(
            "{}_{}.json",
            collection.name(),
            chrono::Utc::now().format("%Y%m%d%H%M%S%3f")
        ));
        fs::copy(&primary, &backup)?;
        Ok(Some(backup))
    }

    /// Persist a standalone JSON report (health, metrics) under the root.
    pub fn write_report<E: Serialize>(&self, file_name: &str, report: &E) -> SwarmResult<PathBuf> {
        let path = self.root.join(file_name);
        let payload = serde_json::to_vec_pretty(report)
            .map_err(|e| SwarmError::Internal(format!("serialize report: {e}")))?;
        self.write_atomic_bytes(&path, &payload)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Row {
        id: String,
        n: u32,
    }

    fn store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let config = CoordinationConfig::new(dir.path());
        let store = Store::open(&config).unwrap();
        (dir, store)
    }

    #[test]
    fn update_roundtrips_through_disk() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();

        store
            .update::<Row, _>(Collection::Work, &cancel, |rows| {
                rows.push(Row { id: "a".into(), n: 1 });
                Ok(())
            })
            .unwrap();

        let rows = store
            .read::<Row, _>(Collection::Work, &cancel, |rows| rows.to_vec())
            .unwrap();
        assert_eq!(rows, vec![Row { id: "a".into(), n: 1 }]);
    }

    #[test]
    fn missing_collection_reads_empty() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();
        let len = store
            .read::<Row, _>(Collection::Agents, &cancel, |rows| rows.len())
            .unwrap();
        assert_eq!(len, 0);
    }

    #[test]
    fn corrupt_collection_refuses_writes() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();
        fs::write(store.collection_path(Collection::Work), b"{not json").unwrap();

        let err = store
            .update::<Row, _>(Collection::Work, &cancel, |rows| {
                rows.push(Row { id: "x".into(), n: 0 });
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, SwarmError::StoreCorruption { .. }));

        // Primary untouched by the refused write.
        let raw = fs::read(store.collection_path(Collection::Work)).unwrap();
        assert_eq!(raw, b"{not json");
    }

    #[test]
    fn failed_mutation_leaves_primary_untouched() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();
        store
            .update::<Row, _>(Collection::Work, &cancel, |rows| {
                rows.push(Row { id: "keep".into(), n: 1 });
                Ok(())
            })
            .unwrap();

        let err = store
            .update::<Row, _>(Collection::Work, &cancel, |rows| {
                rows.clear();
                Err::<(), _>(SwarmError::Internal("boom".into()))
            })
            .unwrap_err();
        assert!(matches!(err, SwarmError::Internal(_)));

        let rows = store
            .read::<Row, _>(Collection::Work, &cancel, |rows| rows.to_vec())
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn jsonl_append_and_count() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();
        let path = store.spans_path();
        for n in 0..5 {
            store
                .append_jsonl(&path, &Row { id: format!("r{n}"), n }, &cancel)
                .unwrap();
        }
        assert_eq!(store.jsonl_len(&path).unwrap(), 5);
        let rows: Vec<Row> = store.read_jsonl(&path).unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[4].n, 4);
    }

    #[test]
    fn jsonl_archival_splits_oldest() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();
        let path = store.spans_path();
        for n in 0..120u32 {
            store
                .append_jsonl(&path, &Row { id: format!("r{n}"), n }, &cancel)
                .unwrap();
        }

        let outcome = store
            .archive_jsonl(&path, "telemetry_archive", 20, &cancel)
            .unwrap();
        assert_eq!(outcome.archived, 100);
        assert_eq!(outcome.retained, 20);
        assert_eq!(store.jsonl_len(&path).unwrap(), 20);
        assert_eq!(store.jsonl_len(&outcome.archive_path).unwrap(), 100);

        // Newest records survive in the primary.
        let rows: Vec<Row> = store.read_jsonl(&path).unwrap();
        assert_eq!(rows.first().unwrap().n, 100);
        assert_eq!(rows.last().unwrap().n, 119);
    }

    #[test]
    fn cancelled_token_aborts_lock_wait() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = store
            .read::<Row, _>(Collection::Work, &cancel, |rows| rows.len())
            .unwrap_err();
        assert!(matches!(err, SwarmError::Cancelled));
    }

    #[test]
    fn backup_copies_primary() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();
        assert!(store.backup_collection(Collection::Work).unwrap().is_none());

        store
            .update::<Row, _>(Collection::Work, &cancel, |rows| {
                rows.push(Row { id: "a".into(), n: 1 });
                Ok(())
            })
            .unwrap();
        let backup = store.backup_collection(Collection::Work).unwrap().unwrap();
        assert!(backup.exists());
    }
}
