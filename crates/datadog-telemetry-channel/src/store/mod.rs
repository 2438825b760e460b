// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk-backed overflow for transmissions that cannot be sent right away.
//!
//! Every transmission is one file in the store directory. Files are written
//! under a `.tmp` name and renamed once complete, so a crash never leaves a
//! half-written `.trn` file behind. Names start with a zero-padded timestamp
//! and sequence number, which makes lexicographic order creation order.
//!
//! Reading goes through leases. [`PersistentStore::peek`] claims the oldest
//! unclaimed file; the claim lives in memory only, so a process that dies
//! while holding it simply leaves the file for the next run. Committing a
//! lease deletes the file, dropping it makes the file visible again.

pub mod fs;

use crate::error::StoreError;
use crate::transmission::Transmission;
use fs::{FileSystem, LocalFileSystem};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const STORED_EXTENSION: &str = "trn";
pub const TEMP_EXTENSION: &str = "tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub max_files: usize,
    pub capacity_bytes: u64,
    /// Timeout given to transmissions read back from disk.
    pub transmission_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_files: 5000,
            capacity_bytes: 50 * 1024 * 1024,
            transmission_timeout: Duration::from_secs(100),
        }
    }
}

#[derive(Debug)]
struct IndexEntry {
    len: u64,
    leased: bool,
}

#[derive(Debug, Default)]
struct StoreIndex {
    entries: BTreeMap<String, IndexEntry>,
    total_bytes: u64,
}

impl StoreIndex {
    fn insert(&mut self, name: String, len: u64) {
        self.put(name, IndexEntry { len, leased: false });
    }

    /// Counts an entry against the quotas before its file exists.
    fn reserve(&mut self, name: String, len: u64) {
        self.put(name, IndexEntry { len, leased: true });
    }

    fn put(&mut self, name: String, entry: IndexEntry) {
        let len = entry.len;
        if let Some(previous) = self.entries.insert(name, entry) {
            self.total_bytes -= previous.len;
        }
        self.total_bytes += len;
    }

    fn remove(&mut self, name: &str) {
        if let Some(entry) = self.entries.remove(name) {
            self.total_bytes -= entry.len;
        }
    }
}

struct StoreInner {
    dir: PathBuf,
    fs: Arc<dyn FileSystem>,
    config: StoreConfig,
    index: Mutex<StoreIndex>,
    sequence: AtomicU64,
    dropped: AtomicU64,
}

impl StoreInner {
    fn index(&self) -> MutexGuard<'_, StoreIndex> {
        #[allow(clippy::expect_used)]
        self.index.lock().expect("lock poisoned")
    }

    fn release(&self, name: &str) {
        if let Some(entry) = self.index().entries.get_mut(name) {
            entry.leased = false;
        }
    }
}

/// Shared handle to a store directory.
#[derive(Clone)]
pub struct PersistentStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStore")
            .field("dir", &self.inner.dir)
            .field("config", &self.inner.config)
            .field("files", &self.len())
            .finish_non_exhaustive()
    }
}

impl PersistentStore {
    /// Opens `dir`, creating it if needed. Leftover temporary files are purged
    /// and stored transmissions from earlier runs are indexed.
    pub fn open(
        dir: impl Into<PathBuf>,
        fs: Arc<dyn FileSystem>,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs.create_dir_all(&dir)?;

        let mut index = StoreIndex::default();
        let mut purged = 0;
        for entry in fs.list(&dir)? {
            match Path::new(&entry.name).extension().and_then(|ext| ext.to_str()) {
                Some(STORED_EXTENSION) => index.insert(entry.name, entry.len),
                Some(TEMP_EXTENSION) => {
                    if let Err(e) = fs.remove(&dir.join(&entry.name)) {
                        warn!("Failed to remove partial file {}: {}", entry.name, e);
                    } else {
                        purged += 1;
                    }
                }
                _ => {}
            }
        }

        debug!(
            "Opened telemetry store at {} with {} transmissions ({} bytes), purged {} partial files",
            dir.display(),
            index.entries.len(),
            index.total_bytes,
            purged
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                dir,
                fs,
                config,
                index: Mutex::new(index),
                sequence: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        })
    }

    pub fn open_local(dir: impl Into<PathBuf>, config: StoreConfig) -> Result<Self, StoreError> {
        Self::open(dir, Arc::new(LocalFileSystem), config)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Persists a transmission. Returns `Ok(false)` when the store is over its
    /// file or byte quota; the transmission is then dropped and counted.
    pub fn enqueue(&self, transmission: &Transmission) -> Result<bool, StoreError> {
        let inner = &self.inner;
        let name = self.file_name(transmission.id());
        let data = encode(transmission);

        // Reserve the slot as leased so peek skips it while the file is written.
        {
            let mut index = inner.index();
            if index.entries.len() >= inner.config.max_files
                || index.total_bytes >= inner.config.capacity_bytes
            {
                if inner.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!(
                        "Telemetry store is full ({} files, {} bytes), dropping transmissions",
                        index.entries.len(),
                        index.total_bytes
                    );
                }
                return Ok(false);
            }
            index.reserve(name.clone(), data.len() as u64);
        }

        if let Err(e) = self.write_file(&name, &data) {
            inner.index().remove(&name);
            return Err(e);
        }

        inner.release(&name);
        debug!("Stored transmission {}", transmission.id());
        Ok(true)
    }

    fn write_file(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        let inner = &self.inner;
        let temp_path = inner.dir.join(format!("{name}.{TEMP_EXTENSION}"));
        inner.fs.write(&temp_path, data)?;
        if let Err(e) = inner.fs.rename(&temp_path, &inner.dir.join(name)) {
            let _ = inner.fs.remove(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn file_name(&self, id: Uuid) -> String {
        let micros = chrono::Utc::now().timestamp_micros().max(0);
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed) % 100_000_000;
        format!("{micros:020}-{sequence:08}-{id}.{STORED_EXTENSION}")
    }

    /// Leases the oldest transmission nobody holds. Corrupt files are deleted;
    /// files that cannot be read right now are skipped for this call.
    pub fn peek(&self) -> Option<StoreEntry> {
        let inner = &self.inner;
        let mut unreadable: Vec<String> = Vec::new();
        loop {
            let name = {
                let mut index = inner.index();
                let (name, entry) = index
                    .entries
                    .iter_mut()
                    .find(|(name, entry)| !entry.leased && !unreadable.contains(*name))?;
                entry.leased = true;
                name.clone()
            };

            match self.load(&name) {
                Ok(transmission) => {
                    return Some(StoreEntry {
                        transmission,
                        lease: StoreLease {
                            store: Arc::clone(inner),
                            name,
                            committed: false,
                        },
                    });
                }
                Err(StoreError::Io(e)) if e.kind() != io::ErrorKind::NotFound => {
                    // Kept for a later peek, newer entries are tried meanwhile.
                    warn!("Failed to read stored transmission {}: {}", name, e);
                    inner.release(&name);
                    unreadable.push(name);
                }
                Err(e) => {
                    warn!("Discarding stored transmission {}: {}", name, e);
                    let _ = inner.fs.remove(&inner.dir.join(&name));
                    inner.index().remove(&name);
                }
            }
        }
    }

    fn load(&self, name: &str) -> Result<Transmission, StoreError> {
        let data = self.inner.fs.read(&self.inner.dir.join(name))?;
        decode(name, &data, self.inner.config.transmission_timeout)
    }

    /// Number of stored transmissions, leased or not.
    pub fn len(&self) -> usize {
        self.inner.index().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn leased(&self) -> usize {
        self.inner
            .index()
            .entries
            .values()
            .filter(|entry| entry.leased)
            .count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.index().total_bytes
    }

    /// Transmissions rejected because the store was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// A leased transmission read back from the store.
#[derive(Debug)]
pub struct StoreEntry {
    pub transmission: Transmission,
    pub lease: StoreLease,
}

impl StoreEntry {
    /// Moves the lease into the transmission, so it travels with it through
    /// the queue and the sender.
    pub fn into_transmission(self) -> Transmission {
        let Self {
            mut transmission,
            lease,
        } = self;
        transmission.attach_lease(lease);
        transmission
    }
}

/// Exclusive claim on a stored file. Dropping it without committing makes the
/// file available to the next [`PersistentStore::peek`].
pub struct StoreLease {
    store: Arc<StoreInner>,
    name: String,
    committed: bool,
}

impl StoreLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deletes the file. Consumes the lease, so a file is deleted at most once
    /// per lease.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.committed = true;
        let result = self.store.fs.remove(&self.store.dir.join(&self.name));
        self.store.index().remove(&self.name);
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(self.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Gives the file back without deleting it.
    pub fn release(self) {}
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        if !self.committed {
            self.store.release(&self.name);
        }
    }
}

impl fmt::Debug for StoreLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreLease")
            .field("name", &self.name)
            .field("committed", &self.committed)
            .finish()
    }
}

// Header lines (endpoint, content type, content encoding), an empty line, then
// the raw body.
fn encode(transmission: &Transmission) -> Vec<u8> {
    let header = format!(
        "{}\n{}\n{}\n\n",
        transmission.endpoint(),
        transmission.content_type(),
        transmission.content_encoding().unwrap_or_default()
    );
    let mut data = Vec::with_capacity(header.len() + transmission.size());
    data.extend_from_slice(header.as_bytes());
    data.extend_from_slice(transmission.content());
    data
}

fn decode(name: &str, data: &[u8], timeout: Duration) -> Result<Transmission, StoreError> {
    let corrupt = |reason: &str| StoreError::Corrupt {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let mut rest = data;
    let mut lines = Vec::with_capacity(3);
    for _ in 0..3 {
        let end = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| corrupt("truncated header"))?;
        let line = std::str::from_utf8(&rest[..end]).map_err(|_| corrupt("header is not utf-8"))?;
        lines.push(line);
        rest = &rest[end + 1..];
    }
    let body = rest
        .strip_prefix(b"\n")
        .ok_or_else(|| corrupt("missing header terminator"))?;

    let id = parse_id(name).ok_or_else(|| corrupt("file name carries no id"))?;
    let encoding = (!lines[2].is_empty()).then(|| lines[2].to_string());

    Transmission::new(lines[0], body.to_vec(), lines[1], encoding, timeout)
        .map(|transmission| transmission.with_id(id))
        .map_err(|e| corrupt(&e.to_string()))
}

fn parse_id(name: &str) -> Option<Uuid> {
    let stem = name.strip_suffix(&format!(".{STORED_EXTENSION}"))?;
    let id = stem.splitn(3, '-').nth(2)?;
    Uuid::parse_str(id).ok()
}

#[cfg(test)]
mod tests {
    use super::fs::MemoryFileSystem;
    use super::*;
    use bytes::Bytes;

    fn transmission(body: &str) -> Transmission {
        Transmission::new(
            "https://intake.example.com/api/v2/apmtelemetry",
            Bytes::from(body.to_string()),
            "application/x-json-stream",
            Some("zstd".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn memory_store(config: StoreConfig) -> (PersistentStore, Arc<MemoryFileSystem>) {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = PersistentStore::open("/store", fs.clone(), config).unwrap();
        (store, fs)
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let (store, _) = memory_store(StoreConfig::default());
        let original = transmission("payload");
        assert!(store.enqueue(&original).unwrap());

        let entry = store.peek().unwrap();
        let restored = &entry.transmission;
        assert_eq!(restored.id(), original.id());
        assert_eq!(restored.endpoint(), original.endpoint());
        assert_eq!(restored.content(), original.content());
        assert_eq!(restored.content_type(), original.content_type());
        assert_eq!(restored.content_encoding(), Some("zstd"));
        assert_eq!(restored.timeout(), Duration::from_secs(100));
    }

    #[test]
    fn test_lease_exclusivity() {
        let (store, _) = memory_store(StoreConfig::default());
        store.enqueue(&transmission("only")).unwrap();

        let first = store.peek().unwrap();
        assert!(store.peek().is_none());
        assert_eq!(store.leased(), 1);

        drop(first);
        let again = store.peek().unwrap();
        assert_eq!(again.transmission.content(), &Bytes::from("only"));
    }

    #[test]
    fn test_peek_and_commit_each_once() {
        let (store, fs) = memory_store(StoreConfig::default());
        let bodies: Vec<String> = (0..10).map(|i| format!("body-{i}")).collect();
        for body in &bodies {
            assert!(store.enqueue(&transmission(body)).unwrap());
        }

        let mut seen = Vec::new();
        while let Some(entry) = store.peek() {
            seen.push(String::from_utf8(entry.transmission.content().to_vec()).unwrap());
            entry.lease.commit().unwrap();
        }

        // Files are named in creation order.
        assert_eq!(seen, bodies);
        assert!(store.is_empty());
        assert_eq!(store.total_bytes(), 0);
        assert!(fs.paths().is_empty());
    }

    #[test]
    fn test_max_files() {
        let (store, _) = memory_store(StoreConfig {
            max_files: 1,
            ..Default::default()
        });
        assert!(store.enqueue(&transmission("first")).unwrap());
        assert!(!store.enqueue(&transmission("second")).unwrap());
        assert_eq!(store.dropped(), 1);

        let entry = store.peek().unwrap();
        assert_eq!(entry.transmission.content(), &Bytes::from("first"));
        assert!(store.peek().is_none());
    }

    #[test]
    fn test_capacity_bytes() {
        let (store, _) = memory_store(StoreConfig {
            capacity_bytes: 200,
            ..Default::default()
        });
        let first = transmission(&"a".repeat(300));
        assert!(store.enqueue(&first).unwrap());
        assert!(!store.enqueue(&transmission(&"b".repeat(300))).unwrap());

        let entry = store.peek().unwrap();
        assert_eq!(entry.transmission.id(), first.id());
        entry.lease.commit().unwrap();
        assert!(store.peek().is_none());
    }

    #[test]
    fn test_commit_missing_file() {
        let (store, fs) = memory_store(StoreConfig::default());
        store.enqueue(&transmission("gone")).unwrap();
        let entry = store.peek().unwrap();

        for path in fs.paths() {
            fs.remove(&path).unwrap();
        }

        assert!(matches!(entry.lease.commit(), Err(StoreError::NotFound(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupt_files_are_discarded() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.write(
            Path::new("/store/00000000000000000001-00000000-not-a-uuid.trn"),
            b"garbage",
        )
        .unwrap();

        let store = PersistentStore::open("/store", fs.clone(), StoreConfig::default()).unwrap();
        assert_eq!(store.len(), 1);
        store.enqueue(&transmission("valid")).unwrap();

        let entry = store.peek().unwrap();
        assert_eq!(entry.transmission.content(), &Bytes::from("valid"));
        assert_eq!(store.len(), 1);
        assert_eq!(fs.paths().len(), 1);
    }

    #[test]
    fn test_reopen_recovers_files_and_purges_temp() {
        let fs = Arc::new(MemoryFileSystem::new());
        {
            let store =
                PersistentStore::open("/store", fs.clone(), StoreConfig::default()).unwrap();
            store.enqueue(&transmission("survivor")).unwrap();
            // A lease held when the process dies does not outlive it.
            let entry = store.peek().unwrap();
            std::mem::forget(entry);
        }
        fs.write(Path::new("/store/partial.trn.tmp"), b"half").unwrap();

        let store = PersistentStore::open("/store", fs.clone(), StoreConfig::default()).unwrap();
        assert_eq!(fs.paths().len(), 1);
        let entry = store.peek().unwrap();
        assert_eq!(entry.transmission.content(), &Bytes::from("survivor"));
    }

    #[test]
    fn test_write_failure_is_reported() {
        let (store, fs) = memory_store(StoreConfig::default());
        fs.set_fail_writes(true);
        assert!(matches!(
            store.enqueue(&transmission("lost")),
            Err(StoreError::Io(_))
        ));
        assert!(store.is_empty());
        assert_eq!(store.total_bytes(), 0);
    }

    /// Memory filesystem that can deny reads of one file and that reports
    /// what the store looks like while a file is being written.
    #[derive(Debug, Default)]
    struct HookedFileSystem {
        inner: MemoryFileSystem,
        deny_read: Mutex<Option<String>>,
        store: std::sync::OnceLock<PersistentStore>,
        len_during_write: Mutex<Vec<usize>>,
    }

    impl FileSystem for HookedFileSystem {
        fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
            self.inner.create_dir_all(dir)
        }

        fn list(&self, dir: &Path) -> io::Result<Vec<fs::FileEntry>> {
            self.inner.list(dir)
        }

        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            let denied = self.deny_read.lock().unwrap().clone();
            if denied.is_some_and(|name| path.ends_with(name)) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            self.inner.read(path)
        }

        fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
            if let Some(store) = self.store.get() {
                // Would deadlock if the index lock were held across the write.
                self.len_during_write.lock().unwrap().push(store.len());
            }
            self.inner.write(path, data)
        }

        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            self.inner.rename(from, to)
        }

        fn remove(&self, path: &Path) -> io::Result<()> {
            self.inner.remove(path)
        }
    }

    fn hooked_store() -> (PersistentStore, Arc<HookedFileSystem>) {
        let fs = Arc::new(HookedFileSystem::default());
        let store = PersistentStore::open("/store", fs.clone(), StoreConfig::default()).unwrap();
        (store, fs)
    }

    #[test]
    fn test_unreadable_entry_does_not_block_newer_ones() {
        let (store, fs) = hooked_store();
        for body in ["oldest", "second", "third"] {
            store.enqueue(&transmission(body)).unwrap();
        }
        let oldest = fs.inner.paths()[0].file_name().unwrap().to_string_lossy().to_string();
        *fs.deny_read.lock().unwrap() = Some(oldest.clone());

        let mut delivered = Vec::new();
        while let Some(entry) = store.peek() {
            delivered.push(entry.transmission.content().clone());
            entry.lease.commit().unwrap();
        }
        assert_eq!(delivered, vec![Bytes::from("second"), Bytes::from("third")]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.leased(), 0);

        // Once readable again it is delivered.
        *fs.deny_read.lock().unwrap() = None;
        let entry = store.peek().unwrap();
        assert_eq!(entry.lease.name(), oldest);
        assert_eq!(entry.transmission.content(), &Bytes::from("oldest"));
    }

    #[test]
    fn test_file_io_runs_outside_index_lock() {
        let (store, fs) = hooked_store();
        fs.store.set(store.clone()).unwrap();

        store.enqueue(&transmission("first")).unwrap();
        store.enqueue(&transmission("second")).unwrap();

        // The slot being written is already counted, but not leasable.
        assert_eq!(*fs.len_during_write.lock().unwrap(), vec![1, 2]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.leased(), 0);
    }

    #[test]
    fn test_into_transmission_carries_lease() {
        let (store, _) = memory_store(StoreConfig::default());
        store.enqueue(&transmission("leased")).unwrap();

        let mut t = store.peek().unwrap().into_transmission();
        assert!(t.is_stored());
        assert!(store.peek().is_none());

        t.take_lease().unwrap().commit().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_decode_rejects_truncated_header() {
        let name = format!("00000000000000000001-00000000-{}.trn", Uuid::new_v4());
        assert!(matches!(
            decode(&name, b"https://host/\napplication/json", Duration::from_secs(1)),
            Err(StoreError::Corrupt { .. })
        ));
        assert!(decode(
            &name,
            b"https://host/\napplication/json\n\n\nbody",
            Duration::from_secs(1)
        )
        .is_ok());
    }
}
