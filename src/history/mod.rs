//! Content-addressed history store (§4.1).
//!
//! Dedup layer keyed by message-id: an in-memory, lock-striped hash index
//! rehydrated from an append-only on-disk log at startup, with a single
//! writer task serialising all `Add`s through a bounded queue so that
//! concurrent ingests of the same new message-id collapse to one winner.

pub mod log;

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use crate::config::{HISTORY_GROUP_COMMIT_INTERVAL_MS, HISTORY_WRITER_QUEUE_CAPACITY};
use crate::error::HistoryError;

/// Bucket count for the lock-striped in-memory index; bounds memory overhead
/// of the striping itself independent of message-id count or short-hash width.
const INDEX_BUCKET_COUNT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageKind {
    GroupShard = 0,
}

impl StorageKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(StorageKind::GroupShard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub kind: StorageKind,
    pub shard: String,
    pub key: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    NotFound,
    Found(Location),
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Ok,
    Duplicate,
}

struct WriteCmd {
    msgid: String,
    location: Location,
    respond: oneshot::Sender<Result<AddOutcome, HistoryError>>,
}

struct Bucket {
    entries: RwLock<HashMap<String, Location>>,
}

/// Short-hash prefix derived from the message-id's content digest, width in
/// hex nibbles. Locked at first use per §4.1 — see [`HistoryStore::open`].
pub fn short_hash(msgid: &str, width: u8) -> String {
    let digest = Sha256::digest(msgid.as_bytes());
    let hex = hex_encode(&digest);
    hex[..width as usize].to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

pub struct HistoryStore {
    buckets: Vec<Bucket>,
    in_flight: Mutex<HashSet<String>>,
    short_hash_width: u8,
    writer_tx: async_channel::Sender<WriteCmd>,
    writer_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    writer_closed: Arc<std::sync::atomic::AtomicBool>,
    entry_count: AtomicU64,
    log_path: PathBuf,
}

impl HistoryStore {
    /// Open (or create) the history store at `data_dir`, replaying the
    /// on-disk log to rehydrate the in-memory index. `requested_width` must
    /// match the width stored in the catalog on prior runs (§4.1, §8#6).
    pub async fn open(data_dir: &Path, requested_width: u8) -> Result<Arc<Self>, HistoryError> {
        if !(2..=7).contains(&requested_width) {
            return Err(HistoryError::ShortHashOutOfRange(requested_width));
        }

        std::fs::create_dir_all(data_dir).map_err(HistoryError::Io)?;
        let log_path = data_dir.join("history.log");

        let buckets: Vec<Bucket> = (0..INDEX_BUCKET_COUNT)
            .map(|_| Bucket {
                entries: RwLock::new(HashMap::new()),
            })
            .collect();

        let (writer_tx, writer_rx) = async_channel::bounded::<WriteCmd>(HISTORY_WRITER_QUEUE_CAPACITY);

        let store = Arc::new(HistoryStore {
            buckets,
            in_flight: Mutex::new(HashSet::new()),
            short_hash_width: requested_width,
            writer_tx,
            writer_handle: Mutex::new(None),
            writer_closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            entry_count: AtomicU64::new(0),
            log_path: log_path.clone(),
        });

        store.rehydrate(&log_path)?;
        store.spawn_writer(log_path, writer_rx);
        Ok(store)
    }

    /// Lock-stripe bucket for `msgid`: the low bits of its locked-width
    /// short-hash prefix, not an independently-computed digest, so the
    /// in-memory index partitions the same way the short-hash naming does.
    fn bucket_index(&self, msgid: &str) -> usize {
        let prefix = short_hash(msgid, self.short_hash_width);
        let n = u32::from_str_radix(&prefix, 16).unwrap_or(0);
        (n as usize) % INDEX_BUCKET_COUNT
    }

    fn rehydrate(&self, log_path: &Path) -> Result<(), HistoryError> {
        let file = match File::open(log_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(HistoryError::Io(e)),
        };
        let mut reader = BufReader::new(file);
        let mut count = 0u64;
        loop {
            match log::read_one(&mut reader)? {
                Some(record) => {
                    self.insert_into_index(&record.msgid, record.location);
                    count += 1;
                }
                None => break,
            }
        }
        self.entry_count.store(count, Ordering::Relaxed);
        tracing::info!(entries = count, "history log replayed");
        Ok(())
    }

    fn insert_into_index(&self, msgid: &str, location: Location) {
        let idx = self.bucket_index(msgid);
        let mut bucket = self.buckets[idx].entries.write().unwrap();
        bucket.insert(msgid.to_string(), location);
    }

    fn spawn_writer(self: &Arc<Self>, log_path: PathBuf, rx: async_channel::Receiver<WriteCmd>) {
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let file = match OpenOptions::new().create(true).append(true).open(&log_path) {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!(error = %e, "history writer failed to open log file, refusing writes");
                    store.writer_closed.store(true, Ordering::SeqCst);
                    return;
                }
            };
            let mut writer = BufWriter::new(file);
            let mut pending_fsync = 0usize;
            let mut last_fsync = tokio::time::Instant::now();

            while let Ok(cmd) = rx.recv().await {
                let result = store.handle_write(&mut writer, &cmd.msgid, cmd.location.clone());
                pending_fsync += 1;
                let elapsed = last_fsync.elapsed().as_millis() as u64;
                if pending_fsync > 0 && elapsed >= HISTORY_GROUP_COMMIT_INTERVAL_MS {
                    if let Err(e) = writer.flush().and_then(|_| writer.get_ref().sync_data()) {
                        tracing::error!(error = %e, "history log fsync failed, terminating writer");
                        store.writer_closed.store(true, Ordering::SeqCst);
                        let _ = cmd.respond.send(Err(HistoryError::Io(e)));
                        break;
                    }
                    pending_fsync = 0;
                    last_fsync = tokio::time::Instant::now();
                }
                let _ = cmd.respond.send(result);
            }

            let _ = writer.flush();
            let _ = writer.get_ref().sync_data();
        });

        *self.writer_handle.lock().unwrap() = Some(handle);
    }

    fn handle_write(
        &self,
        writer: &mut BufWriter<File>,
        msgid: &str,
        location: Location,
    ) -> Result<AddOutcome, HistoryError> {
        // Re-check under the writer's serialization: another Add for the same
        // msgid may have landed in the index between enqueue and this point.
        if self.lookup_index(msgid).is_some() {
            self.in_flight.lock().unwrap().remove(msgid);
            return Ok(AddOutcome::Duplicate);
        }

        let record = log::LogRecord {
            msgid: msgid.to_string(),
            location: location.clone(),
        };
        log::append(writer, &record).map_err(HistoryError::Io)?;

        self.insert_into_index(msgid, location);
        self.entry_count.fetch_add(1, Ordering::Relaxed);
        self.in_flight.lock().unwrap().remove(msgid);
        Ok(AddOutcome::Ok)
    }

    fn lookup_index(&self, msgid: &str) -> Option<Location> {
        let idx = self.bucket_index(msgid);
        self.buckets[idx].entries.read().unwrap().get(msgid).cloned()
    }

    /// Decide whether `msgid` is already known. Lock-free against the current
    /// index; `Pending` means a write is in flight and the caller should treat
    /// it as a duplicate for at-most-once ingest (§4.1).
    pub fn lookup(&self, msgid: &str) -> LookupResult {
        if let Some(loc) = self.lookup_index(msgid) {
            return LookupResult::Found(loc);
        }
        if self.in_flight.lock().unwrap().contains(msgid) {
            return LookupResult::Pending;
        }
        LookupResult::NotFound
    }

    /// Atomically record a new mapping. Idempotent: a second `Add` for an
    /// already-known message-id returns `Duplicate` without overwriting.
    pub async fn add(&self, msgid: &str, location: Location) -> Result<AddOutcome, HistoryError> {
        if self.writer_closed.load(Ordering::SeqCst) {
            return Err(HistoryError::WriterClosed);
        }
        if let Some(_loc) = self.lookup_index(msgid) {
            return Ok(AddOutcome::Duplicate);
        }

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(msgid.to_string()) {
                // Another task already has this msgid in flight; collapse to one winner.
                return Ok(AddOutcome::Duplicate);
            }
        }

        let (tx, rx) = oneshot::channel();
        let cmd = WriteCmd {
            msgid: msgid.to_string(),
            location,
            respond: tx,
        };
        self.writer_tx
            .send(cmd)
            .await
            .map_err(|_| HistoryError::WriterClosed)?;

        rx.await.map_err(|_| HistoryError::WriterClosed)?
    }

    pub fn short_hash_width(&self) -> u8 {
        self.short_hash_width
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// Flush outstanding writes, fsync, release resources.
    pub async fn close(&self) {
        self.writer_tx.close();
        let handle = self.writer_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_lookup_finds_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path(), 5).await.unwrap();
        let loc = Location {
            kind: StorageKind::GroupShard,
            shard: "comp.lang.rust".into(),
            key: 1,
        };
        let outcome = store.add("<a@x>", loc.clone()).await.unwrap();
        assert_eq!(outcome, AddOutcome::Ok);
        assert_eq!(store.lookup("<a@x>"), LookupResult::Found(loc));
        store.close().await;
    }

    #[tokio::test]
    async fn duplicate_add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path(), 5).await.unwrap();
        let loc = Location {
            kind: StorageKind::GroupShard,
            shard: "comp.lang.rust".into(),
            key: 1,
        };
        assert_eq!(store.add("<a@x>", loc.clone()).await.unwrap(), AddOutcome::Ok);
        assert_eq!(
            store.add("<a@x>", loc.clone()).await.unwrap(),
            AddOutcome::Duplicate
        );
        assert_eq!(store.entry_count(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn concurrent_add_storm_collapses_to_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path(), 5).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let loc = Location {
                    kind: StorageKind::GroupShard,
                    shard: "comp.lang.rust".into(),
                    key: i,
                };
                store.add("<storm@x>", loc).await.unwrap()
            }));
        }

        let mut ok_count = 0;
        for h in handles {
            if h.await.unwrap() == AddOutcome::Ok {
                ok_count += 1;
            }
        }
        assert_eq!(ok_count, 1);
        assert_eq!(store.entry_count(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn bucket_selection_follows_the_locked_short_hash_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path(), 5).await.unwrap();
        let msgid = "<a@x>";
        let prefix = short_hash(msgid, store.short_hash_width());
        let expected = (u32::from_str_radix(&prefix, 16).unwrap() as usize) % INDEX_BUCKET_COUNT;
        assert_eq!(store.bucket_index(msgid), expected);
        store.close().await;
    }

    #[tokio::test]
    async fn rehydrates_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = HistoryStore::open(dir.path(), 5).await.unwrap();
            let loc = Location {
                kind: StorageKind::GroupShard,
                shard: "comp.lang.rust".into(),
                key: 7,
            };
            store.add("<persist@x>", loc).await.unwrap();
            store.close().await;
        }
        let store = HistoryStore::open(dir.path(), 5).await.unwrap();
        assert!(matches!(store.lookup("<persist@x>"), LookupResult::Found(_)));
    }
}
