//! Bounded pool of open [`GroupShard`]s (§4.2).
//!
//! Open-shard count is bounded by a hard cap enforced with a fair FIFO
//! semaphore (`tokio::sync::Semaphore` already queues waiters in arrival
//! order). Above a lower soft cap, idle shards (refcount zero, idle longer
//! than a minimum) become eligible for LRU close by a periodic reaper, which
//! damps thrash from bursty access instead of closing the instant refcount
//! hits zero.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::config::SHARD_MIN_IDLE_SECS;
use crate::error::StorageError;
use crate::storage::shard::GroupShard;

struct ShardEntry {
    shard: Arc<GroupShard>,
    refcount: AtomicUsize,
    idle_since: std::sync::Mutex<Option<Instant>>,
    _permit: OwnedSemaphorePermit,
}

struct Unhealthy {
    since: Instant,
    backoff: Duration,
}

pub struct ShardPool {
    base_dir: PathBuf,
    soft_cap: usize,
    shards: Mutex<HashMap<String, Arc<ShardEntry>>>,
    semaphore: Arc<Semaphore>,
    unhealthy: std::sync::Mutex<HashMap<String, Unhealthy>>,
}

pub struct ShardHandle {
    pool: Arc<ShardPool>,
    name: String,
    pub shard: Arc<GroupShard>,
}

impl Drop for ShardHandle {
    fn drop(&mut self) {
        let pool = Arc::clone(&self.pool);
        let name = self.name.clone();
        tokio::spawn(async move {
            pool.release(&name).await;
        });
    }
}

impl ShardPool {
    pub fn new(base_dir: PathBuf, soft_cap: usize, hard_cap: usize) -> Arc<Self> {
        Arc::new(ShardPool {
            base_dir,
            soft_cap,
            shards: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(hard_cap)),
            unhealthy: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Resolve or create a per-group shard, reference-counted. Blocks (fair
    /// FIFO, via the semaphore) when the hard cap is already reached and no
    /// shard is being newly opened.
    pub async fn get_shard(self: &Arc<Self>, name: &str) -> Result<ShardHandle, StorageError> {
        if let Some(backoff) = self.unhealthy.lock().unwrap().get(name) {
            if backoff.since.elapsed() < backoff.backoff {
                return Err(StorageError::ShardUnhealthy(name.to_string()));
            }
        }

        {
            let shards = self.shards.lock().await;
            if let Some(entry) = shards.get(name) {
                entry.refcount.fetch_add(1, Ordering::SeqCst);
                *entry.idle_since.lock().unwrap() = None;
                return Ok(ShardHandle {
                    pool: Arc::clone(self),
                    name: name.to_string(),
                    shard: Arc::clone(&entry.shard),
                });
            }
        }

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("shard pool semaphore never closed");

        let base_dir = self.base_dir.clone();
        let group_name = name.to_string();
        let open_result =
            tokio::task::spawn_blocking(move || GroupShard::open(&base_dir, &group_name))
                .await
                .map_err(|e| StorageError::MigrationFailed {
                    version: 0,
                    detail: format!("shard open task panicked: {e}"),
                })?;

        let shard = match open_result {
            Ok(shard) => Arc::new(shard),
            Err(e) => {
                self.mark_unhealthy(name);
                return Err(e);
            }
        };

        let entry = Arc::new(ShardEntry {
            shard: Arc::clone(&shard),
            refcount: AtomicUsize::new(1),
            idle_since: std::sync::Mutex::new(None),
            _permit: permit,
        });

        self.shards.lock().await.insert(name.to_string(), entry);
        self.unhealthy.lock().unwrap().remove(name);

        Ok(ShardHandle {
            pool: Arc::clone(self),
            name: name.to_string(),
            shard,
        })
    }

    async fn release(&self, name: &str) {
        let shards = self.shards.lock().await;
        if let Some(entry) = shards.get(name) {
            let prev = entry.refcount.fetch_sub(1, Ordering::SeqCst);
            if prev == 1 {
                *entry.idle_since.lock().unwrap() = Some(Instant::now());
            }
        }
    }

    fn mark_unhealthy(&self, name: &str) {
        let mut unhealthy = self.unhealthy.lock().unwrap();
        let backoff = unhealthy
            .get(name)
            .map(|u| (u.backoff * 2).min(Duration::from_secs(300)))
            .unwrap_or(Duration::from_secs(1));
        unhealthy.insert(
            name.to_string(),
            Unhealthy {
                since: Instant::now(),
                backoff,
            },
        );
    }

    /// Immediate closure, bypassing idle-time damping. Used by maintenance tools.
    pub async fn force_close(&self, name: &str) {
        self.shards.lock().await.remove(name);
    }

    pub fn open_count_blocking(&self) -> usize {
        self.shards.blocking_lock().len()
    }

    /// LRU close of idle shards once the pool is over its soft cap. Intended
    /// to run on a periodic interval from a background task.
    pub async fn reap_idle(&self) {
        let mut shards = self.shards.lock().await;
        if shards.len() <= self.soft_cap {
            return;
        }

        let min_idle = Duration::from_secs(SHARD_MIN_IDLE_SECS);
        let mut candidates: Vec<(String, Instant)> = shards
            .iter()
            .filter_map(|(name, entry)| {
                if entry.refcount.load(Ordering::SeqCst) != 0 {
                    return None;
                }
                let idle_since = (*entry.idle_since.lock().unwrap())?;
                if idle_since.elapsed() < min_idle {
                    return None;
                }
                Some((name.clone(), idle_since))
            })
            .collect();

        // Oldest-idle first, close only as many as needed to return to the soft cap.
        candidates.sort_by_key(|(_, idle_since)| *idle_since);
        let over = shards.len() - self.soft_cap;
        for (name, _) in candidates.into_iter().take(over) {
            shards.remove(&name);
        }
    }
}
