//! Per-shard batch writer (§4.2, §5): the single writer task for one
//! [`GroupShard`]. Accumulates ingests into transactions of up to
//! `BATCH_WRITER_MAX_ROWS` rows or `BATCH_WRITER_MAX_DELAY_MS`, whichever
//! comes first, and assigns each row's thread position inside the same
//! transaction via [`crate::overview::thread::assign_thread`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{BATCH_WRITER_MAX_DELAY_MS, BATCH_WRITER_MAX_RETRIES, BATCH_WRITER_MAX_ROWS, BATCH_WRITER_RETRY_BASE_MS, INGEST_QUEUE_CAPACITY};
use crate::error::StorageError;
use crate::overview::thread::{assign_thread, parse_references};
use crate::storage::shard::{GroupShard, NewArticle};

struct IngestCmd {
    article: NewArticle,
    respond: oneshot::Sender<Result<i64, StorageError>>,
}

/// Handle to a running batch writer. Dropping this does not stop the writer;
/// call [`BatchWriter::close`] to drain and join it.
pub struct BatchWriter {
    tx: async_channel::Sender<IngestCmd>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchWriter {
    pub fn spawn(shard: Arc<GroupShard>) -> Arc<Self> {
        let (tx, rx) = async_channel::bounded::<IngestCmd>(INGEST_QUEUE_CAPACITY);
        let handle = tokio::spawn(run_loop(shard, rx));
        Arc::new(BatchWriter {
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue one article for ingest; resolves once the batch containing it
    /// has committed (or permanently failed). Enqueue itself never blocks: a
    /// full queue is backpressure the caller must see and defer (§4.5), not
    /// wait out.
    pub async fn ingest(&self, article: NewArticle) -> Result<i64, StorageError> {
        let (respond, reply) = oneshot::channel();
        match self.tx.try_send(IngestCmd { article, respond }) {
            Ok(()) => {}
            Err(async_channel::TrySendError::Full(_)) => return Err(StorageError::QueueFull),
            Err(async_channel::TrySendError::Closed(_)) => {
                return Err(StorageError::ShardUnhealthy("batch writer closed".into()))
            }
        }
        reply
            .await
            .map_err(|_| StorageError::ShardUnhealthy("batch writer closed".into()))?
    }

    pub async fn close(&self) {
        self.tx.close();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_loop(shard: Arc<GroupShard>, rx: async_channel::Receiver<IngestCmd>) {
    loop {
        let first = match rx.recv().await {
            Ok(cmd) => cmd,
            Err(_) => break, // channel closed, no more work will arrive
        };

        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + Duration::from_millis(BATCH_WRITER_MAX_DELAY_MS);
        while batch.len() < BATCH_WRITER_MAX_ROWS {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(cmd)) => batch.push(cmd),
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        }

        let shard = Arc::clone(&shard);
        let batch_len = batch.len();
        let join = tokio::task::spawn_blocking(move || write_batch_with_retry(&shard, batch));
        if let Err(e) = join.await {
            tracing::error!(error = %e, rows = batch_len, "batch writer task panicked");
        }
    }
}

/// Run one batch as a single transaction, retrying the whole batch with
/// jittered exponential backoff on transient failure. `SQLITE_BUSY` from a
/// concurrent reader is the expected transient case; anything else that
/// survives all retries is reported to every waiter in the batch.
fn write_batch_with_retry(shard: &GroupShard, batch: Vec<IngestCmd>) {
    let mut attempt = 0u32;
    loop {
        match try_write_batch(shard, &batch) {
            Ok(results) => {
                for (cmd, result) in batch.into_iter().zip(results.into_iter()) {
                    let _ = cmd.respond.send(Ok(result));
                }
                return;
            }
            Err(e) if attempt < BATCH_WRITER_MAX_RETRIES && e.kind() == crate::error::ErrorKind::TransientIo => {
                attempt += 1;
                let backoff_ms = BATCH_WRITER_RETRY_BASE_MS * (1u64 << attempt.min(8));
                let jitter = jitter_ms(BATCH_WRITER_RETRY_BASE_MS.max(1));
                std::thread::sleep(Duration::from_millis(backoff_ms + jitter));
                tracing::warn!(attempt, shard = %shard.name, error = %e, "retrying batch after transient storage error");
            }
            Err(e) => {
                tracing::error!(shard = %shard.name, rows = batch.len(), error = %e, "batch write failed permanently");
                for cmd in batch {
                    let _ = cmd
                        .respond
                        .send(Err(StorageError::ShardUnhealthy(format!("batch write failed: {e}"))));
                }
                return;
            }
        }
    }
}

/// Cheap jitter source: we don't carry a `rand` dependency for one backoff
/// delay, so derive it from the low bits of the current time instead.
fn jitter_ms(bound: u64) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos as u64) % bound
}

fn try_write_batch(shard: &GroupShard, batch: &[IngestCmd]) -> Result<Vec<i64>, StorageError> {
    let mut conn = shard.conn_mutex().lock().unwrap();
    let tx = conn.transaction()?;
    let mut article_nums = Vec::with_capacity(batch.len());

    for cmd in batch {
        let article_num: i64 = tx.query_row(
            "SELECT COALESCE(MAX(article_num), 0) + 1 FROM articles",
            [],
            |row| row.get(0),
        )?;
        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        tx.execute(
            "INSERT INTO articles(
                article_num, message_id, subject, from_header, date_sent, date_string,
                references_text, headers_json, body_text, bytes, lines, imported_at, path
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                article_num,
                cmd.article.message_id,
                cmd.article.subject,
                cmd.article.from_header,
                cmd.article.date_sent,
                cmd.article.date_string,
                cmd.article.references_text,
                cmd.article.headers_json,
                cmd.article.body_text,
                cmd.article.bytes,
                cmd.article.lines,
                now,
                cmd.article.path,
            ],
        )?;

        let refs = parse_references(&cmd.article.references_text);
        assign_thread(&tx, article_num, &refs)?;
        article_nums.push(article_num);
    }

    tx.commit()?;
    Ok(article_nums)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(msgid: &str, references: &str) -> NewArticle {
        NewArticle {
            message_id: msgid.to_string(),
            subject: "s".into(),
            from_header: "f".into(),
            date_sent: None,
            date_string: String::new(),
            references_text: references.to_string(),
            headers_json: "{}".into(),
            body_text: "body".into(),
            bytes: 4,
            lines: 1,
            path: String::new(),
        }
    }

    #[tokio::test]
    async fn ingests_and_threads_a_batch() {
        let dir = tempfile::tempdir().unwrap();
        let shard = Arc::new(GroupShard::open(dir.path(), "comp.lang.rust").unwrap());
        let writer = BatchWriter::spawn(Arc::clone(&shard));

        let root_num = writer.ingest(sample("<r@x>", "")).await.unwrap();
        let child_num = writer.ingest(sample("<c@x>", "<r@x>")).await.unwrap();
        assert_eq!(root_num, 1);
        assert_eq!(child_num, 2);

        let child_thread = shard.thread_row_for_child(child_num).unwrap().unwrap();
        assert_eq!(child_thread.parent_article, Some(root_num));

        writer.close().await;
    }

    #[tokio::test]
    async fn concurrent_ingests_get_distinct_article_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let shard = Arc::new(GroupShard::open(dir.path(), "comp.lang.rust").unwrap());
        let writer = BatchWriter::spawn(Arc::clone(&shard));

        let mut handles = Vec::new();
        for i in 0..20 {
            let writer = Arc::clone(&writer);
            handles.push(tokio::spawn(async move {
                writer.ingest(sample(&format!("<{i}@x>"), "")).await.unwrap()
            }));
        }
        let mut nums: Vec<i64> = Vec::new();
        for h in handles {
            nums.push(h.await.unwrap());
        }
        nums.sort();
        let expected: Vec<i64> = (1..=20).collect();
        assert_eq!(nums, expected);

        writer.close().await;
    }
}
