//! Shared engine state: the one ingest path used by POST, IHAVE, TAKETHIS,
//! and the fetch processor (§4.5), plus the read paths the session and the
//! web-layer collaborator both call.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::config::AppConfig;
use crate::error::{NntpError, StorageError};
use crate::history::{AddOutcome, HistoryStore, Location, LookupResult, StorageKind};
use crate::nntp::headers::{generate_message_id, parse_headers, parse_newsgroups};
use crate::overview::thread;
use crate::storage::batch::BatchWriter;
use crate::storage::catalog::Catalog;
use crate::storage::date::parse_date_header;
use crate::storage::pool::ShardPool;
use crate::storage::shard::{ArticleRow, NewArticle};

pub struct IngestOutcome {
    pub message_id: String,
    /// (group, article_num) for every group the article landed in.
    pub locations: Vec<(String, i64)>,
}

pub struct Engine {
    pub config: Arc<AppConfig>,
    pub catalog: Arc<Catalog>,
    pub shards: Arc<ShardPool>,
    pub history: Arc<HistoryStore>,
    // Batch writers are created lazily and kept resident for the process
    // lifetime, pinning their shard open; eviction is left to operator
    // restarts for groups that go permanently cold.
    writers: AsyncMutex<HashMap<String, Arc<BatchWriter>>>,
}

impl Engine {
    pub fn new(config: Arc<AppConfig>, catalog: Arc<Catalog>, shards: Arc<ShardPool>, history: Arc<HistoryStore>) -> Arc<Self> {
        Arc::new(Engine {
            config,
            catalog,
            shards,
            history,
            writers: AsyncMutex::new(HashMap::new()),
        })
    }

    async fn writer_for(&self, group: &str) -> Result<Arc<BatchWriter>, StorageError> {
        let mut writers = self.writers.lock().await;
        if let Some(w) = writers.get(group) {
            return Ok(Arc::clone(w));
        }
        let handle = self.shards.get_shard(group).await?;
        let writer = BatchWriter::spawn(Arc::clone(&handle.shard));
        writers.insert(group.to_string(), Arc::clone(&writer));
        Ok(writer)
    }

    /// The single ingest entry point for POST, IHAVE, TAKETHIS, and fetched
    /// articles (§4.5). `raw` is the fully-unstuffed article (headers + body).
    pub async fn ingest(&self, raw: &[u8]) -> Result<IngestOutcome, NntpError> {
        let (headers, body) = parse_headers(raw);

        let message_id = match headers.get("message-id") {
            Some(id) => id.to_string(),
            None => {
                let hostname = self
                    .config
                    .engine
                    .require_hostname()
                    .map_err(|e| NntpError::Protocol(e.to_string()))?;
                generate_message_id(hostname)
            }
        };

        match self.history.lookup(&message_id) {
            LookupResult::Found(_) | LookupResult::Pending => return Err(NntpError::Duplicate),
            LookupResult::NotFound => {}
        }

        let groups: Vec<String> = headers
            .get("newsgroups")
            .map(parse_newsgroups)
            .unwrap_or_default();

        let mut target_groups = Vec::new();
        for name in &groups {
            if let Some(group) = self.catalog.get_group(name).map_err(NntpError::Storage)? {
                if group.active {
                    target_groups.push(name.clone());
                }
            }
        }
        if target_groups.is_empty() {
            return Err(NntpError::Protocol(
                "no valid active newsgroup in Newsgroups: header".into(),
            ));
        }

        let subject = headers.get("subject").unwrap_or("").to_string();
        let from_header = headers.get("from").unwrap_or("").to_string();
        let references_text = headers.get("references").unwrap_or("").to_string();
        let parsed_date = parse_date_header(headers.get("date").unwrap_or(""));
        let headers_json = headers_to_json(&headers);
        let body_text = String::from_utf8_lossy(&body).into_owned();
        let bytes = raw.len() as i64;
        let lines = body.iter().filter(|&&b| b == b'\n').count() as i64;

        let mut locations = Vec::new();
        for group in &target_groups {
            let writer = self.writer_for(group).await.map_err(NntpError::Storage)?;
            let article_num = writer
                .ingest(NewArticle {
                    message_id: message_id.clone(),
                    subject: subject.clone(),
                    from_header: from_header.clone(),
                    date_sent: parsed_date.utc.as_ref().map(crate::storage::date::format_canonical),
                    date_string: parsed_date.date_string.clone(),
                    references_text: references_text.clone(),
                    headers_json: headers_json.clone(),
                    body_text: body_text.clone(),
                    bytes,
                    lines,
                    path: self.config.engine.hostname.clone().unwrap_or_default(),
                })
                .await
                .map_err(|e| match e {
                    StorageError::QueueFull => NntpError::IngestSaturated,
                    other => NntpError::Storage(other),
                })?;
            self.catalog
                .bump_watermark(group, article_num)
                .map_err(NntpError::Storage)?;
            locations.push((group.clone(), article_num));
        }

        // History.Add failing here means the batch writer already committed
        // rows that the dedup layer will never know about — worse than
        // downtime, so this is a programming-error-class failure (§4.5 step 6).
        let (first_group, first_num) = locations[0].clone();
        let outcome = self
            .history
            .add(
                &message_id,
                Location {
                    kind: StorageKind::GroupShard,
                    shard: first_group,
                    key: first_num as u64,
                },
            )
            .await
            .expect("history writer must not fail after storage commit");

        if outcome == AddOutcome::Duplicate {
            return Err(NntpError::Duplicate);
        }

        Ok(IngestOutcome { message_id, locations })
    }

    pub fn rebuild_threads(&self, group_shard: &crate::storage::shard::GroupShard) -> Result<usize, StorageError> {
        thread::rebuild(group_shard, 1000)
    }

    pub async fn get_article(&self, group: &str, num: i64) -> Result<Option<ArticleRow>, NntpError> {
        let handle = self.shards.get_shard(group).await.map_err(NntpError::Storage)?;
        handle.shard.get_article_by_num(num).map_err(NntpError::Storage)
    }

    pub async fn get_article_by_msgid(&self, group: &str, msgid: &str) -> Result<Option<ArticleRow>, NntpError> {
        let handle = self.shards.get_shard(group).await.map_err(NntpError::Storage)?;
        handle.shard.get_article_by_msgid(msgid).map_err(NntpError::Storage)
    }
}

fn headers_to_json(headers: &crate::nntp::headers::ParsedHeaders) -> String {
    serde_json::to_string(&headers.map).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, HistoryConfig, NntpServerSettings, StorageConfig, LoggingConfig};

    async fn test_engine() -> (Arc<Engine>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(AppConfig {
            engine: EngineConfig {
                hostname: Some("news.test".into()),
                data_dir: dir.path().display().to_string(),
            },
            history: HistoryConfig { short_hash_width: 5 },
            storage: StorageConfig::default(),
            nntp: NntpServerSettings {
                bind_host: "127.0.0.1".into(),
                port: 119,
                tls_port: None,
                tls_cert_path: None,
                tls_key_path: None,
                max_connections: 10,
                max_connections_per_user: 2,
                max_article_bytes: 1 << 20,
            },
            provider: vec![],
            logging: LoggingConfig::default(),
        });
        let catalog = Arc::new(Catalog::open(dir.path()).unwrap());
        catalog.ensure_group("comp.lang.rust", "").unwrap();
        let shards = ShardPool::new(dir.path().join("shards"), 8, 16);
        let history = HistoryStore::open(&dir.path().join("history"), 5).await.unwrap();
        (Engine::new(config, catalog, shards, history), dir)
    }

    #[tokio::test]
    async fn ingests_a_fresh_post() {
        let (engine, _dir) = test_engine().await;
        let raw = b"Message-ID: <a@x>\r\nNewsgroups: comp.lang.rust\r\nSubject: hi\r\nFrom: a@b\r\n\r\nhello\r\n";
        let outcome = engine.ingest(raw).await.unwrap();
        assert_eq!(outcome.message_id, "<a@x>");
        assert_eq!(outcome.locations, vec![("comp.lang.rust".to_string(), 1)]);
    }

    #[tokio::test]
    async fn duplicate_post_is_rejected() {
        let (engine, _dir) = test_engine().await;
        let raw = b"Message-ID: <a@x>\r\nNewsgroups: comp.lang.rust\r\n\r\nhello\r\n";
        engine.ingest(raw).await.unwrap();
        let result = engine.ingest(raw).await;
        assert!(matches!(result, Err(NntpError::Duplicate)));
    }

    #[tokio::test]
    async fn crosspost_gets_one_row_per_group() {
        let (engine, _dir) = test_engine().await;
        engine.catalog.ensure_group("comp.lang.go", "").unwrap();
        let raw = b"Message-ID: <b@x>\r\nNewsgroups: comp.lang.rust, comp.lang.go\r\n\r\nhi\r\n";
        let outcome = engine.ingest(raw).await.unwrap();
        assert_eq!(outcome.locations.len(), 2);
    }
}
