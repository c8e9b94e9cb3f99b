//! Download loop (§4.5): for each provider in priority order, walk every
//! active newsgroup, pull new overview rows, fetch unknown articles, and
//! hand them to the same ingest path POST/IHAVE/TAKETHIS use.

use std::sync::Arc;
use std::time::Duration;

use nntp_rs::ArticleSpec;

use crate::error::FetchError;
use crate::fetch::pool::ProviderPool;
use crate::fetch::progress::ProgressStore;
use crate::history::LookupResult;
use crate::nntp::engine::Engine;
use crate::storage::catalog::Catalog;

/// Overview batch size per `OVER` round-trip (§4.5 step 3).
const OVERVIEW_BATCH_SIZE: i64 = 500;

pub struct FetchProcessor {
    engine: Arc<Engine>,
    catalog: Arc<Catalog>,
    progress: Arc<ProgressStore>,
    providers: Vec<Arc<ProviderPool>>,
}

impl FetchProcessor {
    pub fn new(engine: Arc<Engine>, catalog: Arc<Catalog>, progress: Arc<ProgressStore>, providers: Vec<Arc<ProviderPool>>) -> Self {
        let mut providers = providers;
        providers.sort_by_key(|p| p.config.priority);
        FetchProcessor { engine, catalog, progress, providers }
    }

    /// Run one pass over every provider and every active group. Returns the
    /// number of articles ingested this pass.
    pub async fn run_once(&self) -> Result<usize, FetchError> {
        let mut total = 0;
        for provider in &self.providers {
            let groups = self.catalog.list_active_groups()?;
            for group in groups {
                match self.sync_group(provider, &group.name).await {
                    Ok(n) => total += n,
                    Err(e) => {
                        tracing::warn!(provider = %provider.config.name, group = %group.name, error = %e, "group sync failed");
                    }
                }
            }
        }
        Ok(total)
    }

    /// Poll forever, sleeping `interval` between passes, until `shutdown`
    /// fires (§5: fetchers stop after their current batch).
    pub async fn run_forever(&self, interval: Duration, shutdown: tokio_util::sync::CancellationToken) {
        loop {
            match self.run_once().await {
                Ok(n) if n > 0 => tracing::info!(ingested = n, "fetch pass complete"),
                Ok(_) => tracing::debug!("fetch pass complete, nothing new"),
                Err(e) => tracing::error!(error = %e, "fetch pass failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn sync_group(&self, provider: &Arc<ProviderPool>, group: &str) -> Result<usize, FetchError> {
        let mut conn = provider.get().await?;
        let stats = conn.client().group(group).await?;

        if provider.config.tiny_group_threshold > 0 && stats.count < provider.config.tiny_group_threshold {
            tracing::debug!(%group, count = stats.count, "skipping tiny group on cold start");
            return Ok(0);
        }

        let server_last = stats.last as i64;
        let last_local = self.progress.last_fetched(&provider.config.name, group)?;
        if last_local >= server_last {
            return Ok(0);
        }

        let mut ingested = 0;
        let mut low = last_local + 1;
        while low <= server_last {
            let high = (low + OVERVIEW_BATCH_SIZE - 1).min(server_last);
            let range = format!("{low}-{high}");
            let entries = conn.client().over(Some(range)).await?;

            for entry in entries.iter() {
                let Some(msgid) = entry.message_id() else { continue };
                if !matches!(self.engine.history.lookup(msgid), LookupResult::NotFound) {
                    continue;
                }
                let article = match conn.client().article(ArticleSpec::MessageId(msgid.to_string())).await {
                    Ok(article) => article,
                    Err(e) => {
                        tracing::warn!(%msgid, error = %e, "article fetch failed, skipping");
                        continue;
                    }
                };
                let raw = article_to_raw_bytes(&article);
                match self.engine.ingest(&raw).await {
                    Ok(_) => ingested += 1,
                    Err(crate::error::NntpError::Duplicate) => {}
                    Err(e) => tracing::warn!(%msgid, error = %e, "ingest failed for fetched article"),
                }
            }

            // Advance even when the batch contained no new articles so a
            // crash mid-pass resumes past it rather than re-walking dead
            // overview ranges (§4.5 step 4).
            self.progress.advance(&provider.config.name, group, high)?;
            low = high + 1;
        }
        Ok(ingested)
    }
}

/// Prefer the server's verbatim bytes for round-trip fidelity; fall back to
/// reconstructing a header block when the client didn't retain the raw text.
fn article_to_raw_bytes(article: &nntp_rs::Article) -> Vec<u8> {
    if let Some(raw) = article.raw() {
        return raw.as_bytes().to_vec();
    }
    let h = &article.headers;
    let mut out = String::new();
    out.push_str(&format!("Message-ID: {}\r\n", h.message_id));
    out.push_str(&format!("Subject: {}\r\n", h.subject));
    out.push_str(&format!("From: {}\r\n", h.from));
    out.push_str(&format!("Date: {}\r\n", h.date));
    out.push_str(&format!("Newsgroups: {}\r\n", h.newsgroups.join(",")));
    if let Some(refs) = &h.references {
        out.push_str(&format!("References: {}\r\n", refs.join(" ")));
    }
    out.push_str("\r\n");
    out.push_str(&article.body);
    out.into_bytes()
}
