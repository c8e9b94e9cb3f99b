//! Per-provider, per-group fetch cursors (§6): a small standalone store
//! separate from the catalog and shard databases, mirroring their
//! open/migrate/`Mutex<Connection>` shape (§4.2).

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StorageError;
use crate::storage::migrations;

pub struct ProgressStore {
    conn: Mutex<Connection>,
}

impl ProgressStore {
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let mut conn = Connection::open(data_dir.join("progress.db"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migrations::apply(&mut conn, migrations::PROGRESS_MIGRATIONS)?;
        Ok(ProgressStore { conn: Mutex::new(conn) })
    }

    pub fn last_fetched(&self, provider_id: &str, group: &str) -> Result<i64, StorageError> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT last_article FROM progress WHERE provider_id = ?1 AND newsgroup_name = ?2",
                params![provider_id, group],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    /// Advance the cursor atomically; called once per successfully-ingested
    /// overview batch so a crash mid-batch re-fetches it (§4.5 step 4).
    pub fn advance(&self, provider_id: &str, group: &str, last_article: i64) -> Result<(), StorageError> {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO progress(provider_id, newsgroup_name, last_article, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(provider_id, newsgroup_name) DO UPDATE SET
                last_article = excluded.last_article,
                updated_at = excluded.updated_at
             WHERE excluded.last_article > progress.last_article",
            params![provider_id, group, last_article, now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::open(dir.path()).unwrap();
        assert_eq!(store.last_fetched("p1", "comp.lang.rust").unwrap(), 0);
        store.advance("p1", "comp.lang.rust", 100).unwrap();
        assert_eq!(store.last_fetched("p1", "comp.lang.rust").unwrap(), 100);
        store.advance("p1", "comp.lang.rust", 50).unwrap();
        assert_eq!(store.last_fetched("p1", "comp.lang.rust").unwrap(), 100);
    }
}
