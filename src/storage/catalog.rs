//! Main catalog database: newsgroup metadata, users, providers, and the
//! `config` key-value table used to lock the history short-hash width (§4.1,
//! §4.2, §6).

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{HistoryError, StorageError};
use crate::storage::migrations;

pub struct NntpUser {
    pub username: String,
    pub password_hash: String,
    pub max_connections: i64,
    pub can_post: bool,
    pub active: bool,
}

pub struct Newsgroup {
    pub name: String,
    pub description: String,
    pub active: bool,
    pub high_water: i64,
    pub low_water: i64,
    pub message_count: i64,
    pub expiry_days: Option<i64>,
    pub max_articles: Option<i64>,
    pub hierarchy: String,
}

pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("catalog.db");
        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::apply(&mut conn, migrations::CATALOG_MIGRATIONS)?;
        Ok(Catalog {
            conn: Mutex::new(conn),
        })
    }

    pub fn get_config(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM config WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO config(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Lock (or verify) the history short-hash width (§4.1, §8 scenario 5).
    /// Fatal on mismatch — the process must not start.
    pub fn lock_short_hash_width(&self, requested: u8) -> Result<u8, HistoryError> {
        let stored = self
            .get_config("short_hash_width")
            .map_err(|e| HistoryError::CorruptLog {
                offset: 0,
                detail: e.to_string(),
            })?;

        match stored {
            Some(s) => {
                let stored_width: u8 = s.parse().unwrap_or(0);
                if stored_width != requested {
                    return Err(HistoryError::ShortHashMismatch {
                        stored: stored_width,
                        requested,
                    });
                }
                Ok(stored_width)
            }
            None => {
                self.set_config("short_hash_width", &requested.to_string())
                    .map_err(|e| HistoryError::CorruptLog {
                        offset: 0,
                        detail: e.to_string(),
                    })?;
                Ok(requested)
            }
        }
    }

    pub fn list_groups(&self, page: u32, size: u32) -> Result<Vec<Newsgroup>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let offset = (page as i64) * (size as i64);
        let mut stmt = conn.prepare(
            "SELECT name, description, active, high_water, low_water, message_count,
                    expiry_days, max_articles, hierarchy
             FROM newsgroups ORDER BY name LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![size as i64, offset], |row| {
            Ok(Newsgroup {
                name: row.get(0)?,
                description: row.get(1)?,
                active: row.get::<_, i64>(2)? != 0,
                high_water: row.get(3)?,
                low_water: row.get(4)?,
                message_count: row.get(5)?,
                expiry_days: row.get(6)?,
                max_articles: row.get(7)?,
                hierarchy: row.get(8)?,
            })
        })?;
        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// All active newsgroups, unpaginated — used by the fetch processor to
    /// walk every group on each provider pass (§4.5).
    pub fn list_active_groups(&self) -> Result<Vec<Newsgroup>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, description, active, high_water, low_water, message_count,
                    expiry_days, max_articles, hierarchy
             FROM newsgroups WHERE active = 1 ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Newsgroup {
                name: row.get(0)?,
                description: row.get(1)?,
                active: row.get::<_, i64>(2)? != 0,
                high_water: row.get(3)?,
                low_water: row.get(4)?,
                message_count: row.get(5)?,
                expiry_days: row.get(6)?,
                max_articles: row.get(7)?,
                hierarchy: row.get(8)?,
            })
        })?;
        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    pub fn get_group(&self, name: &str) -> Result<Option<Newsgroup>, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT name, description, active, high_water, low_water, message_count,
                    expiry_days, max_articles, hierarchy
             FROM newsgroups WHERE name = ?1",
            params![name],
            |row| {
                Ok(Newsgroup {
                    name: row.get(0)?,
                    description: row.get(1)?,
                    active: row.get::<_, i64>(2)? != 0,
                    high_water: row.get(3)?,
                    low_water: row.get(4)?,
                    message_count: row.get(5)?,
                    expiry_days: row.get(6)?,
                    max_articles: row.get(7)?,
                    hierarchy: row.get(8)?,
                })
            },
        )
        .optional()
        .map_err(StorageError::from)
    }

    /// Creation is idempotent: re-registering an existing group is a no-op.
    pub fn ensure_group(&self, name: &str, description: &str) -> Result<(), StorageError> {
        let hierarchy = name.split('.').next().unwrap_or(name).to_string();
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO newsgroups(name, description, active, high_water, low_water,
                message_count, created_at, updated_at, hierarchy)
             VALUES (?1, ?2, 1, 0, 1, 0, ?3, ?3, ?4)
             ON CONFLICT(name) DO NOTHING",
            params![name, description, now, hierarchy],
        )?;
        Ok(())
    }

    pub fn bump_watermark(&self, name: &str, article_num: i64) -> Result<(), StorageError> {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE newsgroups SET
                high_water = MAX(high_water, ?2),
                message_count = message_count + 1,
                updated_at = ?3
             WHERE name = ?1",
            params![name, article_num, now],
        )?;
        Ok(())
    }

    /// Look up NNTP credentials for AUTHINFO validation. The core only reads
    /// this table; user CRUD is an admin collaborator concern (§6).
    pub fn get_user(&self, username: &str) -> Result<Option<NntpUser>, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT username, password_hash, max_connections, can_post, active
             FROM nntp_users WHERE username = ?1",
            params![username],
            |row| {
                Ok(NntpUser {
                    username: row.get(0)?,
                    password_hash: row.get(1)?,
                    max_connections: row.get(2)?,
                    can_post: row.get::<_, i64>(3)? != 0,
                    active: row.get::<_, i64>(4)? != 0,
                })
            },
        )
        .optional()
        .map_err(StorageError::from)
    }

    pub fn record_login(&self, username: &str) -> Result<(), StorageError> {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE nntp_users SET last_login_at = ?2 WHERE username = ?1",
            params![username, now],
        )?;
        Ok(())
    }

    pub fn update_hierarchy_timestamps(&self) -> Result<(), StorageError> {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO hierarchies(name, description)
             SELECT DISTINCT hierarchy, '' FROM newsgroups
             WHERE true ON CONFLICT(name) DO NOTHING",
            [],
        )?;
        let _ = now; // hierarchies carries no timestamp column today; reserved for future use
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hash_width_locks_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        assert_eq!(catalog.lock_short_hash_width(4).unwrap(), 4);
        assert_eq!(catalog.lock_short_hash_width(4).unwrap(), 4);
    }

    #[test]
    fn short_hash_width_mismatch_on_restart_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let catalog = Catalog::open(dir.path()).unwrap();
            catalog.lock_short_hash_width(4).unwrap();
        }
        let catalog = Catalog::open(dir.path()).unwrap();
        let err = catalog.lock_short_hash_width(5).unwrap_err();
        match err {
            HistoryError::ShortHashMismatch { stored, requested } => {
                assert_eq!(stored, 4);
                assert_eq!(requested, 5);
            }
            other => panic!("expected ShortHashMismatch, got {other:?}"),
        }
    }
}
