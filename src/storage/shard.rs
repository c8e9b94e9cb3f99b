//! A per-newsgroup embedded relational store (§4.2). Tables: `articles`,
//! `threads`, `config`. Access is synchronous `rusqlite`, intended to be
//! driven from a dedicated batch-writer task via `spawn_blocking` so the
//! "single writer per shard" discipline (§5) is structural, not just
//! documented.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::StorageError;
use crate::storage::migrations;

pub struct NewArticle {
    pub message_id: String,
    pub subject: String,
    pub from_header: String,
    pub date_sent: Option<String>,
    pub date_string: String,
    pub references_text: String,
    pub headers_json: String,
    pub body_text: String,
    pub bytes: i64,
    pub lines: i64,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct ArticleRow {
    pub article_num: i64,
    pub message_id: String,
    pub subject: String,
    pub from_header: String,
    pub date_sent: Option<String>,
    pub references_text: String,
    pub headers_json: String,
    pub body_text: String,
    pub bytes: i64,
    pub lines: i64,
    pub reply_count: i64,
    pub hide: bool,
    pub spam: i64,
    pub is_thr_root: bool,
    pub is_reply: bool,
}

#[derive(Debug, Clone)]
pub struct ThreadRow {
    pub root_article: i64,
    pub parent_article: Option<i64>,
    pub child_article: i64,
    pub depth: i64,
    pub thread_order: i64,
}

/// Derive a filesystem-safe, deterministic path for a group's shard file so
/// that directory fan-out never depends directly on the (attacker-or-admin
/// controlled) group name.
pub fn shard_path(base_dir: &Path, group_name: &str) -> PathBuf {
    let digest = Sha256::digest(group_name.as_bytes());
    let prefix = format!("{:x}", digest)[..8].to_string();
    let suffix: String = group_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    base_dir.join(format!("{}-{}.db", prefix, suffix))
}

pub struct GroupShard {
    pub name: String,
    conn: Mutex<Connection>,
}

impl GroupShard {
    pub fn open(base_dir: &Path, name: &str) -> Result<Self, StorageError> {
        std::fs::create_dir_all(base_dir)?;
        let path = shard_path(base_dir, name);
        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migrations::apply(&mut conn, migrations::SHARD_MIGRATIONS)?;
        Ok(GroupShard {
            name: name.to_string(),
            conn: Mutex::new(conn),
        })
    }

    /// Direct access to the underlying connection mutex, for the batch
    /// writer to hold across a whole batch instead of once per row.
    pub(crate) fn conn_mutex(&self) -> &Mutex<Connection> {
        &self.conn
    }

    pub fn next_article_num(&self) -> Result<i64, StorageError> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(article_num) FROM articles",
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) + 1)
    }

    /// Insert a new article row, assigning the next monotone `article_num`
    /// within this shard (§3 invariant, §8 property 3).
    pub fn insert_article(&self, article: &NewArticle) -> Result<i64, StorageError> {
        let conn = self.conn.lock().unwrap();
        let article_num: i64 = conn.query_row(
            "SELECT COALESCE(MAX(article_num), 0) + 1 FROM articles",
            [],
            |row| row.get(0),
        )?;
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        conn.execute(
            "INSERT INTO articles(
                article_num, message_id, subject, from_header, date_sent, date_string,
                references_text, headers_json, body_text, bytes, lines, imported_at, path
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                article_num,
                article.message_id,
                article.subject,
                article.from_header,
                article.date_sent,
                article.date_string,
                article.references_text,
                article.headers_json,
                article.body_text,
                article.bytes,
                article.lines,
                now,
                article.path,
            ],
        )?;
        Ok(article_num)
    }

    pub fn get_article_by_num(&self, num: i64) -> Result<Option<ArticleRow>, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT article_num, message_id, subject, from_header, date_sent, references_text,
                    headers_json, body_text, bytes, lines, reply_count, hide, spam,
                    is_thr_root, is_reply
             FROM articles WHERE article_num = ?1",
            params![num],
            row_to_article,
        )
        .optional()
        .map_err(StorageError::from)
    }

    pub fn get_article_by_msgid(&self, msgid: &str) -> Result<Option<ArticleRow>, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT article_num, message_id, subject, from_header, date_sent, references_text,
                    headers_json, body_text, bytes, lines, reply_count, hide, spam,
                    is_thr_root, is_reply
             FROM articles WHERE message_id = ?1",
            params![msgid],
            row_to_article,
        )
        .optional()
        .map_err(StorageError::from)
    }

    pub fn overview_page(&self, cursor: i64, size: u32) -> Result<Vec<ArticleRow>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT article_num, message_id, subject, from_header, date_sent, references_text,
                    headers_json, body_text, bytes, lines, reply_count, hide, spam,
                    is_thr_root, is_reply
             FROM articles WHERE article_num >= ?1 ORDER BY article_num LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cursor, size as i64], row_to_article)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Stream all articles in article-number order, `batch_size` at a time,
    /// for thread rebuild (§4.3).
    pub fn stream_articles(&self, batch_size: u32) -> Result<Vec<ArticleRow>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT article_num, message_id, subject, from_header, date_sent, references_text,
                    headers_json, body_text, bytes, lines, reply_count, hide, spam,
                    is_thr_root, is_reply
             FROM articles ORDER BY article_num",
        )?;
        let rows = stmt.query_map(params![], row_to_article)?;
        let mut out = Vec::with_capacity(batch_size as usize);
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn insert_thread_row(&self, row: &ThreadRow) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO threads(root_article, parent_article, child_article, depth, thread_order)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.root_article,
                row.parent_article,
                row.child_article,
                row.depth,
                row.thread_order,
            ],
        )?;
        if row.parent_article.is_none() {
            conn.execute(
                "UPDATE articles SET is_thr_root = 1 WHERE article_num = ?1",
                params![row.child_article],
            )?;
        } else {
            conn.execute(
                "UPDATE articles SET is_reply = 1 WHERE article_num = ?1",
                params![row.child_article],
            )?;
            if let Some(parent) = row.parent_article {
                conn.execute(
                    "UPDATE articles SET reply_count = reply_count + 1 WHERE article_num = ?1",
                    params![parent],
                )?;
            }
        }
        Ok(())
    }

    /// Thread row for an article, if it has been assigned one (it is the
    /// child side of exactly one row — §3 invariant "at most one parent").
    pub fn thread_row_for_child(&self, article_num: i64) -> Result<Option<ThreadRow>, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT root_article, parent_article, child_article, depth, thread_order
             FROM threads WHERE child_article = ?1",
            params![article_num],
            row_to_thread,
        )
        .optional()
        .map_err(StorageError::from)
    }

    pub fn next_thread_order(&self, root_article: i64) -> Result<i64, StorageError> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(thread_order) FROM threads WHERE root_article = ?1",
            params![root_article],
            |row| row.get(0),
        )?;
        Ok(max.map(|m| m + 1).unwrap_or(0))
    }

    pub fn thread_rows_for_root(&self, root_article: i64) -> Result<Vec<ThreadRow>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT root_article, parent_article, child_article, depth, thread_order
             FROM threads WHERE root_article = ?1 ORDER BY thread_order",
        )?;
        let rows = stmt.query_map(params![root_article], row_to_thread)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Clear all thread rows for this shard (maintenance rebuild, §4.3).
    pub fn clear_threads(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM threads", [])?;
        conn.execute("UPDATE articles SET is_thr_root = 0, is_reply = 0, reply_count = 0", [])?;
        Ok(())
    }

    /// `(article_num, date_sent, date_string)` for every article, for the
    /// date-repair admin operation to re-parse against.
    pub fn date_candidates(&self) -> Result<Vec<(i64, Option<String>, String)>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT article_num, date_sent, date_string FROM articles")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?, row.get::<_, String>(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn update_date_sent(&self, article_num: i64, new_date_sent: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE articles SET date_sent = ?2 WHERE article_num = ?1",
            params![article_num, new_date_sent],
        )?;
        Ok(())
    }

    /// Consistency check (§4.3 invariants): articles whose chosen parent no
    /// longer exists in `threads`. Returns the orphaned child article numbers.
    pub fn find_orphaned_children(&self) -> Result<Vec<i64>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT t.child_article FROM threads t
             WHERE t.parent_article IS NOT NULL
               AND NOT EXISTS (
                   SELECT 1 FROM threads p WHERE p.child_article = t.parent_article
               )",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn row_to_article(row: &rusqlite::Row) -> rusqlite::Result<ArticleRow> {
    Ok(ArticleRow {
        article_num: row.get(0)?,
        message_id: row.get(1)?,
        subject: row.get(2)?,
        from_header: row.get(3)?,
        date_sent: row.get(4)?,
        references_text: row.get(5)?,
        headers_json: row.get(6)?,
        body_text: row.get(7)?,
        bytes: row.get(8)?,
        lines: row.get(9)?,
        reply_count: row.get(10)?,
        hide: row.get::<_, i64>(11)? != 0,
        spam: row.get(12)?,
        is_thr_root: row.get::<_, i64>(13)? != 0,
        is_reply: row.get::<_, i64>(14)? != 0,
    })
}

fn row_to_thread(row: &rusqlite::Row) -> rusqlite::Result<ThreadRow> {
    Ok(ThreadRow {
        root_article: row.get(0)?,
        parent_article: row.get(1)?,
        child_article: row.get(2)?,
        depth: row.get(3)?,
        thread_order: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn article_numbers_are_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let shard = GroupShard::open(dir.path(), "comp.lang.rust").unwrap();
        for i in 0..5 {
            let num = shard
                .insert_article(&NewArticle {
                    message_id: format!("<{}@x>", i),
                    subject: "s".into(),
                    from_header: "f".into(),
                    date_sent: None,
                    date_string: String::new(),
                    references_text: String::new(),
                    headers_json: "{}".into(),
                    body_text: "body".into(),
                    bytes: 4,
                    lines: 1,
                    path: String::new(),
                })
                .unwrap();
            assert_eq!(num, i + 1);
        }
    }

    #[test]
    fn shard_path_is_deterministic_and_safe() {
        let base = Path::new("/tmp/shards");
        let p1 = shard_path(base, "comp.lang.rust");
        let p2 = shard_path(base, "comp.lang.rust");
        assert_eq!(p1, p2);
        let p3 = shard_path(base, "comp.lang.rust/../../etc");
        assert!(!p3.to_string_lossy().contains(".."));
    }
}
