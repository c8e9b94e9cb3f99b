//! Versioned schema migrations (§4.2). Main-catalog and group-shard
//! sequences are separate; each step runs in its own transaction and is
//! idempotent (guarded by `user_version`).

use rusqlite::Connection;

use crate::error::StorageError;

pub const CATALOG_MIGRATIONS: &[&str] = &[
    // v1
    r#"
    CREATE TABLE IF NOT EXISTS newsgroups (
        name            TEXT PRIMARY KEY,
        description     TEXT NOT NULL DEFAULT '',
        active          INTEGER NOT NULL DEFAULT 1,
        high_water      INTEGER NOT NULL DEFAULT 0,
        low_water       INTEGER NOT NULL DEFAULT 1,
        message_count   INTEGER NOT NULL DEFAULT 0,
        expiry_days     INTEGER,
        max_articles    INTEGER,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL,
        hierarchy       TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS hierarchies (
        name        TEXT PRIMARY KEY,
        description TEXT NOT NULL DEFAULT ''
    );
    CREATE TABLE IF NOT EXISTS nntp_users (
        username        TEXT PRIMARY KEY,
        password_hash   TEXT NOT NULL,
        max_connections INTEGER NOT NULL DEFAULT 1,
        can_post        INTEGER NOT NULL DEFAULT 0,
        active          INTEGER NOT NULL DEFAULT 1,
        last_login_at   TEXT
    );
    CREATE TABLE IF NOT EXISTS api_tokens (
        token       TEXT PRIMARY KEY,
        username    TEXT NOT NULL,
        created_at  TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sessions (
        session_id  TEXT PRIMARY KEY,
        username    TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        expires_at  TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS providers (
        name        TEXT PRIMARY KEY,
        host        TEXT NOT NULL,
        port        INTEGER NOT NULL,
        priority    INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS config (
        key     TEXT PRIMARY KEY,
        value   TEXT NOT NULL
    );
    "#,
];

pub const SHARD_MIGRATIONS: &[&str] = &[
    // v1
    r#"
    CREATE TABLE IF NOT EXISTS articles (
        article_num     INTEGER PRIMARY KEY,
        message_id      TEXT NOT NULL UNIQUE,
        subject         TEXT NOT NULL DEFAULT '',
        from_header     TEXT NOT NULL DEFAULT '',
        date_sent       TEXT,
        date_string     TEXT NOT NULL DEFAULT '',
        references_text TEXT NOT NULL DEFAULT '',
        headers_json    TEXT NOT NULL DEFAULT '{}',
        body_text       TEXT NOT NULL DEFAULT '',
        bytes           INTEGER NOT NULL DEFAULT 0,
        lines           INTEGER NOT NULL DEFAULT 0,
        reply_count     INTEGER NOT NULL DEFAULT 0,
        hide            INTEGER NOT NULL DEFAULT 0,
        spam            INTEGER NOT NULL DEFAULT 0,
        is_thr_root     INTEGER NOT NULL DEFAULT 0,
        is_reply        INTEGER NOT NULL DEFAULT 0,
        imported_at     TEXT NOT NULL,
        path            TEXT NOT NULL DEFAULT ''
    );
    CREATE TABLE IF NOT EXISTS threads (
        root_article    INTEGER NOT NULL,
        parent_article  INTEGER,
        child_article   INTEGER NOT NULL,
        depth           INTEGER NOT NULL,
        thread_order    INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_threads_root_order ON threads(root_article, thread_order);
    CREATE INDEX IF NOT EXISTS idx_threads_child ON threads(child_article);
    CREATE TABLE IF NOT EXISTS config (
        key     TEXT PRIMARY KEY,
        value   TEXT NOT NULL
    );
    "#,
];

pub const PROGRESS_MIGRATIONS: &[&str] = &[
    // v1
    r#"
    CREATE TABLE IF NOT EXISTS progress (
        provider_id     TEXT NOT NULL,
        newsgroup_name  TEXT NOT NULL,
        last_article    INTEGER NOT NULL DEFAULT 0,
        updated_at      TEXT NOT NULL,
        PRIMARY KEY (provider_id, newsgroup_name)
    );
    "#,
];

/// Apply `statements[current_version..]` in order, each wrapped in its own
/// transaction, bumping `PRAGMA user_version` as it goes.
pub fn apply(conn: &mut Connection, statements: &[&str]) -> Result<(), StorageError> {
    let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (i, stmt) in statements.iter().enumerate() {
        let version = (i + 1) as u32;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(stmt).map_err(|e| StorageError::MigrationFailed {
            version,
            detail: e.to_string(),
        })?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }
    Ok(())
}
