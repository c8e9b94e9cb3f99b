//! Error taxonomy for the engine.
//!
//! Each module boundary gets its own `thiserror` enum; [`EngineError`] composes
//! them at the binary boundary. [`ErrorKind`] classifies any error into the
//! handful of buckets the session loop and retry helper actually branch on —
//! transient I/O, protocol violation, auth failure, duplicate, integrity
//! violation, resource exhaustion, or programming error.

use std::io;

/// Coarse classification used to decide NNTP response codes and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientIo,
    ProtocolViolation,
    AuthFailure,
    Duplicate,
    IntegrityViolation,
    ResourceExhaustion,
    ProgrammingError,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history log io error: {0}")]
    Io(#[from] io::Error),

    #[error("history log corrupt at offset {offset}: {detail}")]
    CorruptLog { offset: u64, detail: String },

    #[error("history writer closed, refusing further writes")]
    WriterClosed,

    #[error(
        "short-hash width mismatch: catalog has {stored} nibbles locked, startup requested {requested}"
    )]
    ShortHashMismatch { stored: u8, requested: u8 },

    #[error("short-hash width {0} out of range 2..=7")]
    ShortHashOutOfRange(u8),
}

impl HistoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HistoryError::Io(_) => ErrorKind::TransientIo,
            HistoryError::CorruptLog { .. } => ErrorKind::IntegrityViolation,
            HistoryError::WriterClosed => ErrorKind::IntegrityViolation,
            HistoryError::ShortHashMismatch { .. } => ErrorKind::IntegrityViolation,
            HistoryError::ShortHashOutOfRange(_) => ErrorKind::IntegrityViolation,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("shard pool exhausted (hard cap {cap} open shards)")]
    PoolExhausted { cap: usize },

    #[error("shard '{0}' is marked unhealthy, refusing to reopen yet")]
    ShardUnhealthy(String),

    #[error("ingest queue full, try again")]
    QueueFull,

    #[error("migration {version} failed: {detail}")]
    MigrationFailed { version: u32, detail: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Sqlite(e) => match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::DatabaseBusy =>
                {
                    ErrorKind::TransientIo
                }
                _ => ErrorKind::IntegrityViolation,
            },
            StorageError::PoolExhausted { .. } => ErrorKind::ResourceExhaustion,
            StorageError::ShardUnhealthy(_) => ErrorKind::TransientIo,
            StorageError::QueueFull => ErrorKind::ResourceExhaustion,
            StorageError::MigrationFailed { .. } => ErrorKind::IntegrityViolation,
            StorageError::Io(_) => ErrorKind::TransientIo,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NntpError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("account locked after repeated authentication failures")]
    AccountLocked,

    #[error("duplicate article")]
    Duplicate,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("history error: {0}")]
    History(#[from] HistoryError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("ingest queue full, try again")]
    IngestSaturated,
}

impl NntpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NntpError::Protocol(_) => ErrorKind::ProtocolViolation,
            NntpError::AuthFailed | NntpError::AccountLocked => ErrorKind::AuthFailure,
            NntpError::Duplicate => ErrorKind::Duplicate,
            NntpError::Storage(e) => e.kind(),
            NntpError::History(e) => e.kind(),
            NntpError::Io(_) => ErrorKind::TransientIo,
            NntpError::IngestSaturated => ErrorKind::ResourceExhaustion,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("provider pool exhausted")]
    PoolExhausted,

    #[error("provider connection failed: {0}")]
    Connect(String),

    #[error("provider protocol error: {0}")]
    Protocol(#[from] nntp_rs::Error),

    #[error("ingest error: {0}")]
    Ingest(#[from] NntpError),

    #[error("progress store error: {0}")]
    Progress(#[from] StorageError),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::PoolExhausted => ErrorKind::ResourceExhaustion,
            FetchError::Connect(_) => ErrorKind::TransientIo,
            FetchError::Protocol(_) => ErrorKind::TransientIo,
            FetchError::Ingest(e) => e.kind(),
            FetchError::Progress(e) => e.kind(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("hostname must be configured before POST or fetch can run")]
    MissingHostname,
}

/// Top-level error composed at the binary boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Nntp(#[from] NntpError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("programming invariant broken: {0}")]
    Invariant(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_) => ErrorKind::IntegrityViolation,
            EngineError::History(e) => e.kind(),
            EngineError::Storage(e) => e.kind(),
            EngineError::Nntp(e) => e.kind(),
            EngineError::Fetch(e) => e.kind(),
            EngineError::Invariant(_) => ErrorKind::ProgrammingError,
        }
    }
}
