//! Fetch/ingest processor (§4.5): outbound provider pool, per-group
//! progress tracking, and the download loop that feeds the same ingest
//! path used by inbound POST/IHAVE/TAKETHIS.

pub mod pool;
pub mod processor;
pub mod progress;
