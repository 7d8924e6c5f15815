//! # vigil-store
//!
//! Asynchronous persistence and retrieval for Vigil call records.
//!
//! The evaluation core is synchronous and pure; this crate is the async
//! shell around it. It provides:
//!
//! - [`ObjectStore`]: the storage seam, with an in-memory implementation;
//! - [`PersistenceSink`]: a bounded, fire-and-forget writer pool that keeps
//!   storage latency and failures out of the call path;
//! - [`query`]: listing and fetching stored records by agent and date.

pub mod query;
pub mod sink;
pub mod store;

pub use query::{fetch_record, list_records, parse_key, RecordQuery, RecordSummary};
pub use sink::{PersistenceSink, SinkConfig};
pub use store::{MemoryStore, ObjectStore, StoreError};
