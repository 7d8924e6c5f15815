//! Retrieval over stored call records.
//!
//! Keys follow `{agent}/{YYYY-MM-DD}/{id}.json`, so listings stay cheap:
//! an agent filter is a key prefix and a date filter parses out of the key
//! without fetching the blob.

use chrono::NaiveDate;
use tracing::debug;
use uuid::Uuid;

use vigil_core::CallRecord;

use crate::store::{ObjectStore, StoreError};

/// Filters for listing stored records.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub agent: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,

    /// Maximum keys returned; 0 means the default of 100.
    pub limit: usize,

    /// Continuation: only keys strictly after this one are returned.
    pub start_after: Option<String>,
}

const DEFAULT_LIMIT: usize = 100;

/// A listed record, parsed from its key alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSummary {
    pub key: String,
    pub agent: String,
    pub date: NaiveDate,
    pub id: Uuid,
}

/// Parse a storage key. Foreign keys in the bucket are ignored by listings.
pub fn parse_key(key: &str) -> Option<RecordSummary> {
    let mut parts = key.split('/');
    let agent = parts.next()?;
    let date = parts.next()?;
    let file = parts.next()?;
    if parts.next().is_some() || agent.is_empty() {
        return None;
    }
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    let id = Uuid::parse_str(file.strip_suffix(".json")?).ok()?;
    Some(RecordSummary {
        key: key.to_string(),
        agent: agent.to_string(),
        date,
        id,
    })
}

/// List stored records matching the query, in key order.
pub async fn list_records(
    store: &dyn ObjectStore,
    query: &RecordQuery,
) -> Result<Vec<RecordSummary>, StoreError> {
    let prefix = query
        .agent
        .as_deref()
        .map(|agent| format!("{agent}/"))
        .unwrap_or_default();
    let limit = if query.limit == 0 {
        DEFAULT_LIMIT
    } else {
        query.limit
    };

    let keys = store.list(&prefix).await?;
    let summaries: Vec<RecordSummary> = keys
        .into_iter()
        .filter(|key| match &query.start_after {
            Some(after) => key > after,
            None => true,
        })
        .filter_map(|key| parse_key(&key))
        .filter(|summary| {
            query.from.map_or(true, |from| summary.date >= from)
                && query.to.map_or(true, |to| summary.date <= to)
        })
        .take(limit)
        .collect();

    debug!(
        prefix = %prefix,
        matched = summaries.len(),
        "record listing completed"
    );
    Ok(summaries)
}

/// Fetch and decode one record by key. `None` when the key does not exist.
pub async fn fetch_record(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<Option<CallRecord>, StoreError> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}
