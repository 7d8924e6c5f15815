//! Call record assembly.
//!
//! A `CallRecord` is the durable summary of one agent call: what came in,
//! what went out, what every policy said. One is built for every call,
//! including calls that were blocked or aborted mid-flight; an incomplete
//! record is still a record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::{CallMetrics, ExecutionContext};
use crate::policy::Settings;
use crate::types::{EvaluationOutcome, Stage};

/// Outcomes grouped by the stage that produced them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOutcomes {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_call: Vec<EvaluationOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mid_call: Vec<EvaluationOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_call: Vec<EvaluationOutcome>,
}

impl StageOutcomes {
    pub fn get(&self, stage: Stage) -> &[EvaluationOutcome] {
        match stage {
            Stage::PreCall => &self.pre_call,
            Stage::MidCall => &self.mid_call,
            Stage::PostCall => &self.post_call,
        }
    }

    pub fn len(&self) -> usize {
        self.pre_call.len() + self.mid_call.len() + self.post_call.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The durable record of one agent call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub agent: String,

    pub request: Value,

    /// The (possibly repaired) response. Capped for storage; see
    /// `storage_truncated`.
    pub response: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub metrics: CallMetrics,

    /// Tool names in invocation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<String>,

    #[serde(default, skip_serializing_if = "StageOutcomes::is_empty")]
    pub outcomes: StageOutcomes,

    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_at_stage: Option<Stage>,

    /// The stored response was cut to fit the storage cap. Distinct from a
    /// policy truncate, which happens before the caller sees the output.
    #[serde(default)]
    pub storage_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_response_bytes: Option<usize>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl CallRecord {
    /// Build the record for a finished (or blocked) call.
    ///
    /// `response` is the final output delivered to the caller, or `None`
    /// when the call never produced one.
    pub fn from_context(
        ctx: &ExecutionContext,
        response: Option<&Value>,
        settings: &Settings,
    ) -> Self {
        let (response, storage_truncated, original_response_bytes) =
            cap_response(response, settings.max_stored_field_bytes);

        let mut outcomes = StageOutcomes::default();
        for outcome in ctx.outcomes() {
            match outcome.stage {
                Stage::PreCall => outcomes.pre_call.push(outcome.clone()),
                Stage::MidCall => outcomes.mid_call.push(outcome.clone()),
                Stage::PostCall => outcomes.post_call.push(outcome.clone()),
            }
        }

        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            agent: ctx.agent.clone(),
            request: ctx.request.clone(),
            response,
            error: ctx.error().map(str::to_string),
            metrics: ctx.metrics().clone(),
            tool_calls: ctx.tool_calls().to_vec(),
            outcomes,
            blocked: ctx.blocked_at().is_some(),
            blocked_at_stage: ctx.blocked_at(),
            storage_truncated,
            original_response_bytes,
            metadata: Map::new(),
        }
    }

    /// Storage key: `{agent}/{YYYY-MM-DD}/{id}.json`, UTC date.
    pub fn storage_key(&self) -> String {
        format!(
            "{}/{}/{}.json",
            self.agent,
            self.timestamp.format("%Y-%m-%d"),
            self.id
        )
    }
}

/// Enforce the storage cap on the raw response. Oversized responses are
/// replaced by a clipped JSON-text preview.
fn cap_response(response: Option<&Value>, cap: usize) -> (Value, bool, Option<usize>) {
    let response = match response {
        Some(v) => v,
        None => return (Value::Null, false, None),
    };
    let serialized = response.to_string();
    if serialized.len() <= cap {
        return (response.clone(), false, None);
    }
    let clipped = clip_to_boundary(&serialized, cap);
    (
        Value::String(clipped.to_string()),
        true,
        Some(serialized.len()),
    )
}

fn clip_to_boundary(s: &str, cap: usize) -> &str {
    if s.len() <= cap {
        return s;
    }
    let mut end = cap;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
