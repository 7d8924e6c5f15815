//! Core types shared across the evaluation pipeline.
//!
//! These are the vocabulary types of Vigil: the pipeline stages, the two
//! policy families (guardrails and criteria), and the outcome/block types
//! produced by evaluation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// A point in the call lifecycle where policies run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Before the agent sees the input.
    PreCall,
    /// During agent execution, before each tool use or loop iteration.
    MidCall,
    /// After the agent produced output, before it reaches the caller.
    PostCall,
}

impl Stage {
    /// All stages, in pipeline order.
    pub const ALL: [Stage; 3] = [Stage::PreCall, Stage::MidCall, Stage::PostCall];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::PreCall => "pre_call",
            Stage::MidCall => "mid_call",
            Stage::PostCall => "post_call",
        };
        f.write_str(s)
    }
}

/// The threat a guardrail defends against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    Cost,
    Quality,
    Scope,
    Security,
}

/// The quality pillar a criterion measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pillar {
    Effectiveness,
    Efficiency,
    Reliability,
    Trustworthiness,
}

/// How a criterion is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Pass/fail gate on a rule expression.
    Binary,
    /// Numeric comparison with an optional warning threshold.
    Quantitative,
    /// Human/LLM judgment. Deferred; always recorded as skipped.
    Judgment,
}

/// What a guardrail does when its rule fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    /// Abort the call with a structured block signal.
    Block,
    /// Substitute a configured fallback value into the output.
    Fallback,
    /// Shorten the targeted output field and append a suffix.
    Truncate,
    /// Record the violation without interrupting the call.
    Flag,
}

impl fmt::Display for ResponseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResponseAction::Block => "block",
            ResponseAction::Fallback => "fallback",
            ResponseAction::Truncate => "truncate",
            ResponseAction::Flag => "flag",
        };
        f.write_str(s)
    }
}

/// Grade assigned by a criterion evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionGrade {
    Pass,
    Fail,
    Warning,
    /// Signal unavailable, non-numeric, or judgment tier.
    Skipped,
}

/// Result of evaluating one policy against one call.
///
/// Immutable once produced; appended to the execution context and later
/// grouped into the `CallRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    /// Name of the policy that produced this outcome.
    pub policy: String,

    /// Stage at which the policy ran.
    pub stage: Stage,

    /// Whether a guardrail's rule failed. Always false for criteria.
    pub triggered: bool,

    /// Criterion grade; `None` for guardrails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<CriterionGrade>,

    /// The response applied when a guardrail triggered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_response: Option<ResponseAction>,

    /// Value observed by the rule, when one was resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<Value>,

    /// Human-readable explanation (error message, threshold report, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Key/value diagnostics (counters, original lengths, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl EvaluationOutcome {
    /// A passing outcome with no annotations.
    pub fn passed(policy: impl Into<String>, stage: Stage) -> Self {
        Self {
            policy: policy.into(),
            stage,
            triggered: false,
            grade: None,
            applied_response: None,
            observed: None,
            message: None,
            details: Map::new(),
        }
    }
}

/// Which transport error class a block maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller's input was rejected (pre-call and mid-call blocks).
    Client,
    /// The agent's own output was rejected (post-call blocks).
    Server,
}

/// Deliberate guardrail block, surfaced to the entry point.
///
/// This is expected control flow, not a bug: the entry point maps it to a
/// transport status code and serializes `{error, guardrail, stage, details}`.
#[derive(Debug, Clone, Error)]
#[error("blocked by guardrail '{policy}' at {stage}: {message}")]
pub struct BlockSignal {
    /// Name of the guardrail that blocked.
    pub policy: String,

    /// Stage at which the block occurred.
    pub stage: Stage,

    /// Configured error message, or a generated default.
    pub message: String,

    /// Diagnostics captured at the point of the block.
    pub details: Map<String, Value>,
}

impl BlockSignal {
    /// Transport error class: client for pre/mid-call, server for post-call,
    /// since a post-call failure originates from the agent's own output.
    pub fn error_class(&self) -> ErrorClass {
        match self.stage {
            Stage::PreCall | Stage::MidCall => ErrorClass::Client,
            Stage::PostCall => ErrorClass::Server,
        }
    }

    /// Representative HTTP status code for the error class.
    pub fn http_status(&self) -> u16 {
        match self.error_class() {
            ErrorClass::Client => 400,
            ErrorClass::Server => 500,
        }
    }

    /// Serializable body for the entry point response.
    pub fn to_response_body(&self) -> Value {
        serde_json::json!({
            "error": self.message,
            "guardrail": self.policy,
            "stage": self.stage,
            "details": Value::Object(self.details.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serde_round_trip() {
        let s: Stage = serde_json::from_str("\"mid_call\"").unwrap();
        assert_eq!(s, Stage::MidCall);
        assert_eq!(serde_json::to_string(&Stage::PostCall).unwrap(), "\"post_call\"");
    }

    #[test]
    fn test_block_signal_status_mapping() {
        let mut block = BlockSignal {
            policy: "p".to_string(),
            stage: Stage::PreCall,
            message: "no".to_string(),
            details: Map::new(),
        };
        assert_eq!(block.http_status(), 400);

        block.stage = Stage::MidCall;
        assert_eq!(block.http_status(), 400);

        block.stage = Stage::PostCall;
        assert_eq!(block.error_class(), ErrorClass::Server);
        assert_eq!(block.http_status(), 500);
    }

    #[test]
    fn test_block_signal_response_body() {
        let block = BlockSignal {
            policy: "max_description_length".to_string(),
            stage: Stage::PreCall,
            message: "Description too long".to_string(),
            details: Map::new(),
        };
        let body = block.to_response_body();
        assert_eq!(body["guardrail"], "max_description_length");
        assert_eq!(body["stage"], "pre_call");
        assert_eq!(body["error"], "Description too long");
    }
}
