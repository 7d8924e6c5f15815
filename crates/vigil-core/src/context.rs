//! Per-call mutable execution state.
//!
//! One `ExecutionContext` lives for the duration of a single agent call. The
//! runtime embedding Vigil updates its counters as the call progresses; the
//! stage engine reads them through [`ExecutionContext::projection`] and
//! appends evaluation outcomes. The evaluator never reads a clock: elapsed
//! time is whatever the caller last supplied, which keeps evaluation
//! deterministic and testable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{EvaluationOutcome, Stage};

/// Latency and token usage for one call. All fields optional; the runtime
/// fills in what it knows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// Mutable state accompanying one agent call through the pipeline.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub agent: String,

    /// Request snapshot taken at `begin`; never mutated afterwards.
    pub request: Value,

    pub started_at: DateTime<Utc>,

    tool_call_count: u32,
    iteration_count: u32,
    tool_calls: Vec<String>,
    elapsed_ms: f64,
    metrics: CallMetrics,
    error: Option<String>,
    outcomes: Vec<EvaluationOutcome>,
    blocked_at: Option<Stage>,
}

impl ExecutionContext {
    pub fn new(agent: impl Into<String>, request: Value) -> Self {
        Self {
            agent: agent.into(),
            request,
            started_at: Utc::now(),
            tool_call_count: 0,
            iteration_count: 0,
            tool_calls: Vec::new(),
            elapsed_ms: 0.0,
            metrics: CallMetrics::default(),
            error: None,
            outcomes: Vec::new(),
            blocked_at: None,
        }
    }

    /// Count a tool invocation, keeping the ordered name list.
    pub fn record_tool_call(&mut self, name: &str) {
        self.tool_call_count += 1;
        self.tool_calls.push(name.to_string());
    }

    /// Count one agent loop iteration.
    pub fn next_iteration(&mut self) {
        self.iteration_count += 1;
    }

    /// Caller-supplied wall time since the call started. The `timeout`
    /// rule function reads this; the engine never measures time itself.
    pub fn set_elapsed_ms(&mut self, elapsed_ms: f64) {
        self.elapsed_ms = elapsed_ms;
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ms
    }

    pub fn tool_call_count(&self) -> u32 {
        self.tool_call_count
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn tool_calls(&self) -> &[String] {
        &self.tool_calls
    }

    pub fn set_metrics(&mut self, metrics: CallMetrics) {
        self.metrics = metrics;
    }

    pub fn metrics(&self) -> &CallMetrics {
        &self.metrics
    }

    /// Record an upstream error (model failure, tool crash). Criteria such
    /// as `has_error` observe it.
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub(crate) fn push_outcome(&mut self, outcome: EvaluationOutcome) {
        self.outcomes.push(outcome);
    }

    /// All outcomes accumulated so far, in evaluation order.
    pub fn outcomes(&self) -> &[EvaluationOutcome] {
        &self.outcomes
    }

    pub(crate) fn mark_blocked(&mut self, stage: Stage) {
        self.blocked_at = Some(stage);
    }

    pub fn blocked_at(&self) -> Option<Stage> {
        self.blocked_at
    }

    /// Context projection visible to rules under the `context` path.
    pub fn projection(&self) -> Value {
        json!({
            "tool_call_count": self.tool_call_count,
            "iteration_count": self.iteration_count,
            "elapsed_ms": self.elapsed_ms,
            "tool_calls": self.tool_calls,
        })
    }
}
