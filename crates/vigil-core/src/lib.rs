//! # vigil-core
//!
//! Deterministic policy and observability evaluation for AI agent calls.
//!
//! Vigil evaluates declarative policies at three points in a call's
//! lifecycle (pre-call, mid-call, post-call), answering:
//! - Should this call proceed at all?
//! - Is the agent staying inside its behavioral budget?
//! - Is the output safe to deliver, and how good was it?
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: same policies, same call data, same outcomes. The
//!    evaluator never reads a clock or performs I/O.
//! 2. **Closed rules**: rule expressions dispatch against a fixed whitelist
//!    of functions; configuration can never execute host code.
//! 3. **Criteria never interrupt**: only guardrails can block or repair a
//!    call, criteria just grade it.
//! 4. **Every call leaves a record**, blocked or not.
//!
//! ## Example
//!
//! ```rust,ignore
//! use vigil_core::{load_file, CallRecord, StageEngine};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(load_file("policies.yaml".as_ref())?);
//! let engine = StageEngine::new(registry);
//!
//! let mut ctx = engine.begin("pricing", request);
//! engine.pre_call(&mut ctx)?;
//! engine.mid_call(&mut ctx, Some("price_lookup"))?;
//! let output = engine.post_call(&mut ctx, &raw_output)?;
//!
//! let record = CallRecord::from_context(&ctx, Some(&output), engine.registry().settings());
//! ```

pub mod context;
pub mod engine;
pub mod policy;
pub mod record;
pub mod rules;
pub mod signals;
pub mod types;

// Re-export main types at crate root
pub use context::{CallMetrics, ExecutionContext};
pub use engine::StageEngine;
pub use policy::{load_file, load_str, ConfigError, PolicyDefinition, PolicyKind, PolicyRegistry, Settings};
pub use record::{CallRecord, StageOutcomes};
pub use rules::{builtin_names, Expr, RuleError};
pub use signals::{resolve_path, Resolved, Snapshot};
pub use types::{
    BlockSignal, CriterionGrade, ErrorClass, EvaluationOutcome, Pillar, ResponseAction, Stage,
    ThreatCategory, Tier,
};
