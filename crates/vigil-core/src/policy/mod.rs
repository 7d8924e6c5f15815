//! Policy definitions and the immutable registry.
//!
//! Policies are declared in a YAML document, validated and compiled once at
//! load time, and served from an immutable [`PolicyRegistry`]. The registry
//! precomputes the merged global+agent list per stage so stage evaluation is
//! a plain slice walk with no locking. Reload is build-new-and-swap.

mod config;

pub use config::{load_file, load_str, ConfigError, Settings};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::rules::Expr;
use crate::types::{Pillar, ResponseAction, Stage, ThreatCategory, Tier};

/// A single compiled policy: shared config fields plus the kind-specific
/// payload.
#[derive(Debug, Clone)]
pub struct PolicyDefinition {
    pub name: String,
    pub stage: Stage,
    pub kind: PolicyKind,

    /// Compiled rule. `None` only for judgment-tier criteria.
    pub rule: Option<Expr>,

    /// The rule as written, for diagnostics and record output.
    pub rule_text: Option<String>,

    pub enabled: bool,
    pub description: Option<String>,
}

/// Guardrail or criterion payload.
#[derive(Debug, Clone)]
pub enum PolicyKind {
    Guardrail {
        category: ThreatCategory,
        response: ResponseAction,
        /// Message used when the guardrail triggers; a default is generated
        /// when absent.
        error_message: Option<String>,
        /// Substituted value for `response: fallback`.
        fallback_value: Option<Value>,
        /// Character budget for `response: truncate`.
        truncate_to: Option<usize>,
        /// Appended after truncation.
        suffix: String,
        /// Output field the response targets, derived from the rule's first
        /// `output.*` path at load time.
        target_field: Option<String>,
    },
    Criterion {
        pillar: Pillar,
        tier: Tier,
        /// Signal compared when the rule's left operand is implicit.
        signal: Option<String>,
        /// Compiled warning threshold (quantitative tier only).
        warning: Option<Expr>,
    },
}

impl PolicyDefinition {
    pub fn is_guardrail(&self) -> bool {
        matches!(self.kind, PolicyKind::Guardrail { .. })
    }

    /// The guardrail's response action, if this is a guardrail.
    pub fn response(&self) -> Option<ResponseAction> {
        match &self.kind {
            PolicyKind::Guardrail { response, .. } => Some(*response),
            PolicyKind::Criterion { .. } => None,
        }
    }
}

/// Per-stage policy lists for one scope, already merged.
#[derive(Debug, Clone, Default)]
pub(crate) struct StagePolicies {
    pub(crate) pre_call: Vec<Arc<PolicyDefinition>>,
    pub(crate) mid_call: Vec<Arc<PolicyDefinition>>,
    pub(crate) post_call: Vec<Arc<PolicyDefinition>>,
}

impl StagePolicies {
    pub(crate) fn get(&self, stage: Stage) -> &[Arc<PolicyDefinition>] {
        match stage {
            Stage::PreCall => &self.pre_call,
            Stage::MidCall => &self.mid_call,
            Stage::PostCall => &self.post_call,
        }
    }

    pub(crate) fn get_mut(&mut self, stage: Stage) -> &mut Vec<Arc<PolicyDefinition>> {
        match stage {
            Stage::PreCall => &mut self.pre_call,
            Stage::MidCall => &mut self.mid_call,
            Stage::PostCall => &mut self.post_call,
        }
    }
}

/// Immutable, validated policy set.
///
/// Agent lists are stored pre-merged: global policies first (in declaration
/// order), agent-specific policies appended, except that an agent policy
/// whose name matches a global one replaces it in place.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    pub(crate) settings: Settings,
    pub(crate) global: StagePolicies,
    pub(crate) agents: HashMap<String, StagePolicies>,
}

impl PolicyRegistry {
    /// A registry with no policies. Every stage is a no-op.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Merged policy list for one agent and stage. Agents with no scope of
    /// their own get the global list.
    pub fn policies(&self, agent: &str, stage: Stage) -> &[Arc<PolicyDefinition>] {
        self.agents
            .get(agent)
            .unwrap_or(&self.global)
            .get(stage)
    }

    /// Policies declared in the global scope for one stage.
    pub fn global_policies(&self, stage: Stage) -> &[Arc<PolicyDefinition>] {
        self.global.get(stage)
    }

    /// Policies an agent declares itself: overrides and additions, without
    /// the inherited global entries.
    pub fn agent_declared(&self, agent: &str, stage: Stage) -> Vec<&Arc<PolicyDefinition>> {
        let global = self.global.get(stage);
        self.agents
            .get(agent)
            .map(|scope| {
                scope
                    .get(stage)
                    .iter()
                    .filter(|p| !global.iter().any(|g| Arc::ptr_eq(g, p)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Agent names with a dedicated scope.
    pub fn agent_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of declared policies across all scopes and stages. Agent lists
    /// are stored pre-merged, so inherited global entries do not count.
    pub fn policy_count(&self) -> usize {
        let mut count = self.global.pre_call.len()
            + self.global.mid_call.len()
            + self.global.post_call.len();
        for agent in self.agents.keys() {
            for stage in Stage::ALL {
                count += self.agent_declared(agent, stage).len();
            }
        }
        count
    }
}
