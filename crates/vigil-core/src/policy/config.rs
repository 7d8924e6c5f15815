//! Policy document loading and validation.
//!
//! The document is YAML. Parsing is strict where strictness is cheap
//! (unknown top-level keys, enum fields) and explicit where serde cannot
//! express the constraint (duplicate names, response prerequisites, rule
//! compilation). Any violation aborts the load; a registry is either fully
//! valid or absent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::{PolicyDefinition, PolicyKind, PolicyRegistry, StagePolicies};
use crate::rules::{Expr, RuleError};
use crate::types::{Pillar, ResponseAction, Stage, ThreatCategory, Tier};

/// Default cap on the stored raw response field: 100 KiB.
pub const DEFAULT_MAX_STORED_FIELD_BYTES: usize = 100 * 1024;

/// Engine-wide settings from the document's `settings` block.
#[derive(Debug, Clone)]
pub struct Settings {
    /// When a rule errors against live data: `true` lets the call proceed,
    /// `false` blocks it.
    pub fail_open: bool,

    /// Log passing evaluations too, not only activations.
    pub log_all_activations: bool,

    /// Byte cap on the raw response stored in call records.
    pub max_stored_field_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fail_open: true,
            log_all_activations: false,
            max_stored_field_bytes: DEFAULT_MAX_STORED_FIELD_BYTES,
        }
    }
}

/// Errors aborting a policy document load.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read policy document {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse policy document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("duplicate policy name '{name}' in {scope} {stage}")]
    Duplicate {
        name: String,
        scope: String,
        stage: Stage,
    },

    #[error("policy '{name}' ({scope}, {stage}): {reason}")]
    Invalid {
        name: String,
        scope: String,
        stage: Stage,
        reason: String,
    },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    settings: RawSettings,
    #[serde(default)]
    global: RawScope,
    #[serde(default)]
    agents: BTreeMap<String, RawScope>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSettings {
    #[serde(default = "default_true")]
    fail_open: bool,
    #[serde(default)]
    log_all_activations: bool,
    #[serde(default = "default_field_cap")]
    max_stored_field_bytes: usize,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            fail_open: true,
            log_all_activations: false,
            max_stored_field_bytes: DEFAULT_MAX_STORED_FIELD_BYTES,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawScope {
    #[serde(default)]
    pre_call: Vec<RawPolicy>,
    #[serde(default)]
    mid_call: Vec<RawPolicy>,
    #[serde(default)]
    post_call: Vec<RawPolicy>,
}

impl RawScope {
    fn stage(&self, stage: Stage) -> &[RawPolicy] {
        match stage {
            Stage::PreCall => &self.pre_call,
            Stage::MidCall => &self.mid_call,
            Stage::PostCall => &self.post_call,
        }
    }
}

// serde does not support deny_unknown_fields on internally tagged enums, so
// entry bodies tolerate extra keys; top-level strictness is what catches
// misplaced sections.
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawPolicy {
    Guardrail {
        name: String,
        rule: String,
        category: ThreatCategory,
        response: ResponseAction,
        #[serde(default)]
        error_message: Option<String>,
        #[serde(default)]
        fallback_value: Option<Value>,
        #[serde(default)]
        truncate_to: Option<usize>,
        #[serde(default)]
        suffix: Option<String>,
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default)]
        description: Option<String>,
    },
    Criterion {
        name: String,
        #[serde(default)]
        rule: Option<String>,
        pillar: Pillar,
        tier: Tier,
        #[serde(default)]
        signal: Option<String>,
        #[serde(default)]
        warning: Option<String>,
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default)]
        description: Option<String>,
    },
}

impl RawPolicy {
    fn name(&self) -> &str {
        match self {
            RawPolicy::Guardrail { name, .. } => name,
            RawPolicy::Criterion { name, .. } => name,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_field_cap() -> usize {
    DEFAULT_MAX_STORED_FIELD_BYTES
}

const DEFAULT_TRUNCATE_SUFFIX: &str = "...";

/// Load a policy document from disk.
///
/// A missing file is not an error: it yields an empty registry and a warning,
/// so deployments without policies run every stage as a no-op.
pub fn load_file(path: &Path) -> Result<PolicyRegistry, ConfigError> {
    if !path.exists() {
        warn!(path = %path.display(), "policy document not found, using empty registry");
        return Ok(PolicyRegistry::empty());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let registry = load_str(&text)?;
    debug!(
        path = %path.display(),
        policies = registry.policy_count(),
        agents = registry.agents.len(),
        "policy document loaded"
    );
    Ok(registry)
}

/// Parse and compile a policy document from a string.
pub fn load_str(doc: &str) -> Result<PolicyRegistry, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(doc)?;
    if let Some(version) = raw.version {
        debug!(version, "policy document version");
    }

    let global = compile_scope("global", &raw.global)?;
    let mut agents = HashMap::new();
    for (agent, scope) in &raw.agents {
        let own = compile_scope(agent, scope)?;
        agents.insert(agent.clone(), merge_scopes(&global, own));
    }

    Ok(PolicyRegistry {
        settings: Settings {
            fail_open: raw.settings.fail_open,
            log_all_activations: raw.settings.log_all_activations,
            max_stored_field_bytes: raw.settings.max_stored_field_bytes,
        },
        global,
        agents,
    })
}

fn compile_scope(scope: &str, raw: &RawScope) -> Result<StagePolicies, ConfigError> {
    let mut compiled = StagePolicies::default();
    for stage in Stage::ALL {
        let mut seen = HashSet::new();
        for policy in raw.stage(stage) {
            if !seen.insert(policy.name().to_string()) {
                return Err(ConfigError::Duplicate {
                    name: policy.name().to_string(),
                    scope: scope.to_string(),
                    stage,
                });
            }
            compiled
                .get_mut(stage)
                .push(Arc::new(compile_policy(scope, stage, policy)?));
        }
    }
    Ok(compiled)
}

/// Merge an agent scope over the global one: global entries first, an agent
/// entry with a matching name replaces the global one in place, the rest
/// append in declaration order.
fn merge_scopes(global: &StagePolicies, own: StagePolicies) -> StagePolicies {
    let mut merged = StagePolicies::default();
    for stage in Stage::ALL {
        let list = merged.get_mut(stage);
        list.extend(global.get(stage).iter().cloned());
        for policy in own.get(stage) {
            match list.iter_mut().find(|p| p.name == policy.name) {
                Some(slot) => *slot = policy.clone(),
                None => list.push(policy.clone()),
            }
        }
    }
    merged
}

fn compile_policy(
    scope: &str,
    stage: Stage,
    raw: &RawPolicy,
) -> Result<PolicyDefinition, ConfigError> {
    let invalid = |name: &str, reason: String| ConfigError::Invalid {
        name: name.to_string(),
        scope: scope.to_string(),
        stage,
        reason,
    };

    match raw {
        RawPolicy::Guardrail {
            name,
            rule,
            category,
            response,
            error_message,
            fallback_value,
            truncate_to,
            suffix,
            enabled,
            description,
        } => {
            let expr = compile_rule(rule).map_err(|e| invalid(name, e.to_string()))?;
            let target_field = expr
                .first_path_with_prefix("output.")
                .map(str::to_string);

            match response {
                ResponseAction::Truncate => {
                    if !matches!(truncate_to, Some(n) if *n > 0) {
                        return Err(invalid(
                            name,
                            "response 'truncate' requires truncate_to > 0".to_string(),
                        ));
                    }
                    if target_field.is_none() {
                        return Err(invalid(
                            name,
                            "response 'truncate' requires the rule to reference an output.* field"
                                .to_string(),
                        ));
                    }
                }
                ResponseAction::Fallback => {
                    if fallback_value.is_none() {
                        return Err(invalid(
                            name,
                            "response 'fallback' requires fallback_value".to_string(),
                        ));
                    }
                    if target_field.is_none() {
                        return Err(invalid(
                            name,
                            "response 'fallback' requires the rule to reference an output.* field"
                                .to_string(),
                        ));
                    }
                }
                ResponseAction::Block | ResponseAction::Flag => {}
            }

            Ok(PolicyDefinition {
                name: name.clone(),
                stage,
                kind: PolicyKind::Guardrail {
                    category: *category,
                    response: *response,
                    error_message: error_message.clone(),
                    fallback_value: fallback_value.clone(),
                    truncate_to: *truncate_to,
                    suffix: suffix
                        .clone()
                        .unwrap_or_else(|| DEFAULT_TRUNCATE_SUFFIX.to_string()),
                    target_field,
                },
                rule: Some(expr),
                rule_text: Some(rule.clone()),
                enabled: *enabled,
                description: description.clone(),
            })
        }

        RawPolicy::Criterion {
            name,
            rule,
            pillar,
            tier,
            signal,
            warning,
            enabled,
            description,
        } => {
            // Judgment-tier criteria carry no executable rule; they are
            // recorded as skipped until an external grader exists.
            let expr = match tier {
                Tier::Judgment => None,
                Tier::Binary | Tier::Quantitative => {
                    let text = rule.as_deref().ok_or_else(|| {
                        invalid(name, format!("{tier:?} tier requires a rule").to_lowercase())
                    })?;
                    Some(compile_rule(text).map_err(|e| invalid(name, e.to_string()))?)
                }
            };

            if let Some(expr) = &expr {
                if *tier == Tier::Quantitative && !expr.is_numeric_comparison() {
                    return Err(invalid(
                        name,
                        "quantitative tier requires a numeric comparison rule".to_string(),
                    ));
                }
                if expr.has_implicit_subject() && signal.is_none() {
                    return Err(invalid(
                        name,
                        "threshold-only rule requires a signal".to_string(),
                    ));
                }
            }

            let warning_expr = match warning {
                None => None,
                Some(text) => {
                    if *tier != Tier::Quantitative {
                        return Err(invalid(
                            name,
                            "warning threshold is only valid on the quantitative tier".to_string(),
                        ));
                    }
                    let expr = compile_rule(text).map_err(|e| invalid(name, e.to_string()))?;
                    if !expr.is_numeric_comparison() {
                        return Err(invalid(
                            name,
                            "warning threshold must be a numeric comparison".to_string(),
                        ));
                    }
                    Some(expr)
                }
            };

            Ok(PolicyDefinition {
                name: name.clone(),
                stage,
                kind: PolicyKind::Criterion {
                    pillar: *pillar,
                    tier: *tier,
                    signal: signal.clone(),
                    warning: warning_expr,
                },
                rule: expr,
                rule_text: rule.clone(),
                enabled: *enabled,
                description: description.clone(),
            })
        }
    }
}

fn compile_rule(text: &str) -> Result<Expr, RuleError> {
    let expr = Expr::parse(text)?;
    expr.static_check()?;
    Ok(expr)
}
