//! The stage engine: runs each stage's policy list against a call.
//!
//! Evaluation is strictly in declared order. Guardrails can interrupt the
//! call (`block`) or repair the output (`truncate`, `fallback`); criteria
//! only grade and never interrupt. Output mutations are applied to the
//! engine's working copy, so later policies in the same stage see the
//! repaired output.
//!
//! Rule errors against live data are governed by the engine-wide fail mode:
//! fail-open records the error and lets the call continue, fail-closed
//! converts it into a block.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::policy::{PolicyDefinition, PolicyKind, PolicyRegistry};
use crate::rules::{Arg, Expr, Verdict};
use crate::signals::{resolve_path, set_path, Resolved, Snapshot};
use crate::types::{
    BlockSignal, CriterionGrade, EvaluationOutcome, ResponseAction, Stage, Tier,
};

/// Stage evaluation over an immutable policy registry.
///
/// Cheap to clone; holds only an `Arc` to the registry. Reloading policies
/// means constructing a new engine around a new registry.
#[derive(Debug, Clone)]
pub struct StageEngine {
    registry: Arc<PolicyRegistry>,
}

impl StageEngine {
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Open an execution context for one agent call.
    pub fn begin(&self, agent: &str, request: Value) -> ExecutionContext {
        debug!(agent = %agent, "call started");
        ExecutionContext::new(agent, request)
    }

    /// Run pre-call policies against the request.
    pub fn pre_call(&self, ctx: &mut ExecutionContext) -> Result<(), BlockSignal> {
        let mut root = self.stage_root(ctx, None);
        self.run_stage(ctx, Stage::PreCall, &mut root)
    }

    /// Run mid-call policies. When `tool` is given, the invocation is
    /// counted first, so limits see the call that is about to happen.
    pub fn mid_call(
        &self,
        ctx: &mut ExecutionContext,
        tool: Option<&str>,
    ) -> Result<(), BlockSignal> {
        if let Some(name) = tool {
            ctx.record_tool_call(name);
        }
        let mut root = self.stage_root(ctx, None);
        self.run_stage(ctx, Stage::MidCall, &mut root)
    }

    /// Run post-call policies against the output and return the possibly
    /// repaired copy. The input output is never mutated.
    pub fn post_call(
        &self,
        ctx: &mut ExecutionContext,
        output: &Value,
    ) -> Result<Value, BlockSignal> {
        let mut root = self.stage_root(ctx, Some(output));
        self.run_stage(ctx, Stage::PostCall, &mut root)?;
        Ok(root
            .get_mut("output")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// The document rules resolve paths against.
    fn stage_root(&self, ctx: &ExecutionContext, output: Option<&Value>) -> Value {
        let mut root = json!({
            "request": ctx.request,
            "context": ctx.projection(),
            "metrics": serde_json::to_value(ctx.metrics()).unwrap_or(Value::Null),
            "error": ctx.error(),
        });
        if let Some(out) = output {
            root["output"] = out.clone();
        }
        root
    }

    fn run_stage(
        &self,
        ctx: &mut ExecutionContext,
        stage: Stage,
        root: &mut Value,
    ) -> Result<(), BlockSignal> {
        let policies: Vec<Arc<PolicyDefinition>> =
            self.registry.policies(&ctx.agent, stage).to_vec();
        for policy in policies {
            if !policy.enabled {
                continue;
            }
            match &policy.kind {
                PolicyKind::Guardrail { .. } => {
                    self.run_guardrail(&policy, ctx, stage, root)?
                }
                PolicyKind::Criterion { .. } => self.run_criterion(&policy, ctx, stage, root),
            }
        }
        Ok(())
    }

    fn run_guardrail(
        &self,
        policy: &PolicyDefinition,
        ctx: &mut ExecutionContext,
        stage: Stage,
        root: &mut Value,
    ) -> Result<(), BlockSignal> {
        let expr = match &policy.rule {
            Some(expr) => expr,
            None => return Ok(()),
        };

        let verdict = expr.evaluate(&Snapshot::new(root));
        match verdict {
            Ok(verdict) if verdict.passed => {
                if self.registry.settings().log_all_activations {
                    debug!(agent = %ctx.agent, policy = %policy.name, %stage, "guardrail passed");
                }
                ctx.push_outcome(EvaluationOutcome::passed(&policy.name, stage));
                Ok(())
            }
            Ok(verdict) => self.apply_response(policy, ctx, stage, root, verdict),
            Err(err) => {
                if self.registry.settings().fail_open {
                    warn!(
                        agent = %ctx.agent, policy = %policy.name, %stage, error = %err,
                        "guardrail evaluation failed, continuing (fail-open)"
                    );
                    let mut outcome = EvaluationOutcome::passed(&policy.name, stage);
                    outcome.message = Some(format!("evaluation failed: {err}"));
                    ctx.push_outcome(outcome);
                    Ok(())
                } else {
                    let message =
                        format!("guardrail '{}' could not be evaluated: {err}", policy.name);
                    warn!(
                        agent = %ctx.agent, policy = %policy.name, %stage, error = %err,
                        "guardrail evaluation failed, blocking (fail-closed)"
                    );
                    ctx.push_outcome(EvaluationOutcome {
                        policy: policy.name.clone(),
                        stage,
                        triggered: true,
                        grade: None,
                        applied_response: Some(ResponseAction::Block),
                        observed: None,
                        message: Some(message.clone()),
                        details: Map::new(),
                    });
                    ctx.mark_blocked(stage);
                    Err(BlockSignal {
                        policy: policy.name.clone(),
                        stage,
                        message,
                        details: Map::new(),
                    })
                }
            }
        }
    }

    fn apply_response(
        &self,
        policy: &PolicyDefinition,
        ctx: &mut ExecutionContext,
        stage: Stage,
        root: &mut Value,
        verdict: Verdict,
    ) -> Result<(), BlockSignal> {
        let (category, response, error_message, fallback_value, truncate_to, suffix, target_field) =
            match &policy.kind {
                PolicyKind::Guardrail {
                    category,
                    response,
                    error_message,
                    fallback_value,
                    truncate_to,
                    suffix,
                    target_field,
                } => (
                    *category,
                    *response,
                    error_message,
                    fallback_value,
                    *truncate_to,
                    suffix,
                    target_field,
                ),
                PolicyKind::Criterion { .. } => return Ok(()),
            };

        let message = error_message
            .clone()
            .unwrap_or_else(|| format!("Guardrail '{}' violated", policy.name));

        let mut details = Map::new();
        details.insert(
            "category".to_string(),
            serde_json::to_value(category).unwrap_or(Value::Null),
        );
        if let Some(rule) = &policy.rule_text {
            details.insert("rule".to_string(), Value::String(rule.clone()));
        }

        warn!(
            agent = %ctx.agent, policy = %policy.name, %stage, response = %response,
            "guardrail triggered"
        );

        match response {
            ResponseAction::Block => {
                ctx.push_outcome(EvaluationOutcome {
                    policy: policy.name.clone(),
                    stage,
                    triggered: true,
                    grade: None,
                    applied_response: Some(ResponseAction::Block),
                    observed: verdict.observed.clone(),
                    message: Some(message.clone()),
                    details: details.clone(),
                });
                ctx.mark_blocked(stage);
                Err(BlockSignal {
                    policy: policy.name.clone(),
                    stage,
                    message,
                    details,
                })
            }

            ResponseAction::Flag => {
                ctx.push_outcome(EvaluationOutcome {
                    policy: policy.name.clone(),
                    stage,
                    triggered: true,
                    grade: None,
                    applied_response: Some(ResponseAction::Flag),
                    observed: verdict.observed,
                    message: Some(message),
                    details,
                });
                Ok(())
            }

            ResponseAction::Truncate => {
                // Validation guarantees a target field and a budget.
                if let (Some(field), Some(budget)) = (target_field, truncate_to) {
                    let path = format!("output.{field}");
                    if let Resolved::Value(Value::String(current)) = resolve_path(root, &path) {
                        if let Some(shortened) = truncated(&current, budget, suffix) {
                            details.insert(
                                "original_length".to_string(),
                                Value::from(current.chars().count()),
                            );
                            details.insert("truncated_to".to_string(), Value::from(budget));
                            set_path(root, &path, Value::String(shortened));
                        }
                    }
                }
                ctx.push_outcome(EvaluationOutcome {
                    policy: policy.name.clone(),
                    stage,
                    triggered: true,
                    grade: None,
                    applied_response: Some(ResponseAction::Truncate),
                    observed: verdict.observed,
                    message: Some(message),
                    details,
                });
                Ok(())
            }

            ResponseAction::Fallback => {
                if let Some(field) = target_field {
                    let path = format!("output.{field}");
                    let original = resolve_path(root, &path).to_value();
                    let replacement = fallback_value.clone().unwrap_or(Value::Null);
                    details.insert("original_value".to_string(), original);
                    details.insert("fallback_value".to_string(), replacement.clone());
                    set_path(root, &path, replacement);
                }
                ctx.push_outcome(EvaluationOutcome {
                    policy: policy.name.clone(),
                    stage,
                    triggered: true,
                    grade: None,
                    applied_response: Some(ResponseAction::Fallback),
                    observed: verdict.observed,
                    message: Some(message),
                    details,
                });
                Ok(())
            }
        }
    }

    fn run_criterion(
        &self,
        policy: &PolicyDefinition,
        ctx: &mut ExecutionContext,
        stage: Stage,
        root: &Value,
    ) {
        let (tier, signal, warning) = match &policy.kind {
            PolicyKind::Criterion {
                tier,
                signal,
                warning,
                ..
            } => (*tier, signal, warning),
            PolicyKind::Guardrail { .. } => return,
        };

        let mut outcome = EvaluationOutcome::passed(&policy.name, stage);
        if let PolicyKind::Criterion { pillar, .. } = &policy.kind {
            outcome.details.insert(
                "pillar".to_string(),
                serde_json::to_value(pillar).unwrap_or(Value::Null),
            );
            outcome.details.insert(
                "tier".to_string(),
                serde_json::to_value(tier).unwrap_or(Value::Null),
            );
        }

        let expr = match (&policy.rule, tier) {
            (_, Tier::Judgment) | (None, _) => {
                outcome.grade = Some(CriterionGrade::Skipped);
                outcome.message = Some("judgment tier is not evaluated".to_string());
                ctx.push_outcome(outcome);
                return;
            }
            (Some(expr), _) => expr,
        };

        // The value the criterion observes: the declared signal for
        // threshold-only rules, the left path for full comparisons.
        let subject_path: Option<&str> = if expr.has_implicit_subject() {
            signal.as_deref()
        } else {
            explicit_left_path(expr)
        };

        let snap = Snapshot::new(root);
        let subject = subject_path.map(|p| snap.resolve(p));
        // Quantitative criteria skip rather than fail when their signal is
        // not there; binary comparisons (e.g. `error == null`) evaluate the
        // raw value.
        let subject_missing = match (&subject, tier) {
            (Some(s), Tier::Quantitative) => !s.is_some(),
            (Some(_), _) => false,
            (None, _) => expr.has_implicit_subject(),
        };
        if subject_missing {
            outcome.grade = Some(CriterionGrade::Skipped);
            outcome.message = Some(format!(
                "signal {:?} unavailable",
                subject_path.unwrap_or("<none>")
            ));
            ctx.push_outcome(outcome);
            return;
        }

        let snap = match subject {
            Some(s) => snap.with_subject(s),
            None => snap,
        };

        match expr.evaluate(&snap) {
            Err(err) => {
                debug!(
                    agent = %ctx.agent, policy = %policy.name, %stage, error = %err,
                    "criterion evaluation failed, recording skipped"
                );
                outcome.grade = Some(CriterionGrade::Skipped);
                outcome.message = Some(format!("evaluation failed: {err}"));
            }
            Ok(verdict) => {
                outcome.observed = verdict.observed.clone();
                let grade = if !verdict.passed {
                    CriterionGrade::Fail
                } else {
                    match warning {
                        Some(warn_expr) => match warn_expr.evaluate(&snap) {
                            Ok(w) if !w.passed => CriterionGrade::Warning,
                            _ => CriterionGrade::Pass,
                        },
                        None => CriterionGrade::Pass,
                    }
                };
                if grade != CriterionGrade::Pass {
                    outcome.message = verdict.report;
                }
                outcome.grade = Some(grade);
            }
        }
        ctx.push_outcome(outcome);
    }
}

fn explicit_left_path(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Compare {
            left: Some(Arg::Path(p)),
            ..
        } => Some(p),
        _ => None,
    }
}

/// `Some(shortened)` when `s` exceeds `budget` characters. Re-applying to the
/// result yields the same string, so repeated post-call runs converge.
pub(crate) fn truncated(s: &str, budget: usize, suffix: &str) -> Option<String> {
    if s.chars().count() <= budget {
        return None;
    }
    let mut kept: String = s.chars().take(budget).collect();
    kept.push_str(suffix);
    Some(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::load_str;
    use proptest::prelude::*;

    fn engine(doc: &str) -> StageEngine {
        StageEngine::new(Arc::new(load_str(doc).unwrap()))
    }

    const BLOCK_DOC: &str = r#"
global:
  pre_call:
    - kind: guardrail
      name: max_description_length
      rule: "max_length(request.body.description, 20)"
      category: quality
      response: block
      error_message: "Description too long"
"#;

    #[test]
    fn test_scenario_precall_block() {
        let engine = engine(BLOCK_DOC);
        let mut ctx = engine.begin(
            "listing",
            json!({"body": {"description": "x".repeat(30)}}),
        );
        let err = engine.pre_call(&mut ctx).unwrap_err();
        assert_eq!(err.policy, "max_description_length");
        assert_eq!(err.stage, Stage::PreCall);
        assert_eq!(err.message, "Description too long");
        assert_eq!(err.http_status(), 400);
        assert_eq!(ctx.blocked_at(), Some(Stage::PreCall));

        let recorded = ctx.outcomes().last().unwrap();
        assert!(recorded.triggered);
        assert_eq!(recorded.applied_response, Some(ResponseAction::Block));
    }

    #[test]
    fn test_scenario_precall_pass() {
        let engine = engine(BLOCK_DOC);
        let mut ctx = engine.begin("listing", json!({"body": {"description": "short"}}));
        engine.pre_call(&mut ctx).unwrap();
        assert_eq!(ctx.outcomes().len(), 1);
        assert!(!ctx.outcomes()[0].triggered);
    }

    #[test]
    fn test_scenario_midcall_tool_limit() {
        let doc = r#"
global:
  mid_call:
    - kind: guardrail
      name: tool_budget
      rule: "max_tool_calls(context, 2)"
      category: cost
      response: block
"#;
        let engine = engine(doc);
        let mut ctx = engine.begin("researcher", json!({}));
        engine.mid_call(&mut ctx, Some("search")).unwrap();
        engine.mid_call(&mut ctx, Some("fetch")).unwrap();
        let err = engine.mid_call(&mut ctx, Some("search")).unwrap_err();
        assert_eq!(err.stage, Stage::MidCall);
        assert_eq!(err.http_status(), 400);
        assert_eq!(ctx.tool_call_count(), 3);
    }

    const TRUNCATE_DOC: &str = r#"
global:
  post_call:
    - kind: guardrail
      name: reasoning_length
      rule: "max_length(output.reasoning, 10)"
      category: cost
      response: truncate
      truncate_to: 10
"#;

    #[test]
    fn test_scenario_postcall_truncate() {
        let engine = engine(TRUNCATE_DOC);
        let mut ctx = engine.begin("pricing", json!({}));
        let output = json!({"reasoning": "abcdefghijklmnopqrstuvwxy", "price": 10});

        let repaired = engine.post_call(&mut ctx, &output).unwrap();
        assert_eq!(repaired["reasoning"], json!("abcdefghij..."));
        // Untouched fields survive.
        assert_eq!(repaired["price"], json!(10));
        // The input was not mutated.
        assert_eq!(output["reasoning"], json!("abcdefghijklmnopqrstuvwxy"));

        let recorded = ctx.outcomes().last().unwrap();
        assert_eq!(recorded.applied_response, Some(ResponseAction::Truncate));
        assert_eq!(recorded.details["original_length"], json!(25));
        assert_eq!(recorded.details["truncated_to"], json!(10));
    }

    #[test]
    fn test_truncate_converges() {
        let engine = engine(TRUNCATE_DOC);
        let output = json!({"reasoning": "abcdefghijklmnopqrstuvwxy"});

        let mut ctx = engine.begin("pricing", json!({}));
        let once = engine.post_call(&mut ctx, &output).unwrap();
        let mut ctx = engine.begin("pricing", json!({}));
        let twice = engine.post_call(&mut ctx, &once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_fallback_substitution() {
        let doc = r#"
global:
  post_call:
    - kind: guardrail
      name: category_whitelist
      rule: "valid_enum(output.category, ['BOOKS', 'ELECTRONICS'])"
      category: quality
      response: fallback
      fallback_value: "OTHER"
"#;
        let engine = engine(doc);
        let mut ctx = engine.begin("classifier", json!({}));
        let output = json!({"category": "GARDEN"});
        let repaired = engine.post_call(&mut ctx, &output).unwrap();
        assert_eq!(repaired["category"], json!("OTHER"));
        // The substitution happens on a copy; the original output is intact.
        assert_eq!(output["category"], json!("GARDEN"));

        let recorded = ctx.outcomes().last().unwrap();
        assert_eq!(recorded.details["original_value"], json!("GARDEN"));
        assert_eq!(recorded.details["fallback_value"], json!("OTHER"));
    }

    #[test]
    fn test_later_policies_see_repaired_output() {
        let doc = r#"
global:
  post_call:
    - kind: guardrail
      name: shorten
      rule: "max_length(output.text, 5)"
      category: cost
      response: truncate
      truncate_to: 5
      suffix: ""
    - kind: criterion
      name: short_enough
      pillar: efficiency
      tier: binary
      rule: "max_length(output.text, 5)"
"#;
        let engine = engine(doc);
        let mut ctx = engine.begin("a", json!({}));
        engine.post_call(&mut ctx, &json!({"text": "0123456789"})).unwrap();
        let criterion = ctx.outcomes().last().unwrap();
        assert_eq!(criterion.grade, Some(CriterionGrade::Pass));
    }

    const FAIL_DOC_TEMPLATE: &str = r#"
settings:
  fail_open: {FAIL_OPEN}
global:
  post_call:
    - kind: guardrail
      name: enum_check
      rule: "valid_enum(output.tag, request.allowed)"
      category: quality
      response: block
"#;

    #[test]
    fn test_scenario_fail_open_continues() {
        let doc = FAIL_DOC_TEMPLATE.replace("{FAIL_OPEN}", "true");
        let engine = engine(&doc);
        let mut ctx = engine.begin("a", json!({}));
        // request.allowed is absent, so valid_enum errors at evaluation.
        let out = engine.post_call(&mut ctx, &json!({"tag": "x"})).unwrap();
        assert_eq!(out["tag"], json!("x"));

        let recorded = ctx.outcomes().last().unwrap();
        assert!(!recorded.triggered);
        assert!(recorded.message.as_deref().unwrap().contains("evaluation failed"));
    }

    #[test]
    fn test_scenario_fail_closed_blocks() {
        let doc = FAIL_DOC_TEMPLATE.replace("{FAIL_OPEN}", "false");
        let engine = engine(&doc);
        let mut ctx = engine.begin("a", json!({}));
        let err = engine.post_call(&mut ctx, &json!({"tag": "x"})).unwrap_err();
        assert_eq!(err.policy, "enum_check");
        assert!(err.message.contains("could not be evaluated"));
        assert_eq!(err.http_status(), 500);
    }

    #[test]
    fn test_block_short_circuits_stage() {
        let doc = r#"
global:
  pre_call:
    - kind: guardrail
      name: first
      rule: "required(request.body)"
      category: quality
      response: block
    - kind: guardrail
      name: second
      rule: "required(request.body)"
      category: quality
      response: block
"#;
        let engine = engine(doc);
        let mut ctx = engine.begin("a", json!({}));
        let err = engine.pre_call(&mut ctx).unwrap_err();
        assert_eq!(err.policy, "first");
        // Only the blocking policy recorded an outcome.
        assert_eq!(ctx.outcomes().len(), 1);
    }

    const CRITERIA_DOC: &str = r#"
global:
  post_call:
    - kind: criterion
      name: latency
      pillar: efficiency
      tier: quantitative
      signal: duration_ms
      rule: "< 3000"
      warning: "< 2000"
    - kind: criterion
      name: no_errors
      pillar: reliability
      tier: binary
      rule: "has_error == false"
    - kind: criterion
      name: helpfulness
      pillar: effectiveness
      tier: judgment
"#;

    fn grade_of(ctx: &ExecutionContext, name: &str) -> CriterionGrade {
        ctx.outcomes()
            .iter()
            .find(|o| o.policy == name)
            .and_then(|o| o.grade)
            .unwrap()
    }

    #[test]
    fn test_criteria_grading() {
        let engine = engine(CRITERIA_DOC);
        let mut ctx = engine.begin("a", json!({}));
        ctx.set_metrics(crate::context::CallMetrics {
            duration_ms: Some(1500.0),
            ..Default::default()
        });
        engine.post_call(&mut ctx, &json!({"text": "ok"})).unwrap();

        assert_eq!(grade_of(&ctx, "latency"), CriterionGrade::Pass);
        assert_eq!(grade_of(&ctx, "no_errors"), CriterionGrade::Pass);
        assert_eq!(grade_of(&ctx, "helpfulness"), CriterionGrade::Skipped);
    }

    #[test]
    fn test_criteria_warning_band() {
        let engine = engine(CRITERIA_DOC);
        let mut ctx = engine.begin("a", json!({}));
        ctx.set_metrics(crate::context::CallMetrics {
            duration_ms: Some(2500.0),
            ..Default::default()
        });
        engine.post_call(&mut ctx, &json!({})).unwrap();
        assert_eq!(grade_of(&ctx, "latency"), CriterionGrade::Warning);
    }

    #[test]
    fn test_criteria_fail_never_interrupts() {
        let engine = engine(CRITERIA_DOC);
        let mut ctx = engine.begin("a", json!({}));
        ctx.set_metrics(crate::context::CallMetrics {
            duration_ms: Some(9000.0),
            ..Default::default()
        });
        ctx.set_error("upstream timeout");
        engine.post_call(&mut ctx, &json!({})).unwrap();
        assert_eq!(grade_of(&ctx, "latency"), CriterionGrade::Fail);
        assert_eq!(grade_of(&ctx, "no_errors"), CriterionGrade::Fail);
    }

    #[test]
    fn test_tool_count_signal_sees_recorded_calls() {
        let doc = r#"
global:
  post_call:
    - kind: criterion
      name: tool_usage
      pillar: efficiency
      tier: quantitative
      signal: tool_count
      rule: "< 2"
"#;
        let engine = engine(doc);
        let mut ctx = engine.begin("researcher", json!({}));
        for _ in 0..5 {
            engine.mid_call(&mut ctx, Some("search")).unwrap();
        }
        engine.post_call(&mut ctx, &json!({})).unwrap();

        let outcome = ctx.outcomes().last().unwrap();
        assert_eq!(outcome.grade, Some(CriterionGrade::Fail));
        assert_eq!(outcome.observed, Some(json!(5)));
    }

    #[test]
    fn test_criteria_missing_signal_skipped() {
        let engine = engine(CRITERIA_DOC);
        let mut ctx = engine.begin("a", json!({}));
        // No metrics supplied at all.
        engine.post_call(&mut ctx, &json!({})).unwrap();
        assert_eq!(grade_of(&ctx, "latency"), CriterionGrade::Skipped);
    }

    #[test]
    fn test_disabled_policy_not_evaluated() {
        let doc = r#"
global:
  pre_call:
    - kind: guardrail
      name: off
      rule: "required(request.body)"
      category: quality
      response: block
      enabled: false
"#;
        let engine = engine(doc);
        let mut ctx = engine.begin("a", json!({}));
        engine.pre_call(&mut ctx).unwrap();
        assert!(ctx.outcomes().is_empty());
    }

    #[test]
    fn test_empty_registry_is_noop() {
        let engine = StageEngine::new(Arc::new(PolicyRegistry::empty()));
        let mut ctx = engine.begin("a", json!({"anything": 1}));
        engine.pre_call(&mut ctx).unwrap();
        engine.mid_call(&mut ctx, Some("tool")).unwrap();
        let out = engine.post_call(&mut ctx, &json!({"x": 1})).unwrap();
        assert_eq!(out, json!({"x": 1}));
        assert!(ctx.outcomes().is_empty());
    }

    proptest! {
        #[test]
        fn prop_truncation_converges(s in ".{0,120}", budget in 1usize..50) {
            let once = truncated(&s, budget, "...").unwrap_or_else(|| s.clone());
            let twice = truncated(&once, budget, "...").unwrap_or_else(|| once.clone());
            prop_assert_eq!(&once, &twice);
        }

        #[test]
        fn prop_within_budget_untouched(s in ".{0,40}") {
            let budget = s.chars().count().max(1);
            prop_assert!(truncated(&s, budget, "...").is_none());
        }
    }
}
