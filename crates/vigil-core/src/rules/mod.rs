//! Safe rule expression evaluation.
//!
//! Rules are small declarative expressions loaded from untrusted
//! configuration. They are parsed once, at registry load time, into a tagged
//! AST and interpreted by explicit dispatch against a closed whitelist of
//! built-in functions — never by evaluating host-language code.
//!
//! Two forms are supported:
//!
//! 1. Function call: `max_length(request.body.description, 2000)`
//! 2. Comparison: `duration_ms < 3000`, `output.category in ['A', 'B']`
//!
//! Comparison left operands may carry an aggregate prefix (`p95`, `mean`,
//! ...). The prefix is accepted syntactically and recorded in the AST, but
//! evaluation applies the comparison to the single current observation; a
//! rolling-window interpretation is a future extension.

mod builtins;
mod parser;

pub use builtins::{builtin_names, lookup_builtin};

use serde_json::Value;
use thiserror::Error;

use crate::signals::{value_as_f64, values_equal, Resolved, Snapshot};

/// Errors from rule parsing or evaluation.
///
/// Parse-time variants (`Parse`, `UnknownFunction`, `Arity`) surface as
/// configuration errors at registry load. `Evaluation` occurs against live
/// call data and is handled by the stage engine's fail-open/fail-closed
/// setting.
#[derive(Error, Debug, Clone)]
pub enum RuleError {
    #[error("cannot parse rule: {0}")]
    Parse(String),

    #[error("unknown rule function: {0}")]
    UnknownFunction(String),

    #[error("{function} expects {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: String,
        got: usize,
    },

    #[error("rule evaluation failed: {0}")]
    Evaluation(String),
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    In,
    NotIn,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }
}

/// A rule argument or comparison operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// String, number, boolean, null, or list literal.
    Literal(Value),
    /// Dotted field-path reference, resolved against the snapshot.
    Path(String),
}

/// Parsed rule expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `name(arg, arg, ...)` against a whitelisted built-in.
    Call { name: String, args: Vec<Arg> },

    /// `[aggregate] [left] op right`.
    ///
    /// `left` is `None` for subject-relative thresholds (`"< 3000"`,
    /// `"p95 < 3000"`), where the compared value is the snapshot's subject.
    Compare {
        aggregate: Option<String>,
        left: Option<Arg>,
        op: CmpOp,
        right: Arg,
    },
}

/// Result of evaluating a rule against one snapshot.
#[derive(Debug, Clone)]
pub struct Verdict {
    /// Whether the rule passed.
    pub passed: bool,

    /// The resolved left-hand value, for comparisons.
    pub observed: Option<Value>,

    /// Threshold report, e.g. `"3500 < 3000 = false"`.
    pub report: Option<String>,
}

impl Expr {
    /// Parse a rule string into an expression.
    pub fn parse(src: &str) -> Result<Expr, RuleError> {
        parser::parse_expr(src)
    }

    /// Load-time check: function names must be whitelisted built-ins with a
    /// matching argument count. Fails closed on unknown identifiers.
    pub fn static_check(&self) -> Result<(), RuleError> {
        match self {
            Expr::Call { name, args } => {
                let builtin = lookup_builtin(name)
                    .ok_or_else(|| RuleError::UnknownFunction(name.clone()))?;
                builtin.check_arity(args.len())
            }
            Expr::Compare { .. } => Ok(()),
        }
    }

    /// True for comparisons with no explicit left operand; such rules need a
    /// subject signal attached to the snapshot.
    pub fn has_implicit_subject(&self) -> bool {
        matches!(self, Expr::Compare { left: None, .. })
    }

    /// True if this expression is a comparison against a numeric literal,
    /// as required for quantitative criteria.
    pub fn is_numeric_comparison(&self) -> bool {
        match self {
            Expr::Compare {
                op: CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge | CmpOp::Eq | CmpOp::Ne,
                right: Arg::Literal(v),
                ..
            } => value_as_f64(v).is_some(),
            _ => false,
        }
    }

    /// First path argument starting with `prefix`, with the prefix stripped.
    /// The stage engine uses this to find the output field a truncate or
    /// fallback response targets.
    pub fn first_path_with_prefix(&self, prefix: &str) -> Option<&str> {
        let args: Vec<&Arg> = match self {
            Expr::Call { args, .. } => args.iter().collect(),
            Expr::Compare { left, right, .. } => {
                left.iter().chain(std::iter::once(right)).collect()
            }
        };
        args.iter().find_map(|arg| match arg {
            Arg::Path(p) => p.strip_prefix(prefix),
            Arg::Literal(_) => None,
        })
    }

    /// Evaluate against a snapshot.
    pub fn evaluate(&self, scope: &Snapshot<'_>) -> Result<Verdict, RuleError> {
        match self {
            Expr::Call { name, args } => {
                let builtin = lookup_builtin(name)
                    .ok_or_else(|| RuleError::UnknownFunction(name.clone()))?;
                let resolved: Vec<Resolved> =
                    args.iter().map(|a| resolve_arg(a, scope)).collect();
                let passed = builtin.run(&resolved)?;
                Ok(Verdict {
                    passed,
                    observed: None,
                    report: None,
                })
            }
            Expr::Compare { left, op, right, .. } => {
                let lhs = match left {
                    Some(arg) => resolve_arg(arg, scope),
                    None => scope.subject().cloned().ok_or_else(|| {
                        RuleError::Evaluation(
                            "comparison has no left operand and no signal was supplied"
                                .to_string(),
                        )
                    })?,
                };
                let rhs = resolve_arg(right, scope);
                let passed = compare(*op, &lhs, &rhs);
                let observed = lhs.as_value().cloned();
                let report = Some(format!(
                    "{} {} {} = {}",
                    render(&lhs),
                    op.as_str(),
                    render(&rhs),
                    passed
                ));
                Ok(Verdict {
                    passed,
                    observed,
                    report,
                })
            }
        }
    }
}

fn resolve_arg(arg: &Arg, scope: &Snapshot<'_>) -> Resolved {
    match arg {
        Arg::Literal(v) => Resolved::Value(v.clone()),
        Arg::Path(p) => scope.resolve(p),
    }
}

fn render(r: &Resolved) -> String {
    match r {
        Resolved::Absent => "absent".to_string(),
        Resolved::Value(v) => v.to_string(),
    }
}

/// Comparison semantics:
/// - `==`/`!=` treat absent as `null` and compare numbers numerically;
/// - ordering operators are false when either side is absent or the sides
///   are not both numbers or both strings;
/// - `in` is false when the container is absent, `not in` is true;
///   array containers test membership, string containers test substrings.
fn compare(op: CmpOp, lhs: &Resolved, rhs: &Resolved) -> bool {
    match op {
        CmpOp::Eq => values_equal(&lhs.to_value(), &rhs.to_value()),
        CmpOp::Ne => !values_equal(&lhs.to_value(), &rhs.to_value()),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
                return apply_ordering(op, a.partial_cmp(&b));
            }
            match (lhs.as_value(), rhs.as_value()) {
                (Some(Value::String(a)), Some(Value::String(b))) => {
                    apply_ordering(op, a.partial_cmp(b))
                }
                _ => false,
            }
        }
        CmpOp::In => contains(rhs, lhs).unwrap_or(false),
        CmpOp::NotIn => contains(rhs, lhs).map(|c| !c).unwrap_or(true),
    }
}

fn apply_ordering(op: CmpOp, ord: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    match (op, ord) {
        (CmpOp::Lt, Some(Less)) => true,
        (CmpOp::Le, Some(Less | Equal)) => true,
        (CmpOp::Gt, Some(Greater)) => true,
        (CmpOp::Ge, Some(Greater | Equal)) => true,
        _ => false,
    }
}

/// `None` when the container is absent.
fn contains(container: &Resolved, item: &Resolved) -> Option<bool> {
    let container = container.as_value()?;
    match container {
        Value::Array(items) => {
            let needle = item.to_value();
            Some(items.iter().any(|v| values_equal(v, &needle)))
        }
        Value::String(s) => match item.as_value() {
            Some(Value::String(sub)) => Some(s.contains(sub.as_str())),
            _ => Some(false),
        },
        Value::Null => None,
        _ => Some(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(rule: &str, root: &Value) -> bool {
        let expr = Expr::parse(rule).unwrap();
        expr.static_check().unwrap();
        expr.evaluate(&Snapshot::new(root)).unwrap().passed
    }

    #[test]
    fn test_function_call_rule() {
        let root = json!({"request": {"body": {"description": "short"}}});
        assert!(eval("max_length(request.body.description, 10)", &root));
        assert!(!eval("max_length(request.body.description, 3)", &root));
    }

    #[test]
    fn test_comparison_rule() {
        let root = json!({"metrics": {"duration_ms": 2500}});
        assert!(eval("duration_ms < 3000", &root));
        assert!(!eval("duration_ms < 2000", &root));
        assert!(eval("duration_ms >= 2500", &root));
    }

    #[test]
    fn test_comparison_against_absent_is_false() {
        let root = json!({});
        assert!(!eval("metrics.duration_ms < 3000", &root));
        assert!(!eval("metrics.duration_ms > 0", &root));
    }

    #[test]
    fn test_equality_with_absent_and_null() {
        let root = json!({"error": null});
        assert!(eval("error == null", &root));
        // Absent also collapses to null for equality.
        assert!(eval("missing_field == null", &root));
        assert!(!eval("error != null", &root));
    }

    #[test]
    fn test_in_operator() {
        let root = json!({"output": {"category": "BOOKS"}});
        assert!(eval("output.category in ['BOOKS', 'ELECTRONICS']", &root));
        assert!(!eval("output.category in ['FOOD']", &root));
        assert!(eval("output.category not in ['FOOD']", &root));
    }

    #[test]
    fn test_in_with_absent_container() {
        let root = json!({});
        assert!(!eval("'a' in request.allowed", &root));
        assert!(eval("'a' not in request.allowed", &root));
    }

    #[test]
    fn test_string_substring_membership() {
        let root = json!({"output": "the quick brown fox"});
        assert!(eval("'quick' in output", &root));
        assert!(!eval("'slow' in output", &root));
    }

    #[test]
    fn test_unknown_function_fails_static_check() {
        let expr = Expr::parse("summon_demons(output, 3)").unwrap();
        assert!(matches!(
            expr.static_check(),
            Err(RuleError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_arity_checked_at_load() {
        let expr = Expr::parse("max_length(output)").unwrap();
        assert!(matches!(expr.static_check(), Err(RuleError::Arity { .. })));
    }

    #[test]
    fn test_subject_relative_threshold() {
        let root = json!({"metrics": {"duration_ms": 2500}});
        let expr = Expr::parse("< 3000").unwrap();
        assert!(expr.has_implicit_subject());

        let snap = Snapshot::new(&root);
        let subject = snap.resolve("duration_ms");
        let verdict = expr
            .evaluate(&Snapshot::new(&root).with_subject(subject))
            .unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.observed, Some(json!(2500)));
    }

    #[test]
    fn test_aggregate_prefix_single_observation() {
        // "p95 < 3000" evaluates the current observation; the prefix is
        // only recorded.
        let root = json!({});
        let expr = Expr::parse("p95 < 3000").unwrap();
        assert!(expr.has_implicit_subject());
        match &expr {
            Expr::Compare { aggregate, .. } => {
                assert_eq!(aggregate.as_deref(), Some("p95"))
            }
            _ => panic!("expected comparison"),
        }

        let verdict = expr
            .evaluate(&Snapshot::new(&root).with_subject(Resolved::Value(json!(2000))))
            .unwrap();
        assert!(verdict.passed);
    }

    #[test]
    fn test_numeric_comparison_detection() {
        assert!(Expr::parse("duration_ms < 3000").unwrap().is_numeric_comparison());
        assert!(Expr::parse("< 0.85").unwrap().is_numeric_comparison());
        assert!(!Expr::parse("output.category in ['A']").unwrap().is_numeric_comparison());
        assert!(!Expr::parse("required(output)").unwrap().is_numeric_comparison());
    }

    #[test]
    fn test_first_path_with_prefix() {
        let expr = Expr::parse("max_length(output.reasoning, 500)").unwrap();
        assert_eq!(expr.first_path_with_prefix("output."), Some("reasoning"));

        let expr = Expr::parse("max_length(request.body, 500)").unwrap();
        assert_eq!(expr.first_path_with_prefix("output."), None);
    }

    #[test]
    fn test_missing_subject_is_evaluation_error() {
        let root = json!({});
        let expr = Expr::parse("< 10").unwrap();
        let result = expr.evaluate(&Snapshot::new(&root));
        assert!(matches!(result, Err(RuleError::Evaluation(_))));
    }

    #[test]
    fn test_deterministic_evaluation() {
        // Same expression, same snapshot: bit-for-bit identical verdicts.
        let root = json!({"metrics": {"duration_ms": 1500}});
        let expr = Expr::parse("duration_ms < 3000").unwrap();
        let a = expr.evaluate(&Snapshot::new(&root)).unwrap();
        let b = expr.evaluate(&Snapshot::new(&root)).unwrap();
        assert_eq!(a.passed, b.passed);
        assert_eq!(a.observed, b.observed);
        assert_eq!(a.report, b.report);
    }
}
