//! The closed whitelist of rule functions.
//!
//! Every function takes already-resolved arguments and returns pass/fail.
//! Absent handling is per-function and deliberate: a limit check on a field
//! that is not there passes (`max_length`), while a presence check fails
//! (`required`, `min_length`). Functions that need live execution counters
//! read them from the context projection object passed as their first
//! argument.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use super::RuleError;
use crate::signals::{value_as_f64, values_equal, Resolved};

type BuiltinFn = fn(&[Resolved]) -> Result<bool, RuleError>;

/// A whitelisted rule function.
pub struct Builtin {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    run: BuiltinFn,
}

impl Builtin {
    pub fn check_arity(&self, got: usize) -> Result<(), RuleError> {
        if got < self.min_args || got > self.max_args {
            let expected = if self.min_args == self.max_args {
                self.min_args.to_string()
            } else {
                format!("{} to {}", self.min_args, self.max_args)
            };
            return Err(RuleError::Arity {
                function: self.name.to_string(),
                expected,
                got,
            });
        }
        Ok(())
    }

    pub fn run(&self, args: &[Resolved]) -> Result<bool, RuleError> {
        self.check_arity(args.len())?;
        (self.run)(args)
    }
}

lazy_static! {
    static ref REGISTRY: HashMap<&'static str, Builtin> = {
        let entries = [
            Builtin { name: "max_length", min_args: 2, max_args: 2, run: max_length },
            Builtin { name: "min_length", min_args: 2, max_args: 2, run: min_length },
            Builtin { name: "required", min_args: 1, max_args: 1, run: required },
            Builtin { name: "valid_json", min_args: 1, max_args: 1, run: valid_json },
            Builtin { name: "valid_enum", min_args: 2, max_args: 2, run: valid_enum },
            Builtin { name: "in_range", min_args: 3, max_args: 3, run: in_range },
            Builtin { name: "required_fields", min_args: 2, max_args: 2, run: required_fields },
            Builtin { name: "matches_pattern", min_args: 2, max_args: 2, run: matches_pattern },
            Builtin { name: "max_tool_calls", min_args: 2, max_args: 2, run: max_tool_calls },
            Builtin { name: "max_iterations", min_args: 2, max_args: 2, run: max_iterations },
            Builtin { name: "allowed_tools", min_args: 2, max_args: 2, run: allowed_tools },
            Builtin { name: "timeout", min_args: 2, max_args: 2, run: timeout },
        ];
        let mut map = HashMap::new();
        for entry in entries {
            map.insert(entry.name, entry);
        }
        map
    };
}

/// Look up a built-in by name.
pub fn lookup_builtin(name: &str) -> Option<&'static Builtin> {
    REGISTRY.get(name)
}

/// Sorted names of all built-ins, for diagnostics and the CLI.
pub fn builtin_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = REGISTRY.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Textual length of a value: character count for strings, serialized
/// length otherwise.
fn text_len(v: &Value) -> usize {
    match v {
        Value::String(s) => s.chars().count(),
        other => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
    }
}

fn text_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric argument that must be a configuration literal.
fn expect_number(args: &[Resolved], idx: usize, function: &str) -> Result<f64, RuleError> {
    args.get(idx)
        .and_then(|r| r.as_f64())
        .ok_or_else(|| {
            RuleError::Evaluation(format!("{function}: argument {} must be numeric", idx + 1))
        })
}

fn expect_list<'a>(
    args: &'a [Resolved],
    idx: usize,
    function: &str,
) -> Result<&'a [Value], RuleError> {
    match args.get(idx).and_then(|r| r.as_value()) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(RuleError::Evaluation(format!(
            "{function}: argument {} must be a list",
            idx + 1
        ))),
    }
}

/// Context projection field, for behavioral functions. The first argument of
/// those functions must resolve to the execution-context object.
fn context_field(args: &[Resolved], field: &str, function: &str) -> Result<Value, RuleError> {
    match args.first().and_then(|r| r.as_value()) {
        Some(Value::Object(map)) => map.get(field).cloned().ok_or_else(|| {
            RuleError::Evaluation(format!(
                "{function}: execution context has no {field:?} field"
            ))
        }),
        _ => Err(RuleError::Evaluation(format!(
            "{function}: first argument must be the execution context"
        ))),
    }
}

/// `max_length(value, n)`: absent or null passes; otherwise the textual
/// length must not exceed `n`.
fn max_length(args: &[Resolved]) -> Result<bool, RuleError> {
    let limit = expect_number(args, 1, "max_length")?;
    match args[0].as_value() {
        None | Some(Value::Null) => Ok(true),
        Some(v) => Ok(text_len(v) as f64 <= limit),
    }
}

/// `min_length(value, n)`: absent or null fails; whitespace is trimmed
/// before measuring.
fn min_length(args: &[Resolved]) -> Result<bool, RuleError> {
    let limit = expect_number(args, 1, "min_length")?;
    match args[0].as_value() {
        None | Some(Value::Null) => Ok(false),
        Some(v) => Ok(text_of(v).trim().chars().count() as f64 >= limit),
    }
}

/// `required(value)`: fails for absent, null, blank strings, and empty
/// collections.
fn required(args: &[Resolved]) -> Result<bool, RuleError> {
    Ok(is_required(&args[0]))
}

fn is_required(value: &Resolved) -> bool {
    match value.as_value() {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
        Some(_) => true,
    }
}

/// `valid_json(value)`: structured values pass as-is, strings must parse.
fn valid_json(args: &[Resolved]) -> Result<bool, RuleError> {
    match args[0].as_value() {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Object(_)) | Some(Value::Array(_)) => Ok(true),
        Some(Value::String(s)) => Ok(serde_json::from_str::<Value>(s).is_ok()),
        Some(_) => Ok(false),
    }
}

/// `valid_enum(value, [allowed...])`.
fn valid_enum(args: &[Resolved]) -> Result<bool, RuleError> {
    let allowed = expect_list(args, 1, "valid_enum")?;
    let value = args[0].to_value();
    Ok(allowed.iter().any(|v| values_equal(v, &value)))
}

/// `in_range(value, lo, hi)`: inclusive on both ends; absent or non-numeric
/// values fail.
fn in_range(args: &[Resolved]) -> Result<bool, RuleError> {
    let lo = expect_number(args, 1, "in_range")?;
    let hi = expect_number(args, 2, "in_range")?;
    match args[0].as_f64() {
        Some(v) => Ok(lo <= v && v <= hi),
        None => Ok(false),
    }
}

/// `required_fields(obj, [names...])`: every named field must be present and
/// pass the `required` test.
fn required_fields(args: &[Resolved]) -> Result<bool, RuleError> {
    let fields = expect_list(args, 1, "required_fields")?;
    let map = match args[0].as_value() {
        Some(Value::Object(map)) => map,
        _ => return Ok(false),
    };
    for field in fields {
        let name = match field {
            Value::String(s) => s.as_str(),
            _ => {
                return Err(RuleError::Evaluation(
                    "required_fields: field names must be strings".to_string(),
                ))
            }
        };
        let present = map
            .get(name)
            .map(|v| is_required(&Resolved::Value(v.clone())))
            .unwrap_or(false);
        if !present {
            return Ok(false);
        }
    }
    Ok(true)
}

/// `matches_pattern(value, pattern)`: anchored at the start of the text.
/// An invalid pattern fails the rule rather than erroring.
fn matches_pattern(args: &[Resolved]) -> Result<bool, RuleError> {
    let pattern = match args[1].as_value() {
        Some(Value::String(p)) => p.clone(),
        _ => {
            return Err(RuleError::Evaluation(
                "matches_pattern: pattern must be a string".to_string(),
            ))
        }
    };
    let value = match args[0].as_value() {
        None | Some(Value::Null) => return Ok(false),
        Some(v) => text_of(v),
    };
    match Regex::new(&format!("^(?:{pattern})")) {
        Ok(re) => Ok(re.is_match(&value)),
        Err(_) => Ok(false),
    }
}

/// `max_tool_calls(context, n)`.
fn max_tool_calls(args: &[Resolved]) -> Result<bool, RuleError> {
    let limit = expect_number(args, 1, "max_tool_calls")?;
    let count = context_field(args, "tool_call_count", "max_tool_calls")?;
    let count = value_as_f64(&count).ok_or_else(|| {
        RuleError::Evaluation("max_tool_calls: tool_call_count is not numeric".to_string())
    })?;
    Ok(count <= limit)
}

/// `max_iterations(context, n)`.
fn max_iterations(args: &[Resolved]) -> Result<bool, RuleError> {
    let limit = expect_number(args, 1, "max_iterations")?;
    let count = context_field(args, "iteration_count", "max_iterations")?;
    let count = value_as_f64(&count).ok_or_else(|| {
        RuleError::Evaluation("max_iterations: iteration_count is not numeric".to_string())
    })?;
    Ok(count <= limit)
}

/// `allowed_tools(context, [names...])`: passes when no tools were used,
/// otherwise every used tool must be in the allowed list.
fn allowed_tools(args: &[Resolved]) -> Result<bool, RuleError> {
    let allowed = expect_list(args, 1, "allowed_tools")?;
    let used = context_field(args, "tool_calls", "allowed_tools")?;
    let used = match used {
        Value::Array(items) => items,
        _ => {
            return Err(RuleError::Evaluation(
                "allowed_tools: tool_calls is not a list".to_string(),
            ))
        }
    };
    if used.is_empty() {
        return Ok(true);
    }
    Ok(used
        .iter()
        .all(|tool| allowed.iter().any(|a| values_equal(a, tool))))
}

/// `timeout(context, limit_ms)`.
fn timeout(args: &[Resolved]) -> Result<bool, RuleError> {
    let limit = expect_number(args, 1, "timeout")?;
    let elapsed = context_field(args, "elapsed_ms", "timeout")?;
    let elapsed = value_as_f64(&elapsed).ok_or_else(|| {
        RuleError::Evaluation("timeout: elapsed_ms is not numeric".to_string())
    })?;
    Ok(elapsed <= limit)
}
