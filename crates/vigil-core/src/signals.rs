//! Signal extraction: resolving dotted field paths and named computed
//! signals from a call snapshot.
//!
//! Resolution never errors on a missing path. It returns [`Resolved::Absent`],
//! which is distinguishable from a field that is present but `null`.

use serde_json::Value;

/// Result of resolving a path against a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// The path did not lead to a value.
    Absent,
    /// The path resolved, possibly to `null`.
    Value(Value),
}

impl Resolved {
    pub fn is_absent(&self) -> bool {
        matches!(self, Resolved::Absent)
    }

    /// Present and not `null`.
    pub fn is_some(&self) -> bool {
        matches!(self, Resolved::Value(v) if !v.is_null())
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Resolved::Absent => None,
            Resolved::Value(v) => Some(v),
        }
    }

    /// Numeric view: a JSON number, or a string that parses as one.
    pub fn as_f64(&self) -> Option<f64> {
        self.as_value().and_then(value_as_f64)
    }

    /// Collapse `Absent` into `null` for equality-style comparisons.
    pub fn to_value(&self) -> Value {
        match self {
            Resolved::Absent => Value::Null,
            Resolved::Value(v) => v.clone(),
        }
    }
}

/// Numeric coercion used by rules: numbers directly, numeric strings parsed.
pub fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Loose equality for rule comparisons: numbers compare numerically
/// (`3000 == 3000.0`), everything else compares structurally.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (value_as_strict_f64(a), value_as_strict_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn value_as_strict_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// A read-only view over a structured call snapshot.
///
/// The root is a JSON document assembled by the stage engine (`request`,
/// `output`, `context`, `metrics`). A snapshot may carry a *subject* value:
/// the signal a criterion's threshold expression compares against when its
/// left operand is implicit (`"p95 < 3000"`).
pub struct Snapshot<'a> {
    root: &'a Value,
    subject: Option<Resolved>,
}

impl<'a> Snapshot<'a> {
    pub fn new(root: &'a Value) -> Self {
        Self { root, subject: None }
    }

    /// Attach a subject for implicit-left comparisons.
    pub fn with_subject(mut self, subject: Resolved) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn subject(&self) -> Option<&Resolved> {
        self.subject.as_ref()
    }

    /// Resolve a dotted path or named signal.
    ///
    /// Shorthand signals (`duration_ms`, `total_tokens`, ...) alias into
    /// `metrics.*`; computed signals (`tool_count`, `has_error`,
    /// `response_length`, `tokens_per_second`, `error`) are derived at
    /// resolution time and not stored literally.
    pub fn resolve(&self, path: &str) -> Resolved {
        match path {
            "error" => resolve_path(self.root, "error"),
            "has_error" => {
                let err = resolve_path(self.root, "error");
                Resolved::Value(Value::Bool(err.is_some()))
            }
            "tool_count" => {
                // Live evaluation sees tool names in the context projection;
                // stored records keep them at the top level.
                let calls = match resolve_path(self.root, "context.tool_calls") {
                    Resolved::Absent => resolve_path(self.root, "tool_calls"),
                    found => found,
                };
                match calls {
                    Resolved::Value(Value::Array(calls)) => {
                        Resolved::Value(Value::from(calls.len()))
                    }
                    _ => Resolved::Value(Value::from(0)),
                }
            }
            "response_length" => self.response_length(),
            "tokens_per_second" => self.tokens_per_second(),
            "duration_ms" => resolve_path(self.root, "metrics.duration_ms"),
            "input_tokens" => resolve_path(self.root, "metrics.input_tokens"),
            "output_tokens" => resolve_path(self.root, "metrics.output_tokens"),
            "total_tokens" => resolve_path(self.root, "metrics.total_tokens"),
            _ => resolve_path(self.root, path),
        }
    }

    fn response_length(&self) -> Resolved {
        let output = match resolve_path(self.root, "output") {
            Resolved::Value(v) => v,
            Resolved::Absent => return Resolved::Value(Value::from(0)),
        };
        let len = match &output {
            Value::String(s) => s.chars().count(),
            Value::Null => 0,
            other => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
        };
        Resolved::Value(Value::from(len))
    }

    fn tokens_per_second(&self) -> Resolved {
        let duration = resolve_path(self.root, "metrics.duration_ms")
            .as_f64()
            .unwrap_or(0.0);
        if duration == 0.0 {
            return Resolved::Value(Value::from(0.0));
        }
        let output_tokens = resolve_path(self.root, "metrics.output_tokens")
            .as_f64()
            .unwrap_or(0.0);
        Resolved::Value(Value::from(output_tokens / duration * 1000.0))
    }
}

/// Dot-separated traversal over a JSON value.
///
/// Object segments look up keys, numeric segments index arrays. A missing
/// intermediate or a `null` on the way down yields `Absent`; a key that is
/// present with value `null` yields `Value(Null)`.
pub fn resolve_path(root: &Value, path: &str) -> Resolved {
    let mut current = root;
    for part in path.split('.') {
        match current {
            Value::Object(map) => match map.get(part) {
                Some(next) => current = next,
                None => return Resolved::Absent,
            },
            Value::Array(items) => match part.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => current = next,
                None => return Resolved::Absent,
            },
            _ => return Resolved::Absent,
        }
    }
    Resolved::Value(current.clone())
}

/// Set a nested field, creating intermediate objects as needed.
///
/// Used by the stage engine when applying truncate/fallback responses to an
/// output copy.
pub(crate) fn set_path(root: &mut Value, path: &str, new: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            if let Value::Object(map) = current {
                map.insert(part.to_string(), new);
            }
            return;
        }
        match current {
            Value::Object(map) => {
                current = map
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
            }
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_nested_path() {
        let root = json!({"request": {"body": {"description": "hello"}}});
        let snap = Snapshot::new(&root);
        assert_eq!(
            snap.resolve("request.body.description"),
            Resolved::Value(json!("hello"))
        );
    }

    #[test]
    fn test_missing_path_is_absent_not_null() {
        let root = json!({"request": {"present_null": null}});
        let snap = Snapshot::new(&root);
        assert_eq!(snap.resolve("request.missing"), Resolved::Absent);
        assert_eq!(snap.resolve("request.present_null"), Resolved::Value(Value::Null));
        assert_eq!(snap.resolve("nothing.at.all"), Resolved::Absent);
    }

    #[test]
    fn test_array_index_traversal() {
        let root = json!({"tool_calls": [{"name": "search"}, {"name": "fetch"}]});
        let snap = Snapshot::new(&root);
        assert_eq!(
            snap.resolve("tool_calls.1.name"),
            Resolved::Value(json!("fetch"))
        );
        assert_eq!(snap.resolve("tool_calls.7.name"), Resolved::Absent);
    }

    #[test]
    fn test_metric_shorthand() {
        let root = json!({"metrics": {"duration_ms": 1200, "total_tokens": 95}});
        let snap = Snapshot::new(&root);
        assert_eq!(snap.resolve("duration_ms"), Resolved::Value(json!(1200)));
        assert_eq!(snap.resolve("total_tokens"), Resolved::Value(json!(95)));
    }

    #[test]
    fn test_computed_signals() {
        let root = json!({
            "error": null,
            "output": "abcdef",
            "tool_calls": [{"name": "search"}],
            "metrics": {"duration_ms": 2000, "output_tokens": 100},
        });
        let snap = Snapshot::new(&root);
        assert_eq!(snap.resolve("has_error"), Resolved::Value(json!(false)));
        assert_eq!(snap.resolve("tool_count"), Resolved::Value(json!(1)));
        assert_eq!(snap.resolve("response_length"), Resolved::Value(json!(6)));
        assert_eq!(snap.resolve("tokens_per_second"), Resolved::Value(json!(50.0)));
    }

    #[test]
    fn test_tool_count_reads_context_projection() {
        let root = json!({"context": {"tool_calls": ["search", "fetch", "search"]}});
        let snap = Snapshot::new(&root);
        assert_eq!(snap.resolve("tool_count"), Resolved::Value(json!(3)));

        // Stored records keep tool names at the top level.
        let root = json!({"tool_calls": ["search"]});
        let snap = Snapshot::new(&root);
        assert_eq!(snap.resolve("tool_count"), Resolved::Value(json!(1)));
    }

    #[test]
    fn test_has_error_true() {
        let root = json!({"error": "upstream timeout"});
        let snap = Snapshot::new(&root);
        assert_eq!(snap.resolve("has_error"), Resolved::Value(json!(true)));
    }

    #[test]
    fn test_numeric_string_coercion() {
        let r = Resolved::Value(json!("42.5"));
        assert_eq!(r.as_f64(), Some(42.5));
        assert_eq!(Resolved::Value(json!(true)).as_f64(), None);
    }

    #[test]
    fn test_values_equal_numeric() {
        assert!(values_equal(&json!(3000), &json!(3000.0)));
        assert!(!values_equal(&json!("3000"), &json!(3000)));
        assert!(values_equal(&json!("a"), &json!("a")));
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut root = json!({"output": {}});
        set_path(&mut root, "output.nested.field", json!("v"));
        assert_eq!(root["output"]["nested"]["field"], json!("v"));
    }
}
