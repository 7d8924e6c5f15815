//! Rule string parsing.
//!
//! The grammar is deliberately tiny. A rule is either a function call over
//! literal/path arguments or a single comparison; there is no nesting, no
//! boolean connectives, no arithmetic. Anything the grammar does not
//! recognize is a parse error, never a fallthrough to host evaluation.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use super::{Arg, CmpOp, Expr, RuleError};

lazy_static! {
    /// `name(args)` over the whole input.
    static ref FUNC_RE: Regex =
        Regex::new(r"(?s)^(\w+)\s*\(\s*(.*?)\s*\)$").expect("function regex");

    /// `left op right`. Function form is tried first so an `in` inside an
    /// argument list never matches here.
    static ref CMP_RE: Regex = Regex::new(
        r"(?si)^(.+?)\s*(==|!=|>=|<=|>|<|\bnot\s+in\b|\bin\b)\s*(.+)$"
    )
    .expect("comparison regex");

    /// Operator-first threshold form: `< 3000`, `>= 0.85`.
    static ref BARE_CMP_RE: Regex =
        Regex::new(r"^(==|!=|>=|<=|>|<)\s*(.+)$").expect("bare comparison regex");

    /// Aggregate prefix on a comparison's left side: `p95 duration_ms`.
    static ref AGG_RE: Regex =
        Regex::new(r"(?i)^(p\d+|mean|avg|max|min)\b\s*(.*)$").expect("aggregate regex");
}

pub(super) fn parse_expr(src: &str) -> Result<Expr, RuleError> {
    let src = src.trim();
    if src.is_empty() {
        return Err(RuleError::Parse("empty rule".to_string()));
    }

    if let Some(caps) = FUNC_RE.captures(src) {
        let name = caps[1].to_string();
        let args = tokenize_args(&caps[2])
            .into_iter()
            .map(|tok| parse_operand(&tok))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Expr::Call { name, args });
    }

    if let Some(caps) = BARE_CMP_RE.captures(src) {
        return Ok(Expr::Compare {
            aggregate: None,
            left: None,
            op: parse_op(&caps[1])?,
            right: parse_operand(caps[2].trim())?,
        });
    }

    if let Some(caps) = CMP_RE.captures(src) {
        let op = parse_op(&caps[2])?;
        let right = parse_operand(caps[3].trim())?;
        let (aggregate, left) = parse_left(caps[1].trim())?;
        return Ok(Expr::Compare {
            aggregate,
            left,
            op,
            right,
        });
    }

    Err(RuleError::Parse(format!("unrecognized rule: {src:?}")))
}

/// Split a comparison's left side into optional aggregate prefix and operand.
/// A bare aggregate (`p95 < 3000`) leaves the operand implicit.
fn parse_left(left: &str) -> Result<(Option<String>, Option<Arg>), RuleError> {
    if let Some(caps) = AGG_RE.captures(left) {
        let aggregate = Some(caps[1].to_lowercase());
        let rest = caps[2].trim();
        if rest.is_empty() {
            return Ok((aggregate, None));
        }
        return Ok((aggregate, Some(parse_operand(rest)?)));
    }
    Ok((None, Some(parse_operand(left)?)))
}

fn parse_op(token: &str) -> Result<CmpOp, RuleError> {
    let normalized = token.to_lowercase();
    let op = match normalized.as_str() {
        "<" => CmpOp::Lt,
        "<=" => CmpOp::Le,
        ">" => CmpOp::Gt,
        ">=" => CmpOp::Ge,
        "==" => CmpOp::Eq,
        "!=" => CmpOp::Ne,
        "in" => CmpOp::In,
        _ if normalized.starts_with("not") => CmpOp::NotIn,
        _ => return Err(RuleError::Parse(format!("unknown operator: {token:?}"))),
    };
    Ok(op)
}

/// Split a function's argument string at top-level commas, respecting quotes
/// and bracket nesting.
fn tokenize_args(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for ch in raw.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '[' | '(' => {
                    depth += 1;
                    current.push(ch);
                }
                ']' | ')' => {
                    depth = depth.saturating_sub(1);
                    current.push(ch);
                }
                ',' if depth == 0 => {
                    let tok = current.trim().to_string();
                    if !tok.is_empty() {
                        tokens.push(tok);
                    }
                    current.clear();
                }
                _ => current.push(ch),
            },
        }
    }
    let tok = current.trim().to_string();
    if !tok.is_empty() {
        tokens.push(tok);
    }
    tokens
}

/// Parse one operand token. Recognized literals become `Arg::Literal`;
/// everything else is a path reference.
fn parse_operand(token: &str) -> Result<Arg, RuleError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(RuleError::Parse("empty operand".to_string()));
    }

    let lower = token.to_lowercase();
    if lower == "none" || lower == "null" {
        return Ok(Arg::Literal(Value::Null));
    }
    if lower == "true" {
        return Ok(Arg::Literal(Value::Bool(true)));
    }
    if lower == "false" {
        return Ok(Arg::Literal(Value::Bool(false)));
    }

    if let Ok(n) = token.parse::<i64>() {
        return Ok(Arg::Literal(Value::from(n)));
    }
    if let Ok(f) = token.parse::<f64>() {
        if f.is_finite() {
            return Ok(Arg::Literal(Value::from(f)));
        }
    }

    if (token.starts_with('\'') && token.ends_with('\'') && token.len() >= 2)
        || (token.starts_with('"') && token.ends_with('"') && token.len() >= 2)
    {
        return Ok(Arg::Literal(Value::String(
            token[1..token.len() - 1].to_string(),
        )));
    }

    if token.starts_with('[') && token.ends_with(']') {
        let inner = &token[1..token.len() - 1];
        let items = tokenize_args(inner)
            .into_iter()
            .map(|tok| match parse_operand(&tok)? {
                Arg::Literal(v) => Ok(v),
                // Bare words inside a list literal are strings, not paths.
                Arg::Path(p) => Ok(Value::String(p)),
            })
            .collect::<Result<Vec<_>, RuleError>>()?;
        return Ok(Arg::Literal(Value::Array(items)));
    }

    Ok(Arg::Path(token.to_string()))
}
