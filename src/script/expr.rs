//! Variable interpolation, conditions and `set` arithmetic.
//!
//! Interpolation runs first; conditions and arithmetic operate on the
//! resulting text.

use std::collections::HashMap;

use crate::state::GameState;

use super::ScriptError;

/// Everything `$name` can resolve against.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    /// Positional arguments (`$1` is the first).
    pub args: &'a [String],
    /// Script-local variables.
    pub vars: &'a HashMap<String, String>,
    /// Read-only game values, if available.
    pub state: Option<&'a GameState>,
}

impl Scope<'_> {
    fn lookup(&self, name: &str) -> String {
        if name == "argc" {
            return self.args.len().to_string();
        }
        if let Some(value) = self.vars.get(name) {
            return value.clone();
        }
        self.state
            .and_then(|s| s.variable(name))
            .unwrap_or_default()
    }

    fn positional(&self, index: usize) -> String {
        if index == 0 {
            self.args.join(" ")
        } else {
            self.args.get(index - 1).cloned().unwrap_or_default()
        }
    }
}

/// Expand `$name`, `${name}`, `$N`, `$argc` and `$$` in `template`.
///
/// Unknown names expand to the empty string.
pub fn interpolate(template: &str, scope: &Scope<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((start, '{')) => {
                chars.next();
                let rest = &template[start + 1..];
                match rest.find('}') {
                    Some(end) => {
                        out.push_str(&scope.lookup(rest[..end].trim()));
                        // Skip the name and the closing brace.
                        for _ in rest[..=end].chars() {
                            chars.next();
                        }
                    }
                    None => out.push_str("${"),
                }
            }
            Some((start, d)) if d.is_ascii_digit() => {
                let len = template[start..]
                    .find(|ch: char| !ch.is_ascii_digit())
                    .unwrap_or(template.len() - start);
                let index = template[start..start + len].parse().unwrap_or(usize::MAX);
                out.push_str(&scope.positional(index));
                for _ in 0..len {
                    chars.next();
                }
            }
            Some((start, a)) if a.is_ascii_alphabetic() || a == '_' => {
                let len = template[start..]
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                    .unwrap_or(template.len() - start);
                out.push_str(&scope.lookup(&template[start..start + len]));
                for _ in 0..len {
                    chars.next();
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Strip one pair of surrounding double quotes.
#[must_use]
pub fn unquote(text: &str) -> &str {
    let text = text.trim();
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text)
}

const COMPARISONS: &[&str] = &["==", "!=", "<=", ">=", "<", ">"];

/// Evaluate an interpolated condition.
///
/// Supports `||`, `&&`, a leading `!`, the comparisons `== != < > <= >=`
/// (numeric when both sides are numbers) and case-insensitive `contains`.
/// A bare value is true unless it is empty, `0` or `false`.
#[must_use]
pub fn truthy(cond: &str) -> bool {
    if cond.contains("||") {
        return cond.split("||").any(truthy);
    }
    if cond.contains("&&") {
        return cond.split("&&").all(truthy);
    }

    let cond = cond.trim();
    if let Some(inner) = cond.strip_prefix('!') {
        if !inner.starts_with('=') {
            return !truthy(inner);
        }
    }

    let lower = cond.to_ascii_lowercase();
    if let Some(pos) = lower.find(" contains ") {
        let haystack = unquote(&cond[..pos]).to_lowercase();
        let needle = unquote(&cond[pos + " contains ".len()..]).to_lowercase();
        return haystack.contains(&needle);
    }

    if let Some((pos, op)) = find_comparison(cond) {
        let left = unquote(&cond[..pos]);
        let right = unquote(&cond[pos + op.len()..]);
        return compare(left, op, right);
    }

    !matches!(unquote(cond).to_ascii_lowercase().as_str(), "" | "0" | "false")
}

fn find_comparison(cond: &str) -> Option<(usize, &'static str)> {
    let mut in_quote = false;
    for (i, c) in cond.char_indices() {
        if c == '"' {
            in_quote = !in_quote;
            continue;
        }
        if in_quote {
            continue;
        }
        if let Some(op) = COMPARISONS.iter().find(|op| cond[i..].starts_with(**op)) {
            return Some((i, op));
        }
    }
    None
}

fn compare(left: &str, op: &str, right: &str) -> bool {
    if let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) {
        return match op {
            "==" => (l - r).abs() < f64::EPSILON,
            "!=" => (l - r).abs() >= f64::EPSILON,
            "<" => l < r,
            ">" => l > r,
            "<=" => l <= r,
            _ => l >= r,
        };
    }
    match op {
        "==" => left == right,
        "!=" => left != right,
        "<" => left < right,
        ">" => left > right,
        "<=" => left <= right,
        _ => left >= right,
    }
}

/// Evaluate the right-hand side of `set`.
///
/// Integer arithmetic (`+ - * / %`, parentheses, unary minus) when the text
/// is a well-formed expression; otherwise the text itself, unquoted.
pub fn evaluate(text: &str) -> Result<String, ScriptError> {
    let Some(tokens) = lex(text) else {
        return Ok(unquote(text).to_string());
    };
    let mut parser = Arith { tokens: &tokens, pos: 0 };
    match parser.expr() {
        Ok(value) if parser.pos == tokens.len() => Ok(value.to_string()),
        Err(ArithError::DivideByZero) => {
            Err(ScriptError::Runtime(format!("division by zero in '{}'", text.trim())))
        }
        _ => Ok(unquote(text).to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tok {
    Num(i64),
    Op(char),
    Open,
    Close,
}

fn lex(text: &str) -> Option<Vec<Tok>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '0'..='9' => {
                let mut n: i64 = 0;
                while let Some(&d) = chars.peek() {
                    let Some(digit) = d.to_digit(10) else { break };
                    n = n.checked_mul(10)?.checked_add(i64::from(digit))?;
                    chars.next();
                }
                tokens.push(Tok::Num(n));
            }
            '+' | '-' | '*' | '/' | '%' => {
                chars.next();
                tokens.push(Tok::Op(c));
            }
            '(' => {
                chars.next();
                tokens.push(Tok::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Tok::Close);
            }
            _ => return None,
        }
    }
    (!tokens.is_empty()).then_some(tokens)
}

#[derive(Debug)]
enum ArithError {
    Malformed,
    DivideByZero,
}

struct Arith<'a> {
    tokens: &'a [Tok],
    pos: usize,
}

impl Arith<'_> {
    fn peek(&self) -> Option<Tok> {
        self.tokens.get(self.pos).copied()
    }

    fn expr(&mut self) -> Result<i64, ArithError> {
        let mut value = self.term()?;
        while let Some(Tok::Op(op @ ('+' | '-'))) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' {
                value.wrapping_add(rhs)
            } else {
                value.wrapping_sub(rhs)
            };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<i64, ArithError> {
        let mut value = self.unary()?;
        while let Some(Tok::Op(op @ ('*' | '/' | '%'))) = self.peek() {
            self.pos += 1;
            let rhs = self.unary()?;
            value = match op {
                '*' => value.wrapping_mul(rhs),
                _ if rhs == 0 => return Err(ArithError::DivideByZero),
                '/' => value.wrapping_div(rhs),
                _ => value.wrapping_rem(rhs),
            };
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<i64, ArithError> {
        if let Some(Tok::Op('-')) = self.peek() {
            self.pos += 1;
            return Ok(self.unary()?.wrapping_neg());
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<i64, ArithError> {
        match self.peek() {
            Some(Tok::Num(n)) => {
                self.pos += 1;
                Ok(n)
            }
            Some(Tok::Open) => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek() != Some(Tok::Close) {
                    return Err(ArithError::Malformed);
                }
                self.pos += 1;
                Ok(value)
            }
            _ => Err(ArithError::Malformed),
        }
    }
}
