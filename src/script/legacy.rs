//! Line-by-line transpiler for legacy macro scripts (`.cmd`, `.wiz`).
//!
//! The output is native script source. Statements with no native
//! equivalent are commented out and listed in the report so the user can
//! see what was dropped.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

static LABEL_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*:\s*$").expect("valid regex"));
static NAMED_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%([A-Za-z_][A-Za-z0-9_]*)%").expect("valid regex"));
// The short forms take an optional closing `%` (`%1%`, `%s%`, `%c%`).
static POSITIONAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"%([0-9])%?").expect("valid regex"));
static SAVE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%s(?:%|\b)").expect("valid regex"));
static COUNTER_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%c(?:%|\b)").expect("valid regex"));
static IF_ARGC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^if_([0-9])\s+(.+)$").expect("valid regex"));

const PASS_THROUGH: &[&str] = &[
    "put", "echo", "goto", "pause", "waitfor", "waitforre", "match", "matchre", "matchwait",
    "move", "nextroom", "shift", "exit", "waitrt", "gosub", "return",
];

/// Result of transpiling one legacy script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transpiled {
    /// Native script source.
    pub source: String,
    /// `(line, original text)` for every statement that was commented out.
    pub report: Vec<(usize, String)>,
}

/// Rewrite legacy variable references into native interpolation.
///
/// Short forms go first so `%s%` is not taken for a variable named `s`.
fn rewrite_vars(text: &str) -> String {
    let text = POSITIONAL.replace_all(text, "$$$1");
    let text = SAVE_VAR.replace_all(&text, "$$save");
    let text = COUNTER_VAR.replace_all(&text, "$$c");
    NAMED_VAR.replace_all(&text, "$${$1}").into_owned()
}

/// Wrap a bare legacy pattern as a case-insensitive regex literal.
fn as_pattern(text: &str) -> Cow<'_, str> {
    if text.starts_with('/') {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(format!("/{text}/i"))
    }
}

/// Translate one statement. `None` means no native equivalent.
fn statement(text: &str) -> Option<String> {
    if let Some(caps) = IF_ARGC.captures(text) {
        let inner = statement(&caps[2])?;
        return Some(format!("if $argc >= {} then {}", &caps[1], inner));
    }

    let (cmd, rest) = match text.split_once(char::is_whitespace) {
        Some((c, r)) => (c, r.trim()),
        None => (text, ""),
    };
    let lower = cmd.to_ascii_lowercase();
    let rest = rewrite_vars(rest);

    let native = match lower.as_str() {
        "save" => format!("set save \"{rest}\""),
        "counter" => {
            let (op, n) = rest.split_once(char::is_whitespace)?;
            let n = n.trim();
            match op.to_ascii_lowercase().as_str() {
                "set" => format!("set c = {n}"),
                "add" => format!("set c = $c + {n}"),
                "subtract" => format!("set c = $c - {n}"),
                "multiply" => format!("set c = $c * {n}"),
                "divide" => format!("set c = $c / {n}"),
                _ => return None,
            }
        }
        "setvariable" => {
            let (name, value) = rest.split_once(char::is_whitespace)?;
            format!("set {} \"{}\"", name, value.trim())
        }
        "deletevariable" if !rest.is_empty() => format!("unset {rest}"),
        "waitforre" => format!("waitforre {}", as_pattern(&rest)),
        "matchre" => {
            let (label, pattern) = rest.split_once(char::is_whitespace)?;
            format!("matchre {} {}", label, as_pattern(pattern.trim()))
        }
        _ if PASS_THROUGH.contains(&lower.as_str()) => {
            if rest.is_empty() {
                lower
            } else {
                format!("{lower} {rest}")
            }
        }
        _ => return None,
    };
    Some(native)
}

/// Transpile a legacy macro script into native source.
pub fn transpile(source: &str) -> Transpiled {
    let mut out = Transpiled::default();

    for (i, raw) in source.lines().enumerate() {
        if LABEL_LINE.is_match(raw) {
            out.source.push_str(raw);
            out.source.push('\n');
            continue;
        }
        let text = raw.trim();
        if text.is_empty() || text.starts_with('#') {
            out.source.push_str(raw);
            out.source.push('\n');
            continue;
        }
        match statement(text) {
            Some(native) => {
                out.source.push_str("  ");
                out.source.push_str(&native);
            }
            None => {
                out.report.push((i + 1, text.to_string()));
                out.source.push_str("# [legacy] ");
                out.source.push_str(text);
            }
        }
        out.source.push('\n');
    }

    if !out.report.is_empty() {
        log::warn!(
            "[Legacy] {} statement(s) have no native equivalent and were commented out",
            out.report.len()
        );
    }
    out
}
