//! Ahead-of-time compilation of script source into label blocks.
//!
//! A line of the form `name:` at column 0 starts a new label. Code before
//! the first label belongs to the default label [`DEFAULT_LABEL`]. Labels
//! keep source order, and execution falls through from one label's block
//! into the next.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use thiserror::Error;

use super::runtime::Flag;
use crate::constants::{DEFAULT_LABEL, LABEL_ERROR};

static LABEL_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9_][A-Za-z0-9_.\-]*):\s*$").expect("valid regex"));

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

/// Compilation failure with its 1-based source line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct CompileError {
    /// 1-based source line.
    pub line: usize,
    /// What went wrong.
    pub message: String,
}

impl CompileError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// A compiled `/regex/flags` literal.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

impl Pattern {
    /// Parse `/body/` or `/body/i`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        let body = text
            .strip_prefix('/')
            .ok_or_else(|| format!("expected /pattern/, got '{text}'"))?;
        let end = body
            .rfind('/')
            .ok_or_else(|| format!("unterminated pattern '{text}'"))?;
        let flags = &body[end + 1..];
        if flags.chars().any(|c| c != 'i') {
            return Err(format!("unknown pattern flags '{flags}'"));
        }
        let regex = RegexBuilder::new(&body[..end])
            .case_insensitive(flags.contains('i'))
            .build()
            .map_err(|e| format!("invalid pattern '{text}': {e}"))?;
        Ok(Self {
            source: text.to_string(),
            regex,
        })
    }

    /// The literal as written.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Compiled regex.
    #[must_use]
    pub fn regex(&self) -> &Regex {
        &self.regex
    }
}

/// Pattern operand of `match`/`matchre`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchPattern {
    /// Case-insensitive substring (interpolated when pushed).
    Text(String),
    /// Regular expression.
    Regex(Pattern),
}

/// One statement.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Put(String),
    Echo(String),
    Goto(String),
    Gosub { label: String, args: String },
    Return,
    Exit,
    Pause(Option<String>),
    Wait,
    WaitFor(String),
    WaitForRe(Pattern),
    WaitRt,
    Move(String),
    NextRoom,
    Match { label: String, pattern: MatchPattern },
    MatchWait(Option<String>),
    Set { name: String, expr: String },
    Unset(String),
    Shift,
    If { cond: String, then: Box<Stmt> },
    Watch { label: String, pattern: Pattern },
    Unwatch(String),
    DieWith(String),
    Cleanup(Box<Stmt>),
    Start(String),
    Kill(String),
    Inject(String),
    Unique(String),
    UWaitFor(String),
    Flag { flag: Flag, on: bool },
}

/// A statement with its source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// 1-based source line.
    pub number: usize,
    /// The statement.
    pub stmt: Stmt,
}

/// A named block of statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    /// Label name as written.
    pub name: String,
    /// Statements in order.
    pub block: Vec<Line>,
}

/// How a jump target resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Exact or case-insensitive match.
    Found(usize),
    /// Not found; the fallback error label is used.
    Fallback(usize),
    /// Not found and no fallback.
    Missing,
}

/// A compiled script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    labels: Vec<Label>,
    index: HashMap<String, usize>,
}

impl Program {
    /// Labels in source order.
    #[must_use]
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Label names in source order.
    #[must_use]
    pub fn label_names(&self) -> Vec<&str> {
        self.labels.iter().map(|l| l.name.as_str()).collect()
    }

    /// Statements of label `idx`.
    #[must_use]
    pub fn block(&self, idx: usize) -> &[Line] {
        self.labels.get(idx).map(|l| l.block.as_slice()).unwrap_or_default()
    }

    /// Index of the label following `idx`, for fall-through.
    #[must_use]
    pub fn next_label(&self, idx: usize) -> Option<usize> {
        (idx + 1 < self.labels.len()).then_some(idx + 1)
    }

    /// Resolve a jump target: exact, then case-insensitive, then the
    /// fallback error label.
    #[must_use]
    pub fn resolve(&self, target: &str) -> Resolution {
        if let Some(&idx) = self.index.get(target) {
            return Resolution::Found(idx);
        }
        if let Some(idx) = self
            .labels
            .iter()
            .position(|l| l.name.eq_ignore_ascii_case(target))
        {
            return Resolution::Found(idx);
        }
        match self.index.get(LABEL_ERROR) {
            Some(&idx) => Resolution::Fallback(idx),
            None => Resolution::Missing,
        }
    }
}

/// Compile native script source.
pub fn compile(source: &str) -> Result<Program, CompileError> {
    let mut labels = vec![Label {
        name: DEFAULT_LABEL.to_string(),
        block: Vec::new(),
    }];
    let mut index = HashMap::from([(DEFAULT_LABEL.to_string(), 0)]);

    for (i, raw) in source.lines().enumerate() {
        let number = i + 1;
        if let Some(caps) = LABEL_LINE.captures(raw) {
            let name = caps[1].to_string();
            if index.contains_key(&name) {
                return Err(CompileError::new(number, format!("duplicate label '{name}'")));
            }
            index.insert(name.clone(), labels.len());
            labels.push(Label {
                name,
                block: Vec::new(),
            });
            continue;
        }

        let text = raw.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let stmt = parse_stmt(text, number)?;
        if let Some(label) = labels.last_mut() {
            label.block.push(Line { number, stmt });
        }
    }

    Ok(Program { labels, index })
}

/// Split off the first whitespace-delimited word.
fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim();
    match text.find(char::is_whitespace) {
        Some(pos) => (&text[..pos], text[pos..].trim_start()),
        None => (text, ""),
    }
}

fn require<'a>(rest: &'a str, cmd: &str, line: usize) -> Result<&'a str, CompileError> {
    if rest.is_empty() {
        Err(CompileError::new(line, format!("'{cmd}' needs an argument")))
    } else {
        Ok(rest)
    }
}

fn optional(rest: &str) -> Option<String> {
    (!rest.is_empty()).then(|| rest.to_string())
}

fn pattern(text: &str, line: usize) -> Result<Pattern, CompileError> {
    Pattern::parse(text).map_err(|e| CompileError::new(line, e))
}

/// Find ` then ` (any case) outside of double quotes.
fn find_then(text: &str) -> Option<usize> {
    let lower = text.to_ascii_lowercase();
    let mut in_quote = false;
    for (i, c) in lower.char_indices() {
        if c == '"' {
            in_quote = !in_quote;
        } else if !in_quote && lower[i..].starts_with(" then ") {
            return Some(i);
        }
    }
    None
}

/// Parse one statement.
pub(crate) fn parse_stmt(text: &str, line: usize) -> Result<Stmt, CompileError> {
    let (cmd, rest) = split_word(text);
    let cmd_lower = cmd.to_ascii_lowercase();
    let stmt = match cmd_lower.as_str() {
        "put" => Stmt::Put(require(rest, cmd, line)?.to_string()),
        "echo" => Stmt::Echo(rest.to_string()),
        "goto" => Stmt::Goto(require(rest, cmd, line)?.to_string()),
        "gosub" => {
            let (label, args) = split_word(require(rest, cmd, line)?);
            Stmt::Gosub {
                label: label.to_string(),
                args: args.to_string(),
            }
        }
        "return" => Stmt::Return,
        "exit" => Stmt::Exit,
        "pause" => Stmt::Pause(optional(rest)),
        "wait" => Stmt::Wait,
        "waitfor" => Stmt::WaitFor(require(rest, cmd, line)?.to_string()),
        "waitforre" => Stmt::WaitForRe(pattern(require(rest, cmd, line)?, line)?),
        "waitrt" => Stmt::WaitRt,
        "move" => Stmt::Move(require(rest, cmd, line)?.to_string()),
        "nextroom" => Stmt::NextRoom,
        "match" | "matchre" => {
            let (label, body) = split_word(require(rest, cmd, line)?);
            let body = require(body, cmd, line)?;
            let pattern = if cmd_lower == "match" {
                MatchPattern::Text(body.to_string())
            } else {
                MatchPattern::Regex(pattern(body, line)?)
            };
            Stmt::Match {
                label: label.to_string(),
                pattern,
            }
        }
        "matchwait" => Stmt::MatchWait(optional(rest)),
        "set" => {
            let (name, expr) = split_word(require(rest, cmd, line)?);
            let (name, expr) = match name.split_once('=') {
                // `set x=1`
                Some((n, e)) => (n, format!("{e} {expr}").trim().to_string()),
                None => (name, expr.strip_prefix('=').unwrap_or(expr).trim().to_string()),
            };
            if !IDENTIFIER.is_match(name) {
                return Err(CompileError::new(line, format!("invalid variable name '{name}'")));
            }
            Stmt::Set {
                name: name.to_string(),
                expr,
            }
        }
        "unset" => Stmt::Unset(require(rest, cmd, line)?.to_string()),
        "shift" => Stmt::Shift,
        "if" => {
            let body = require(rest, cmd, line)?;
            let pos = find_then(body)
                .ok_or_else(|| CompileError::new(line, "'if' without 'then'"))?;
            let cond = body[..pos].trim();
            let then = body[pos + " then ".len()..].trim();
            if cond.is_empty() || then.is_empty() {
                return Err(CompileError::new(line, "malformed 'if'"));
            }
            Stmt::If {
                cond: cond.to_string(),
                then: Box::new(parse_stmt(then, line)?),
            }
        }
        "watch" => {
            let (label, body) = split_word(require(rest, cmd, line)?);
            Stmt::Watch {
                label: label.to_string(),
                pattern: pattern(require(body, cmd, line)?, line)?,
            }
        }
        "unwatch" => Stmt::Unwatch(require(rest, cmd, line)?.trim().to_string()),
        "diewith" => Stmt::DieWith(require(rest, cmd, line)?.to_string()),
        "cleanup" => Stmt::Cleanup(Box::new(parse_stmt(require(rest, cmd, line)?, line)?)),
        "start" => Stmt::Start(require(rest, cmd, line)?.to_string()),
        "kill" => Stmt::Kill(require(rest, cmd, line)?.to_string()),
        "inject" => Stmt::Inject(require(rest, cmd, line)?.to_string()),
        "unique" => Stmt::Unique(require(rest, cmd, line)?.to_string()),
        "uwaitfor" => Stmt::UWaitFor(require(rest, cmd, line)?.to_string()),
        "flag" => {
            let (name, state) = split_word(require(rest, cmd, line)?);
            let flag = Flag::from_name(name)
                .ok_or_else(|| CompileError::new(line, format!("unknown flag '{name}'")))?;
            let on = match state.to_ascii_lowercase().as_str() {
                "on" => true,
                "off" => false,
                _ => return Err(CompileError::new(line, "flag state must be on or off")),
            };
            Stmt::Flag { flag, on }
        }
        _ => return Err(CompileError::new(line, format!("unknown command '{cmd}'"))),
    };
    Ok(stmt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_in_order_with_default() {
        let program =
            compile("start:\n put hello\n goto finish\nunused:\n echo never\nfinish:\n echo done\n")
                .unwrap();
        assert_eq!(program.label_names(), vec!["~start", "start", "unused", "finish"]);
        assert!(program.block(0).is_empty());
        assert_eq!(program.block(1).len(), 2);
        assert_eq!(program.block(3)[0].stmt, Stmt::Echo("done".into()));
    }

    #[test]
    fn test_code_before_first_label_goes_to_default() {
        let program = compile("echo one\n# comment\n\nloop:\n echo two\n").unwrap();
        assert_eq!(program.block(0), &[Line { number: 1, stmt: Stmt::Echo("one".into()) }]);
        assert_eq!(program.block(1)[0].number, 5);
    }

    #[test]
    fn test_indented_label_is_not_a_label() {
        let err = compile("  loop:\n").unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_resolve_order() {
        let program = compile("Hunt:\n echo a\nLabelError:\n echo b\n").unwrap();
        assert_eq!(program.resolve("Hunt"), Resolution::Found(1));
        assert_eq!(program.resolve("hunt"), Resolution::Found(1));
        assert_eq!(program.resolve("nowhere"), Resolution::Fallback(2));

        let program = compile("hunt:\n echo a\n").unwrap();
        assert_eq!(program.resolve("nowhere"), Resolution::Missing);
    }

    #[test]
    fn test_duplicate_label_is_error() {
        let err = compile("a:\na:\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn test_statement_forms() {
        assert_eq!(
            parse_stmt("set c = $c + 1", 1).unwrap(),
            Stmt::Set { name: "c".into(), expr: "$c + 1".into() }
        );
        assert_eq!(
            parse_stmt("set x=5", 1).unwrap(),
            Stmt::Set { name: "x".into(), expr: "5".into() }
        );
        assert_eq!(
            parse_stmt("if $argc >= 2 then goto two", 1).unwrap(),
            Stmt::If { cond: "$argc >= 2".into(), then: Box::new(Stmt::Goto("two".into())) }
        );
        assert!(matches!(
            parse_stmt("matchre done /you (find|see)/i", 1).unwrap(),
            Stmt::Match { pattern: MatchPattern::Regex(_), .. }
        ));
        assert_eq!(
            parse_stmt("flag structured on", 1).unwrap(),
            Stmt::Flag { flag: Flag::Structured, on: true }
        );
        assert!(matches!(parse_stmt("cleanup put stand", 1).unwrap(), Stmt::Cleanup(_)));
    }

    #[test]
    fn test_statement_errors() {
        assert!(parse_stmt("jump north", 4).unwrap_err().message.contains("unknown command"));
        assert!(parse_stmt("put", 1).is_err());
        assert!(parse_stmt("waitforre no slashes", 1).is_err());
        assert!(parse_stmt("waitforre /(unclosed/", 1).is_err());
        assert!(parse_stmt("if $x == 1 goto a", 1).is_err());
        assert!(parse_stmt("set 9lives 1", 1).is_err());
        assert!(parse_stmt("flag bogus on", 1).is_err());
    }

    #[test]
    fn test_pattern_case_flag() {
        let p = Pattern::parse("/kobold/i").unwrap();
        assert!(p.regex().is_match("A KOBOLD arrives"));
        assert_eq!(p.source(), "/kobold/i");
        assert!(Pattern::parse("/x/g").is_err());
    }
}
