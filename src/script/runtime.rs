//! Per-script state: mailboxes, flags, variables, triggers and lifecycle
//! bookkeeping.
//!
//! A [`Script`] is shared between its worker threads, the distribution step
//! (which pushes lines into its mailboxes) and the scheduler (which kills
//! it). Everything mutable sits behind its own lock or atomic so none of
//! those parties contend on a single script-wide lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::constants::MAX_VARIABLES;
use crate::lock;
use crate::mailbox::Mailbox;

use super::compile::{Program, Stmt};
use super::ScriptError;

/// Per-script boolean switches, set with `flag NAME on|off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Receive plain downstream lines (on by default).
    Downstream,
    /// Receive raw markup lines instead of plain text.
    Structured,
    /// Receive a copy of every command sent upstream.
    Upstream,
    /// Suppress start/exit messages.
    Quiet,
    /// Do not echo this script's commands to clients.
    Silent,
    /// Omit from `list` unless asked.
    Hidden,
}

impl Flag {
    /// Parse a flag name (case-insensitive).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "downstream" => Some(Self::Downstream),
            "structured" => Some(Self::Structured),
            "upstream" => Some(Self::Upstream),
            "quiet" => Some(Self::Quiet),
            "silent" => Some(Self::Silent),
            "hidden" => Some(Self::Hidden),
            _ => None,
        }
    }

    /// Canonical name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Downstream => "downstream",
            Self::Structured => "structured",
            Self::Upstream => "upstream",
            Self::Quiet => "quiet",
            Self::Silent => "silent",
            Self::Hidden => "hidden",
        }
    }
}

/// A `watch` trigger.
#[derive(Debug, Clone)]
pub(crate) struct Watch {
    pub source: String,
    pub regex: Regex,
    pub label: String,
}

/// Pattern of a pending `match`/`matchre`.
///
/// Plain text is kept as an escaped case-insensitive regex so both kinds
/// report offsets into the same, unmodified line.
#[derive(Debug, Clone)]
pub(crate) enum Matcher {
    Text(Regex),
    Regex(Regex),
}

impl Matcher {
    pub(crate) fn text(needle: &str) -> Result<Self, regex::Error> {
        Regex::new(&format!("(?i){}", regex::escape(needle))).map(Self::Text)
    }
}

/// One entry of the match stack.
#[derive(Debug, Clone)]
pub(crate) struct MatchEntry {
    pub label: String,
    pub matcher: Matcher,
}

/// A successful match: start offset and capture groups (group 0 first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hit {
    pub start: usize,
    pub groups: Vec<String>,
}

impl MatchEntry {
    pub(crate) fn find(&self, line: &str) -> Option<Hit> {
        let (Matcher::Text(re) | Matcher::Regex(re)) = &self.matcher;
        re.captures(line).map(|caps| Hit {
            start: caps.get(0).map_or(0, |m| m.start()),
            groups: caps
                .iter()
                .map(|m| m.map_or_else(String::new, |m| m.as_str().to_string()))
                .collect(),
        })
    }
}

/// Pick the entry whose match starts leftmost in `line`; ties go to the
/// entry pushed first.
pub(crate) fn best_match<'a>(entries: &'a [MatchEntry], line: &str) -> Option<(&'a MatchEntry, Hit)> {
    entries
        .iter()
        .filter_map(|entry| entry.find(line).map(|hit| (entry, hit)))
        .min_by_key(|(_, hit)| hit.start)
}

/// Work run when the script is killed.
pub(crate) enum CleanupAction {
    /// A `cleanup` statement.
    Statement(Stmt),
    /// Registered from Rust.
    Native(Box<dyn FnOnce() -> anyhow::Result<()> + Send>),
}

impl std::fmt::Debug for CleanupAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Statement(stmt) => f.debug_tuple("Statement").field(stmt).finish(),
            Self::Native(_) => f.write_str("Native(..)"),
        }
    }
}

/// Summary row for `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptInfo {
    /// Script name.
    pub name: String,
    /// Registry id.
    pub id: u64,
    /// Whether paused.
    pub paused: bool,
    /// Whether hidden from the default listing.
    pub hidden: bool,
    /// Whether trusted for restricted operations.
    pub trusted: bool,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Current positional arguments.
    pub args: Vec<String>,
}

/// A running script.
pub struct Script {
    name: String,
    id: u64,
    trusted: bool,
    program: Arc<Program>,
    started_at: DateTime<Utc>,

    args: Mutex<Vec<String>>,
    vars: Mutex<HashMap<String, String>>,

    downstream_flag: AtomicBool,
    structured_flag: AtomicBool,
    upstream_flag: AtomicBool,
    quiet_flag: AtomicBool,
    silent_flag: AtomicBool,
    hidden_flag: AtomicBool,

    downstream: Mailbox<String>,
    upstream: Mailbox<String>,
    unique: Mailbox<String>,

    pub(super) killed: AtomicBool,
    /// Thread running the kill protocol, once one has started it.
    pub(super) killer: Mutex<Option<ThreadId>>,
    paused: AtomicBool,

    /// Worker threads; also serializes kill against spawning.
    pub(super) threads: Mutex<Vec<JoinHandle<()>>>,
    pub(super) die_with: Mutex<Vec<String>>,
    pub(super) cleanup: Mutex<Vec<CleanupAction>>,
    pub(crate) watches: Mutex<Vec<Watch>>,
    pub(crate) match_stack: Mutex<Vec<MatchEntry>>,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("killed", &self.is_killed())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl Script {
    pub(crate) fn new(
        id: u64,
        name: &str,
        program: Arc<Program>,
        args: Vec<String>,
        trusted: bool,
        mailbox_capacity: usize,
    ) -> Self {
        let capacity = mailbox_capacity.max(1);
        Self {
            name: name.to_string(),
            id,
            trusted,
            program,
            started_at: Utc::now(),
            args: Mutex::new(args),
            vars: Mutex::new(HashMap::new()),
            downstream_flag: AtomicBool::new(true),
            structured_flag: AtomicBool::new(false),
            upstream_flag: AtomicBool::new(false),
            quiet_flag: AtomicBool::new(false),
            silent_flag: AtomicBool::new(false),
            hidden_flag: AtomicBool::new(false),
            downstream: Mailbox::new(capacity),
            upstream: Mailbox::new(capacity),
            unique: Mailbox::new(capacity),
            killed: AtomicBool::new(false),
            killer: Mutex::new(None),
            paused: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            die_with: Mutex::new(Vec::new()),
            cleanup: Mutex::new(Vec::new()),
            watches: Mutex::new(Vec::new()),
            match_stack: Mutex::new(Vec::new()),
        }
    }

    /// Name the script was started under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry id, unique for the lifetime of the runtime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether restricted operations are allowed.
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Compiled program.
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Start time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether the script has been killed.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Whether the script is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    fn flag_cell(&self, flag: Flag) -> &AtomicBool {
        match flag {
            Flag::Downstream => &self.downstream_flag,
            Flag::Structured => &self.structured_flag,
            Flag::Upstream => &self.upstream_flag,
            Flag::Quiet => &self.quiet_flag,
            Flag::Silent => &self.silent_flag,
            Flag::Hidden => &self.hidden_flag,
        }
    }

    /// Current value of a flag.
    pub fn flag(&self, flag: Flag) -> bool {
        self.flag_cell(flag).load(Ordering::SeqCst)
    }

    /// Set a flag.
    pub fn set_flag(&self, flag: Flag, on: bool) {
        self.flag_cell(flag).store(on, Ordering::SeqCst);
    }

    /// Copy of the positional arguments.
    pub fn args(&self) -> Vec<String> {
        lock(&self.args).clone()
    }

    pub(crate) fn replace_args(&self, args: Vec<String>) -> Vec<String> {
        std::mem::replace(&mut *lock(&self.args), args)
    }

    pub(crate) fn shift_args(&self) -> Option<String> {
        let mut args = lock(&self.args);
        (!args.is_empty()).then(|| args.remove(0))
    }

    /// Value of a local variable.
    pub fn var(&self, name: &str) -> Option<String> {
        lock(&self.vars).get(name).cloned()
    }

    /// Set a local variable.
    pub fn set_var(&self, name: &str, value: String) -> Result<(), ScriptError> {
        let mut vars = lock(&self.vars);
        if vars.len() >= MAX_VARIABLES && !vars.contains_key(name) {
            return Err(ScriptError::ResourceExhausted(format!(
                "more than {MAX_VARIABLES} variables"
            )));
        }
        vars.insert(name.to_string(), value);
        Ok(())
    }

    pub(crate) fn unset_var(&self, name: &str) {
        lock(&self.vars).remove(name);
    }

    /// Run `f` with the arguments and variables locked.
    pub(crate) fn with_scope<R>(&self, f: impl FnOnce(&[String], &HashMap<String, String>) -> R) -> R {
        let args = lock(&self.args);
        let vars = lock(&self.vars);
        f(&args, &vars)
    }

    pub(crate) fn downstream(&self) -> &Mailbox<String> {
        &self.downstream
    }

    pub(crate) fn unique(&self) -> &Mailbox<String> {
        &self.unique
    }

    /// Deliver a downstream line.
    pub fn push_downstream(&self, line: &str) {
        if !self.is_killed() {
            self.downstream.push(line.to_string());
        }
    }

    /// Deliver an upstream echo line.
    pub fn push_upstream(&self, line: &str) {
        if !self.is_killed() {
            self.upstream.push(line.to_string());
        }
    }

    /// Deliver an out-of-band line.
    pub fn push_unique(&self, line: &str) {
        if !self.is_killed() {
            self.unique.push(line.to_string());
        }
    }

    /// Next upstream echo line, waiting up to `timeout`.
    pub fn read_upstream(&self, timeout: Duration) -> Option<String> {
        self.upstream.pop_timeout(timeout)
    }

    /// Register a dependent script to kill along with this one.
    pub fn die_with(&self, name: &str) {
        let mut list = lock(&self.die_with);
        if !list.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            list.push(name.to_string());
        }
    }

    /// Register native work to run when the script is killed.
    pub fn on_cleanup<F>(&self, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        lock(&self.cleanup).push(CleanupAction::Native(Box::new(action)));
    }

    pub(crate) fn add_cleanup_stmt(&self, stmt: Stmt) {
        lock(&self.cleanup).push(CleanupAction::Statement(stmt));
    }

    /// Drop buffered input and pending triggers.
    pub(crate) fn release(&self) {
        self.downstream.clear();
        self.upstream.clear();
        self.unique.clear();
        lock(&self.watches).clear();
        lock(&self.match_stack).clear();
    }

    /// Listing row.
    pub fn info(&self) -> ScriptInfo {
        ScriptInfo {
            name: self.name.clone(),
            id: self.id,
            paused: self.is_paused(),
            hidden: self.flag(Flag::Hidden),
            trusted: self.trusted,
            started_at: self.started_at,
            args: self.args(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::compile;

    fn script() -> Script {
        let program = Arc::new(compile("echo hi\n").unwrap());
        Script::new(1, "hunt", program, vec!["a".into(), "b".into()], false, 4)
    }

    #[test]
    fn test_flags_default_and_toggle() {
        let s = script();
        assert!(s.flag(Flag::Downstream));
        assert!(!s.flag(Flag::Structured));
        s.set_flag(Flag::Hidden, true);
        assert!(s.info().hidden);
        assert_eq!(Flag::from_name("UPSTREAM"), Some(Flag::Upstream));
        assert_eq!(Flag::Quiet.name(), "quiet");
    }

    #[test]
    fn test_args_shift_and_replace() {
        let s = script();
        assert_eq!(s.shift_args().as_deref(), Some("a"));
        let old = s.replace_args(vec!["x".into()]);
        assert_eq!(old, vec!["b".to_string()]);
        assert_eq!(s.args(), vec!["x".to_string()]);
    }

    #[test]
    fn test_variable_limit() {
        let s = script();
        for i in 0..MAX_VARIABLES {
            s.set_var(&format!("v{i}"), String::new()).unwrap();
        }
        assert!(s.set_var("v0", "overwrite ok".into()).is_ok());
        assert!(matches!(
            s.set_var("one_more", String::new()),
            Err(ScriptError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_killed_script_ignores_input() {
        let s = script();
        s.push_downstream("one");
        s.killed.store(true, Ordering::SeqCst);
        s.push_downstream("two");
        s.release();
        assert!(s.downstream().is_empty());
    }

    #[test]
    fn test_best_match_prefers_leftmost_then_first() {
        let entries = vec![
            MatchEntry { label: "late".into(), matcher: Matcher::text("goblin").unwrap() },
            MatchEntry { label: "early".into(), matcher: Matcher::Regex(Regex::new("(?i)(you) see").unwrap()) },
            MatchEntry { label: "tie".into(), matcher: Matcher::text("you").unwrap() },
        ];
        let (entry, hit) = best_match(&entries, "You see a goblin").unwrap();
        assert_eq!(entry.label, "early");
        assert_eq!(hit.groups, vec!["You see".to_string(), "You".to_string()]);
        assert_eq!(hit.start, 0);
    }

    #[test]
    fn test_text_match_offsets_ignore_lowercase_width() {
        // U+0130 lowercases to three bytes, so offsets into a lowercased
        // copy would land after the goblin.
        let line = "\u{130}\u{130}\u{130}\u{130}\u{130}\u{130}\u{130}\u{130}\u{130}\u{130} Kobold goblin";
        let entries = vec![
            MatchEntry { label: "regex".into(), matcher: Matcher::Regex(Regex::new("goblin").unwrap()) },
            MatchEntry { label: "text".into(), matcher: Matcher::text("kobold").unwrap() },
        ];
        let (entry, hit) = best_match(&entries, line).unwrap();
        assert_eq!(entry.label, "text");
        assert_eq!(hit.start, 21);
        assert_eq!(hit.groups, vec!["Kobold".to_string()]);
    }
}
