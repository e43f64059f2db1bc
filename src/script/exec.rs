//! Statement interpreter.
//!
//! A program counter walks `(label, line)` pairs. Control transfer is an
//! explicit [`Flow`] value returned by each statement; there is no unwinding
//! across labels. Every statement boundary and every blocking read is a
//! suspension point that honors pause and kill.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::constants::{LABEL_ERROR, MAX_CALL_DEPTH, YIELD_EVERY_STATEMENTS};
use crate::lock;
use crate::mailbox::Mailbox;

use super::compile::{MatchPattern, Resolution, Stmt};
use super::expr::{self, Scope};
use super::runtime::{best_match, MatchEntry, Matcher, Script, Watch};
use super::scheduler::{Runtime, StartOptions};
use super::ScriptError;

/// Longest accepted `pause`/`matchwait` duration, in seconds.
const MAX_WAIT_SECS: f64 = 86_400.0;

/// How a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finish {
    /// Ran off the end.
    Completed,
    /// Hit `exit`.
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// The script's main thread; falls through from label to label.
    Main,
    /// A watch callback; stops at the end of its label.
    Callback,
    /// A cleanup statement run by the killer; never blocks or jumps.
    Cleanup,
}

#[derive(Debug)]
enum Flow {
    Next,
    Jump(String),
    Gosub { label: String, args: Option<Vec<String>> },
    Return,
    Exit,
}

#[derive(Debug)]
struct Frame {
    resume: (usize, usize),
    saved_args: Option<Vec<String>>,
}

struct Exec<'a> {
    rt: &'a Runtime,
    script: &'a Arc<Script>,
    mode: Mode,
    frames: Vec<Frame>,
    executed: usize,
}

/// Run a script from its first label.
pub(crate) fn run_main(rt: &Runtime, script: &Arc<Script>) -> Result<(), ScriptError> {
    Exec::new(rt, script, Mode::Main).run(0).map(|_| ())
}

/// Run a watch callback starting at `label`.
pub(crate) fn run_callback(
    rt: &Runtime,
    script: &Arc<Script>,
    label: &str,
) -> Result<Finish, ScriptError> {
    let mut exec = Exec::new(rt, script, Mode::Callback);
    let start = exec.resolve(label)?;
    exec.run(start)
}

/// Run one cleanup statement on behalf of a killed script.
pub(crate) fn run_cleanup(rt: &Runtime, script: &Arc<Script>, stmt: &Stmt) -> Result<(), ScriptError> {
    let mut exec = Exec::new(rt, script, Mode::Cleanup);
    match exec.step(stmt)? {
        Flow::Jump(label) | Flow::Gosub { label, .. } => {
            log::debug!("[Scripts] {} cleanup: ignoring jump to {}", script.name(), label);
        }
        Flow::Next | Flow::Return | Flow::Exit => {}
    }
    Ok(())
}

fn at_line(error: ScriptError, line: usize) -> ScriptError {
    match error {
        ScriptError::Runtime(msg) => ScriptError::Runtime(format!("line {line}: {msg}")),
        ScriptError::IllegalOperation(msg) => {
            ScriptError::IllegalOperation(format!("line {line}: {msg}"))
        }
        other => other,
    }
}

fn parse_seconds(text: &str) -> Result<Duration, ScriptError> {
    let secs: f64 = text
        .trim()
        .parse()
        .map_err(|_| ScriptError::Runtime(format!("'{text}' is not a number of seconds")))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ScriptError::Runtime(format!("invalid duration '{text}'")));
    }
    Ok(Duration::from_secs_f64(secs.min(MAX_WAIT_SECS)))
}

impl<'a> Exec<'a> {
    fn new(rt: &'a Runtime, script: &'a Arc<Script>, mode: Mode) -> Self {
        Self {
            rt,
            script,
            mode,
            frames: Vec::new(),
            executed: 0,
        }
    }

    fn run(&mut self, start: usize) -> Result<Finish, ScriptError> {
        let program = Arc::clone(self.script.program());
        let (mut label, mut line) = (start, 0);

        loop {
            let Some(current) = program.block(label).get(line) else {
                if self.mode == Mode::Main {
                    if let Some(next) = program.next_label(label) {
                        label = next;
                        line = 0;
                        continue;
                    }
                }
                return Ok(Finish::Completed);
            };

            self.checkpoint()?;
            let flow = self.step(&current.stmt).map_err(|e| at_line(e, current.number))?;

            match flow {
                Flow::Next => line += 1,
                Flow::Jump(target) => {
                    label = self.resolve(&target)?;
                    line = 0;
                }
                Flow::Gosub { label: target, args } => {
                    if self.frames.len() >= MAX_CALL_DEPTH {
                        return Err(ScriptError::StackOverflow(MAX_CALL_DEPTH));
                    }
                    let callee = self.resolve(&target)?;
                    let saved_args = args.map(|args| self.script.replace_args(args));
                    self.frames.push(Frame {
                        resume: (label, line + 1),
                        saved_args,
                    });
                    label = callee;
                    line = 0;
                }
                Flow::Return => match self.frames.pop() {
                    Some(frame) => {
                        if let Some(args) = frame.saved_args {
                            self.script.replace_args(args);
                        }
                        (label, line) = frame.resume;
                    }
                    None if self.mode == Mode::Callback => return Ok(Finish::Completed),
                    None => {
                        return Err(ScriptError::Runtime(format!(
                            "line {}: return without gosub",
                            current.number
                        )))
                    }
                },
                Flow::Exit => return Ok(Finish::Exited),
            }
        }
    }

    fn resolve(&self, target: &str) -> Result<usize, ScriptError> {
        match self.script.program().resolve(target) {
            Resolution::Found(idx) => Ok(idx),
            Resolution::Fallback(idx) => {
                log::warn!(
                    "[Scripts] {}: label '{}' not found, continuing at {}",
                    self.script.name(),
                    target,
                    LABEL_ERROR
                );
                self.echo(&format!("label '{target}' not found, continuing at {LABEL_ERROR}"));
                Ok(idx)
            }
            Resolution::Missing => Err(ScriptError::UndefinedLabel(target.to_string())),
        }
    }

    fn ensure_alive(&self) -> Result<(), ScriptError> {
        if self.mode != Mode::Cleanup && self.script.is_killed() {
            return Err(ScriptError::Killed);
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        self.rt.settings().poll_interval
    }

    fn checkpoint(&mut self) -> Result<(), ScriptError> {
        if self.mode == Mode::Cleanup {
            return Ok(());
        }
        self.ensure_alive()?;
        while self.script.is_paused() {
            thread::sleep(self.poll_interval());
            self.ensure_alive()?;
        }
        self.executed += 1;
        if self.executed % YIELD_EVERY_STATEMENTS == 0 {
            thread::yield_now();
        }
        Ok(())
    }

    /// Poll `check` until it yields or `deadline` passes. `Ok(None)` is a
    /// timeout, never an error.
    fn wait_until<T>(
        &self,
        deadline: Option<Instant>,
        mut check: impl FnMut() -> Option<T>,
    ) -> Result<Option<T>, ScriptError> {
        loop {
            self.ensure_alive()?;
            if self.mode == Mode::Cleanup || !self.script.is_paused() {
                if let Some(value) = check() {
                    return Ok(Some(value));
                }
            }
            if self.mode == Mode::Cleanup {
                return Ok(None);
            }
            let mut nap = self.poll_interval();
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                nap = nap.min(deadline - now);
            }
            thread::sleep(nap);
        }
    }

    /// Next line from `mailbox`. Only cleanup mode can return `Ok(None)`
    /// without a deadline.
    fn next_line(
        &self,
        mailbox: &Mailbox<String>,
        deadline: Option<Instant>,
    ) -> Result<Option<String>, ScriptError> {
        loop {
            self.ensure_alive()?;
            if self.mode == Mode::Cleanup {
                return Ok(mailbox.try_pop());
            }
            let mut wait = self.poll_interval();
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                wait = wait.min(deadline - now);
            }
            if self.script.is_paused() {
                thread::sleep(wait);
                continue;
            }
            if let Some(line) = mailbox.pop_timeout(wait) {
                return Ok(Some(line));
            }
        }
    }

    fn interp(&self, template: &str) -> String {
        let state = self.rt.state().read();
        self.script.with_scope(|args, vars| {
            expr::interpolate(
                template,
                &Scope {
                    args,
                    vars,
                    state: Some(&*state),
                },
            )
        })
    }

    fn send(&self, line: &str) -> Result<(), ScriptError> {
        self.rt
            .outlet()
            .send_upstream(line, self.script.name())
            .map_err(|e| ScriptError::Runtime(format!("send failed: {e}")))
    }

    fn echo(&self, text: &str) {
        self.rt.outlet().echo(text, self.script.name());
    }

    fn require_trust(&self, operation: &str) -> Result<(), ScriptError> {
        if self.script.is_trusted() {
            Ok(())
        } else {
            Err(ScriptError::IllegalOperation(format!(
                "'{operation}' requires a trusted script"
            )))
        }
    }

    fn set_match_vars(&self, groups: &[String]) -> Result<(), ScriptError> {
        for (i, group) in groups.iter().enumerate() {
            let name = if i == 0 { "match".to_string() } else { format!("match{i}") };
            self.script.set_var(&name, group.clone())?;
        }
        Ok(())
    }

    /// Optionally send a command, then wait for the room counter to move.
    fn travel(&self, command: Option<&str>) -> Result<(), ScriptError> {
        let state = self.rt.state();
        let before = state.room_count();
        if let Some(command) = command {
            self.send(command)?;
        }
        let deadline = Instant::now() + self.rt.settings().move_timeout;
        let moved = self
            .wait_until(Some(deadline), || (state.room_count() != before).then_some(()))?
            .is_some();
        self.script
            .set_var("moved", if moved { "1" } else { "0" }.to_string())?;
        if !moved && self.mode != Mode::Cleanup {
            let what = command.unwrap_or("nextroom");
            log::warn!("[Scripts] {}: no room change after '{}'", self.script.name(), what);
            self.echo(&format!("no room change after '{what}'"));
        }
        Ok(())
    }

    fn step(&mut self, stmt: &Stmt) -> Result<Flow, ScriptError> {
        match stmt {
            Stmt::Put(text) => self.send(&self.interp(text))?,
            Stmt::Echo(text) => self.echo(&self.interp(text)),
            Stmt::Goto(target) => return Ok(Flow::Jump(self.interp(target))),
            Stmt::Gosub { label, args } => {
                let args = self.interp(args);
                let args = (!args.trim().is_empty())
                    .then(|| args.split_whitespace().map(String::from).collect());
                return Ok(Flow::Gosub {
                    label: self.interp(label),
                    args,
                });
            }
            Stmt::Return => return Ok(Flow::Return),
            Stmt::Exit => return Ok(Flow::Exit),

            Stmt::Pause(secs) => {
                let duration = match secs {
                    Some(text) => parse_seconds(&self.interp(text))?,
                    None => Duration::from_secs(1),
                };
                self.wait_until(Some(Instant::now() + duration), || None::<()>)?;
            }
            Stmt::Wait => {
                self.next_line(self.script.downstream(), None)?;
            }
            Stmt::WaitFor(text) => {
                let needle = self.interp(text).to_lowercase();
                while let Some(line) = self.next_line(self.script.downstream(), None)? {
                    if line.to_lowercase().contains(&needle) {
                        break;
                    }
                }
            }
            Stmt::WaitForRe(pattern) => {
                while let Some(line) = self.next_line(self.script.downstream(), None)? {
                    if let Some(caps) = pattern.regex().captures(&line) {
                        let groups: Vec<String> = caps
                            .iter()
                            .map(|m| m.map_or_else(String::new, |m| m.as_str().to_string()))
                            .collect();
                        self.set_match_vars(&groups)?;
                        break;
                    }
                }
            }
            Stmt::WaitRt => {
                let state = self.rt.state();
                self.wait_until(None, || (state.with(|s| s.roundtime_left()) <= 0).then_some(()))?;
            }
            Stmt::Move(command) => self.travel(Some(&self.interp(command)))?,
            Stmt::NextRoom => self.travel(None)?,

            Stmt::Match { label, pattern } => {
                let matcher = match pattern {
                    MatchPattern::Text(text) => Matcher::text(&self.interp(text))
                        .map_err(|e| ScriptError::Runtime(e.to_string()))?,
                    MatchPattern::Regex(p) => Matcher::Regex(p.regex().clone()),
                };
                lock(&self.script.match_stack).push(MatchEntry {
                    label: self.interp(label),
                    matcher,
                });
            }
            Stmt::MatchWait(secs) => {
                let entries = lock(&self.script.match_stack).clone();
                if entries.is_empty() {
                    log::warn!("[Scripts] {}: matchwait with no patterns", self.script.name());
                    self.echo("matchwait with no patterns");
                    return Ok(Flow::Next);
                }
                let deadline = match secs {
                    Some(text) => Some(Instant::now() + parse_seconds(&self.interp(text))?),
                    None => None,
                };
                let hit = loop {
                    let Some(line) = self.next_line(self.script.downstream(), deadline)? else {
                        break None;
                    };
                    if let Some((entry, hit)) = best_match(&entries, &line) {
                        break Some((entry.label.clone(), hit.groups));
                    }
                };
                lock(&self.script.match_stack).clear();
                if let Some((label, groups)) = hit {
                    self.set_match_vars(&groups)?;
                    return Ok(Flow::Jump(label));
                }
            }

            Stmt::Set { name, expr } => {
                let value = expr::evaluate(&self.interp(expr))?;
                self.script.set_var(name, value)?;
            }
            Stmt::Unset(name) => self.script.unset_var(name),
            Stmt::Shift => {
                self.script.shift_args();
            }
            Stmt::If { cond, then } => {
                if expr::truthy(&self.interp(cond)) {
                    return self.step(then);
                }
            }

            Stmt::Watch { label, pattern } => {
                lock(&self.script.watches).push(Watch {
                    source: pattern.source().to_string(),
                    regex: pattern.regex().clone(),
                    label: label.clone(),
                });
            }
            Stmt::Unwatch(key) => {
                let key = self.interp(key);
                lock(&self.script.watches)
                    .retain(|w| w.source != key && !w.label.eq_ignore_ascii_case(&key));
            }
            Stmt::DieWith(name) => self.script.die_with(&self.interp(name)),
            Stmt::Cleanup(inner) => self.script.add_cleanup_stmt((**inner).clone()),

            Stmt::Start(text) => {
                self.require_trust("start")?;
                let text = self.interp(text);
                let mut words = text.split_whitespace();
                if let Some(name) = words.next() {
                    let args = words.map(String::from).collect();
                    if let Err(e) = self.rt.start(name, args, StartOptions::default()) {
                        log::warn!("[Scripts] {}: start {} failed: {}", self.script.name(), name, e);
                        self.echo(&format!("start {name} failed: {e}"));
                    }
                }
            }
            Stmt::Kill(name) => {
                self.require_trust("kill")?;
                let name = self.interp(name);
                if !self.rt.kill(&name) {
                    self.echo(&format!("no script named {name}"));
                }
            }
            Stmt::Inject(text) => {
                self.require_trust("inject")?;
                self.rt.inject(&self.interp(text))?;
            }
            Stmt::Unique(var) => {
                if let Some(line) = self.next_line(self.script.unique(), None)? {
                    self.script.set_var(var, line)?;
                }
            }
            Stmt::UWaitFor(text) => {
                let needle = self.interp(text).to_lowercase();
                while let Some(line) = self.next_line(self.script.unique(), None)? {
                    if line.to_lowercase().contains(&needle) {
                        break;
                    }
                }
            }
            Stmt::Flag { flag, on } => self.script.set_flag(*flag, *on),
        }
        Ok(Flow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("1.5").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_seconds(" 2 ").unwrap(), Duration::from_secs(2));
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("soon").is_err());
        assert!(parse_seconds("NaN").is_err());
        assert_eq!(parse_seconds("1e12").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_line_annotation() {
        let e = at_line(ScriptError::Runtime("boom".into()), 7);
        assert_eq!(e.to_string(), "line 7: boom");
        assert_eq!(at_line(ScriptError::Killed, 7), ScriptError::Killed);
    }
}
