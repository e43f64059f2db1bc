//! Fan-out of parsed game lines to running scripts.
//!
//! Every line is pushed into the mailbox of every script that wants it
//! (broadcast, not work-stealing), then each script's watch triggers are
//! evaluated against the line it received.

use std::sync::Arc;

use crate::lock;
use crate::script::{Flag, Runtime, Script, ScriptRegistry};

/// Delivers downstream lines to scripts.
#[derive(Debug, Clone)]
pub struct Distributor {
    runtime: Runtime,
}

impl Distributor {
    /// Distributor over `runtime`'s scripts.
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    /// Deliver one line.
    ///
    /// Scripts with the structured flag get `raw`; others get `plain` when
    /// their downstream flag is set and there is plain text. Returns how many
    /// scripts received the line.
    pub fn distribute(&self, plain: Option<&str>, raw: &str) -> usize {
        let mut delivered = 0;
        for script in self.runtime.scripts() {
            let line = if script.flag(Flag::Structured) {
                Some(raw)
            } else if script.flag(Flag::Downstream) {
                plain
            } else {
                None
            };
            let Some(line) = line else { continue };

            script.push_downstream(line);
            delivered += 1;
            self.fire_watches(&script, line);
        }
        delivered
    }

    fn fire_watches(&self, script: &Arc<Script>, line: &str) {
        let labels: Vec<String> = lock(&script.watches)
            .iter()
            .filter(|w| w.regex.is_match(line))
            .map(|w| w.label.clone())
            .collect();
        for label in labels {
            log::debug!("[Distribution] Watch {} of {} fired", label, script.name());
            self.runtime.fire_watch(script, &label);
        }
    }
}

/// Copy an outgoing command to every script that asked for upstream echo.
pub fn echo_upstream(registry: &ScriptRegistry, line: &str, origin: &str) {
    for script in registry.all() {
        if !script.is_killed() && script.flag(Flag::Upstream) {
            script.push_upstream(&format!("[{origin}]>{line}"));
        }
    }
}
