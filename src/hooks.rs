//! Named line-rewriting hook chains.
//!
//! A chain holds ordered `(name, hook)` pairs. Each hook sees the output of
//! the previous one and may rewrite the line or swallow it by returning
//! `None`. A hook that panics is removed from the chain so one bad hook can
//! not wedge the stream.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::lock;

/// A line rewriter. `None` drops the line.
pub type Hook = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Ordered, named collection of hooks.
#[derive(Default)]
pub struct HookChain {
    label: &'static str,
    hooks: Mutex<Vec<(String, Hook)>>,
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookChain")
            .field("label", &self.label)
            .field("names", &self.names())
            .finish()
    }
}

impl HookChain {
    /// Create an empty chain; `label` names it in logs.
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Add a hook at the end, replacing any hook with the same name in place.
    pub fn add(&self, name: impl Into<String>, hook: Hook) {
        let name = name.into();
        let mut hooks = lock(&self.hooks);
        if let Some(slot) = hooks.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = hook;
        } else {
            hooks.push((name, hook));
        }
    }

    /// Remove a hook by name. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        let mut hooks = lock(&self.hooks);
        let before = hooks.len();
        hooks.retain(|(n, _)| n != name);
        hooks.len() != before
    }

    /// Hook names in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        lock(&self.hooks).iter().map(|(n, _)| n.clone()).collect()
    }

    /// Run `line` through every hook.
    pub fn run(&self, line: &str) -> Option<String> {
        // Snapshot so hooks may add/remove hooks without deadlocking.
        let hooks: Vec<(String, Hook)> = lock(&self.hooks).clone();
        let mut current = line.to_string();
        for (name, hook) in hooks {
            match catch_unwind(AssertUnwindSafe(|| hook(&current))) {
                Ok(Some(next)) => current = next,
                Ok(None) => return None,
                Err(_) => {
                    log::error!("[Hooks] {} hook '{}' panicked, removing it", self.label, name);
                    self.remove(&name);
                }
            }
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_run_in_order_and_can_swallow() {
        let chain = HookChain::new("downstream");
        chain.add("upper", Arc::new(|l: &str| Some(l.to_uppercase())));
        chain.add("suffix", Arc::new(|l: &str| Some(format!("{l}!"))));
        assert_eq!(chain.run("hi").as_deref(), Some("HI!"));

        chain.add("gag", Arc::new(|l: &str| (!l.contains("SPAM")).then(|| l.to_string())));
        assert_eq!(chain.run("spam"), None);
        assert_eq!(chain.names(), vec!["upper", "suffix", "gag"]);
    }

    #[test]
    fn test_replace_and_remove() {
        let chain = HookChain::new("upstream");
        chain.add("a", Arc::new(|_: &str| Some("one".to_string())));
        chain.add("a", Arc::new(|_: &str| Some("two".to_string())));
        assert_eq!(chain.run("x").as_deref(), Some("two"));
        assert!(chain.remove("a"));
        assert!(!chain.remove("a"));
        assert_eq!(chain.run("x").as_deref(), Some("x"));
    }

    #[test]
    fn test_panicking_hook_is_removed() {
        let chain = HookChain::new("downstream");
        chain.add("boom", Arc::new(|_: &str| -> Option<String> { panic!("bad hook") }));
        chain.add("keep", Arc::new(|l: &str| Some(format!("[{l}]"))));
        assert_eq!(chain.run("x").as_deref(), Some("[x]"));
        assert_eq!(chain.names(), vec!["keep"]);
    }
}
