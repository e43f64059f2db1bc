//! Registry of live scripts.
//!
//! Owned by the runtime and shared with the upstream writer (for upstream
//! echo) and distribution. Scripts are looked up by name, by id, or by the
//! worker thread currently executing them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::lock;

use super::runtime::Script;

/// Live scripts in start order.
#[derive(Debug, Default)]
pub struct ScriptRegistry {
    scripts: Mutex<Vec<Arc<Script>>>,
    by_thread: Mutex<HashMap<ThreadId, Arc<Script>>>,
    next_id: AtomicU64,
}

impl ScriptRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a script id. Ids are never reused.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn insert(&self, script: Arc<Script>) {
        lock(&self.scripts).push(script);
    }

    /// Remove by id, dropping any thread bindings to it.
    pub(crate) fn remove(&self, id: u64) -> Option<Arc<Script>> {
        let removed = {
            let mut scripts = lock(&self.scripts);
            let pos = scripts.iter().position(|s| s.id() == id)?;
            scripts.remove(pos)
        };
        lock(&self.by_thread).retain(|_, s| s.id() != id);
        Some(removed)
    }

    /// Find a live script by name (case-insensitive).
    pub fn find(&self, name: &str) -> Option<Arc<Script>> {
        lock(&self.scripts)
            .iter()
            .find(|s| !s.is_killed() && s.name().eq_ignore_ascii_case(name))
            .map(Arc::clone)
    }

    /// Find by id, killed or not, as long as it is still registered.
    pub fn get(&self, id: u64) -> Option<Arc<Script>> {
        lock(&self.scripts).iter().find(|s| s.id() == id).map(Arc::clone)
    }

    /// Whether a live script with this name exists.
    pub fn exists(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Snapshot of all registered scripts.
    pub fn all(&self) -> Vec<Arc<Script>> {
        lock(&self.scripts).clone()
    }

    /// Number of registered scripts.
    pub fn len(&self) -> usize {
        lock(&self.scripts).len()
    }

    /// Whether no script is registered.
    pub fn is_empty(&self) -> bool {
        lock(&self.scripts).is_empty()
    }

    pub(crate) fn bind_thread(&self, thread: ThreadId, script: Arc<Script>) {
        lock(&self.by_thread).insert(thread, script);
    }

    pub(crate) fn unbind_thread(&self, thread: ThreadId) {
        lock(&self.by_thread).remove(&thread);
    }

    /// The script the calling thread is executing, if any.
    pub fn current(&self) -> Option<Arc<Script>> {
        lock(&self.by_thread).get(&thread::current().id()).map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::compile;

    fn make(registry: &ScriptRegistry, name: &str) -> Arc<Script> {
        let program = Arc::new(compile("").unwrap());
        let script = Arc::new(Script::new(registry.allocate_id(), name, program, Vec::new(), false, 8));
        registry.insert(Arc::clone(&script));
        script
    }

    #[test]
    fn test_find_is_case_insensitive_and_ids_unique() {
        let registry = ScriptRegistry::new();
        let a = make(&registry, "Hunt");
        let b = make(&registry, "loot");
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.find("hunt").map(|s| s.id()), Some(a.id()));
        assert!(registry.exists("LOOT"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_drops_thread_binding() {
        let registry = ScriptRegistry::new();
        let a = make(&registry, "hunt");
        registry.bind_thread(thread::current().id(), Arc::clone(&a));
        assert_eq!(registry.current().map(|s| s.id()), Some(a.id()));

        assert!(registry.remove(a.id()).is_some());
        assert!(registry.current().is_none());
        assert!(registry.remove(a.id()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_current_is_per_thread() {
        let registry = Arc::new(ScriptRegistry::new());
        let a = make(&registry, "hunt");
        registry.bind_thread(thread::current().id(), a);
        let other = Arc::clone(&registry);
        let seen = thread::spawn(move || other.current().is_some()).join().unwrap();
        assert!(!seen);
        assert!(registry.current().is_some());
    }
}
