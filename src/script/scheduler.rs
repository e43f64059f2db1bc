//! Script scheduler: start, pause, kill and list scripts.
//!
//! Each script runs on its own OS thread. Watch callbacks get their own
//! short-lived threads too, all tracked in the script's thread list so a
//! kill can stop them before cleanup runs.
//!
//! # Kill protocol
//!
//! 1. Mark killed (idempotent; a second kill returns immediately)
//! 2. Join every worker thread except the caller's, bounded by a timeout
//! 3. Kill every script named in the die-with list
//! 4. Run cleanup actions, each isolated from the others
//! 5. Remove from the registry and release buffers

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::constants::{
    DEFAULT_KILL_JOIN_TIMEOUT, DEFAULT_MAILBOX_CAPACITY, DEFAULT_MOVE_TIMEOUT,
    DEFAULT_POLL_INTERVAL,
};
use crate::lock;
use crate::state::StateReader;
use crate::trust::TrustStore;

use super::compile::Program;
use super::exec;
use super::loader::ScriptLoader;
use super::registry::ScriptRegistry;
use super::runtime::{CleanupAction, Flag, Script, ScriptInfo};
use super::{Outlet, ScriptError};

/// Tunables for the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Lines buffered per script mailbox.
    pub mailbox_capacity: usize,
    /// Suspension-point polling granularity.
    pub poll_interval: Duration,
    /// How long a kill waits for each worker thread.
    pub kill_join_timeout: Duration,
    /// Deadline for `move` to observe a room change.
    pub move_timeout: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            kill_join_timeout: DEFAULT_KILL_JOIN_TIMEOUT,
            move_timeout: DEFAULT_MOVE_TIMEOUT,
        }
    }
}

impl From<&Config> for RuntimeSettings {
    fn from(config: &Config) -> Self {
        Self {
            mailbox_capacity: config.mailbox_capacity,
            poll_interval: config.poll_interval(),
            kill_join_timeout: config.kill_join_timeout(),
            move_timeout: config.move_timeout(),
        }
    }
}

/// Options for [`Runtime::start`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Suppress start/exit messages.
    pub quiet: bool,
    /// Kill a running script of the same name instead of refusing.
    pub force: bool,
}

struct Services {
    registry: Arc<ScriptRegistry>,
    state: StateReader,
    outlet: Arc<dyn Outlet>,
    injector: Mutex<Option<Sender<String>>>,
    trust: Arc<dyn TrustStore>,
    loader: ScriptLoader,
    settings: RuntimeSettings,
}

/// Handle to the script scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Services>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("scripts", &self.inner.registry.len())
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Create a runtime over shared services.
    pub fn new(
        registry: Arc<ScriptRegistry>,
        state: StateReader,
        outlet: Arc<dyn Outlet>,
        trust: Arc<dyn TrustStore>,
        loader: ScriptLoader,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Services {
                registry,
                state,
                outlet,
                injector: Mutex::new(None),
                trust,
                loader,
                settings,
            }),
        }
    }

    /// Where `inject` delivers synthetic downstream lines.
    pub fn set_injector(&self, sender: Sender<String>) {
        *lock(&self.inner.injector) = Some(sender);
    }

    /// Script registry.
    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.inner.registry
    }

    /// Read handle on the game state.
    pub fn state(&self) -> &StateReader {
        &self.inner.state
    }

    /// Command and echo sink.
    pub fn outlet(&self) -> &Arc<dyn Outlet> {
        &self.inner.outlet
    }

    /// Trust policy.
    pub fn trust(&self) -> &Arc<dyn TrustStore> {
        &self.inner.trust
    }

    /// Script loader.
    pub fn loader(&self) -> &ScriptLoader {
        &self.inner.loader
    }

    /// Tunables.
    pub fn settings(&self) -> &RuntimeSettings {
        &self.inner.settings
    }

    /// Load `name` and start it.
    pub fn start(
        &self,
        name: &str,
        args: Vec<String>,
        opts: StartOptions,
    ) -> Result<Arc<Script>, ScriptError> {
        if !opts.force {
            self.refuse_duplicate(name)?;
        }
        let program = self.inner.loader.load(name)?;
        self.start_program(name, program, args, opts)
    }

    /// Start an already compiled program under `name`.
    pub fn start_program(
        &self,
        name: &str,
        program: Arc<Program>,
        args: Vec<String>,
        opts: StartOptions,
    ) -> Result<Arc<Script>, ScriptError> {
        if opts.force {
            if let Some(existing) = self.inner.registry.find(name) {
                self.kill_script(&existing);
            }
        } else {
            self.refuse_duplicate(name)?;
        }

        let registry = &self.inner.registry;
        let trusted = self.inner.trust.is_trusted(name);
        let script = Arc::new(Script::new(
            registry.allocate_id(),
            name,
            program,
            args,
            trusted,
            self.inner.settings.mailbox_capacity,
        ));
        script.set_flag(Flag::Quiet, opts.quiet);
        registry.insert(Arc::clone(&script));

        log::info!("[Scripts] Starting {} (#{}, trusted={})", name, script.id(), trusted);
        if !opts.quiet {
            self.inner.outlet.echo("--- started", name);
        }

        let rt = self.clone();
        let worker = Arc::clone(&script);
        if let Err(e) = self.spawn_worker(&script, move || run_worker(&rt, &worker)) {
            registry.remove(script.id());
            log::error!("[Scripts] Failed to start {}: {}", name, e);
            return Err(e);
        }
        Ok(script)
    }

    fn refuse_duplicate(&self, name: &str) -> Result<(), ScriptError> {
        if self.inner.registry.exists(name) {
            return Err(ScriptError::IllegalOperation(format!(
                "script '{name}' is already running"
            )));
        }
        Ok(())
    }

    /// Spawn a thread belonging to `script`.
    ///
    /// The thread is bound as the script's execution context for
    /// [`ScriptRegistry::current`]. Refused once the script is killed.
    pub fn spawn_worker<F>(&self, script: &Arc<Script>, f: F) -> Result<(), ScriptError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut threads = lock(&script.threads);
        if script.is_killed() {
            return Err(ScriptError::Killed);
        }
        threads.retain(|h| !h.is_finished());

        let registry = Arc::clone(&self.inner.registry);
        let bound = Arc::clone(script);
        let handle = thread::Builder::new()
            .name(format!("script-{}", script.name()))
            .spawn(move || {
                let id = thread::current().id();
                registry.bind_thread(id, bound);
                scopeguard::defer! {
                    registry.unbind_thread(id);
                }
                f();
            })
            .map_err(|e| ScriptError::Threading(e.to_string()))?;
        threads.push(handle);
        Ok(())
    }

    /// Kill the live script named `name`. Returns whether one was found.
    pub fn kill(&self, name: &str) -> bool {
        match self.inner.registry.find(name) {
            Some(script) => {
                self.kill_script(&script);
                true
            }
            None => false,
        }
    }

    /// Kill every registered script.
    pub fn kill_all(&self) {
        for script in self.inner.registry.all() {
            self.kill_script(&script);
        }
    }

    /// Kill `script`. Killing an already killed script does nothing more;
    /// a concurrent second caller returns once the first has finished.
    pub fn kill_script(&self, script: &Arc<Script>) {
        if script.killed.swap(true, Ordering::SeqCst) {
            self.await_kill(script);
            return;
        }
        *lock(&script.killer) = Some(thread::current().id());
        script.set_paused(false);
        log::info!("[Scripts] Killing {} (#{})", script.name(), script.id());

        let handles: Vec<JoinHandle<()>> = lock(&script.threads).drain(..).collect();
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() != me {
                self.join_bounded(script, handle);
            }
        }

        let dependents = std::mem::take(&mut *lock(&script.die_with));
        for name in dependents {
            if let Some(dependent) = self.inner.registry.find(&name) {
                log::info!("[Scripts] {} dies with {}", dependent.name(), script.name());
                self.kill_script(&dependent);
            }
        }

        let actions = std::mem::take(&mut *lock(&script.cleanup));
        for action in actions {
            let result = panic::catch_unwind(AssertUnwindSafe(|| match action {
                CleanupAction::Statement(stmt) => exec::run_cleanup(self, script, &stmt)
                    .map_err(anyhow::Error::from),
                CleanupAction::Native(f) => f(),
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::warn!("[Scripts] Cleanup for {} failed: {}", script.name(), e);
                }
                Err(_) => log::warn!("[Scripts] Cleanup for {} panicked", script.name()),
            }
        }

        self.inner.registry.remove(script.id());
        script.release();

        log::info!("[Scripts] {} exited", script.name());
        if !script.flag(Flag::Quiet) {
            self.inner.outlet.echo("--- exited", script.name());
        }
    }

    /// Wait for another caller's kill of `script` to finish.
    ///
    /// Returns at once when called from the killing thread itself (a
    /// die-with cycle) or from one of the script's own threads, which the
    /// killer is joining. Bounded so crossing kills cannot wedge.
    fn await_kill(&self, script: &Script) {
        let me = thread::current().id();
        if *lock(&script.killer) == Some(me)
            || self
                .inner
                .registry
                .current()
                .is_some_and(|current| current.id() == script.id())
        {
            return;
        }
        let deadline = Instant::now() + self.inner.settings.kill_join_timeout * 2;
        while self.inner.registry.get(script.id()).is_some() {
            if Instant::now() >= deadline {
                log::warn!("[Scripts] Gave up waiting for {} to finish dying", script.name());
                return;
            }
            thread::sleep(self.inner.settings.poll_interval.min(Duration::from_millis(10)));
        }
    }

    fn join_bounded(&self, script: &Script, handle: JoinHandle<()>) {
        let deadline = Instant::now() + self.inner.settings.kill_join_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "[Scripts] Worker of {} did not stop within {:?}; detaching",
                    script.name(),
                    self.inner.settings.kill_join_timeout
                );
                return;
            }
            thread::sleep(self.inner.settings.poll_interval.min(Duration::from_millis(10)));
        }
        if handle.join().is_err() {
            log::warn!("[Scripts] Worker of {} panicked", script.name());
        }
    }

    /// Pause `name` at its next suspension point.
    pub fn pause(&self, name: &str) -> bool {
        self.set_paused(name, true)
    }

    /// Resume a paused script.
    pub fn unpause(&self, name: &str) -> bool {
        self.set_paused(name, false)
    }

    fn set_paused(&self, name: &str, paused: bool) -> bool {
        match self.inner.registry.find(name) {
            Some(script) => {
                script.set_paused(paused);
                log::info!("[Scripts] {} {}", script.name(), if paused { "paused" } else { "resumed" });
                true
            }
            None => false,
        }
    }

    /// Listing of live scripts; hidden ones only when asked.
    pub fn list(&self, include_hidden: bool) -> Vec<ScriptInfo> {
        self.inner
            .registry
            .all()
            .into_iter()
            .filter(|s| !s.is_killed())
            .map(|s| s.info())
            .filter(|info| include_hidden || !info.hidden)
            .collect()
    }

    /// Whether a live script is named `name`.
    pub fn exists(&self, name: &str) -> bool {
        self.inner.registry.exists(name)
    }

    /// Script executing on the calling thread.
    pub fn current(&self) -> Option<Arc<Script>> {
        self.inner.registry.current()
    }

    /// Snapshot of live scripts.
    pub fn scripts(&self) -> Vec<Arc<Script>> {
        self.inner
            .registry
            .all()
            .into_iter()
            .filter(|s| !s.is_killed())
            .collect()
    }

    /// Push an out-of-band line to `name`'s unique buffer.
    pub fn send_unique(&self, name: &str, line: &str) -> bool {
        match self.inner.registry.find(name) {
            Some(script) => {
                script.push_unique(line);
                true
            }
            None => false,
        }
    }

    /// Feed a synthetic downstream line through the session pipeline.
    pub fn inject(&self, line: &str) -> Result<(), ScriptError> {
        let injector = lock(&self.inner.injector);
        let sender = injector
            .as_ref()
            .ok_or_else(|| ScriptError::Runtime("no session to inject into".into()))?;
        sender
            .send(line.to_string())
            .map_err(|_| ScriptError::Runtime("session closed".into()))
    }

    /// Run `label` of `script` as a watch callback on its own thread.
    pub(crate) fn fire_watch(&self, script: &Arc<Script>, label: &str) {
        let rt = self.clone();
        let target = Arc::clone(script);
        let label = label.to_string();
        let name = script.name().to_string();
        if let Err(e) = self.spawn_worker(script, move || run_callback(&rt, &target, &label)) {
            if e != ScriptError::Killed {
                log::warn!("[Scripts] Could not run watch callback for {}: {}", name, e);
            }
        }
    }
}

/// Body of a watch callback thread. Failures are reported but leave the
/// script running; `exit` kills it.
fn run_callback(rt: &Runtime, script: &Arc<Script>, label: &str) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| exec::run_callback(rt, script, label)));
    match result {
        Ok(Ok(exec::Finish::Completed) | Err(ScriptError::Killed)) => {}
        Ok(Ok(exec::Finish::Exited)) => rt.kill_script(script),
        Ok(Err(e)) => report_failure(rt, script, &e),
        Err(payload) => {
            let e = ScriptError::Runtime(format!("callback panicked: {}", panic_message(payload.as_ref())));
            report_failure(rt, script, &e);
        }
    }
}

/// Body of a script's main worker thread.
fn run_worker(rt: &Runtime, script: &Arc<Script>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| exec::run_main(rt, script)));
    match result {
        Ok(Ok(()) | Err(ScriptError::Killed)) => {}
        Ok(Err(e)) => report_failure(rt, script, &e),
        Err(payload) => {
            let e = ScriptError::Runtime(format!("panicked: {}", panic_message(payload.as_ref())));
            report_failure(rt, script, &e);
        }
    }
    rt.kill_script(script);
}

pub(crate) fn report_failure(rt: &Runtime, script: &Script, error: &ScriptError) {
    log::error!("[Scripts] {} failed ({}): {}", script.name(), error.category(), error);
    rt.outlet()
        .echo(&format!("--- {}: {}", error.category(), error), script.name());
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
