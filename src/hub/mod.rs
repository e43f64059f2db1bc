//! Hub - Central orchestrator for one play session.
//!
//! The Hub owns every long-lived piece of the middleware and wires them
//! together: the game session, the script runtime, the client listeners and
//! the hook chains. Front ends and scripts never hold each other directly;
//! they reach one another through the Hub's shared handles.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────┐
//!            │        Hub           │
//!            │  - Owns all handles  │
//!            │  - Runs main loop    │
//!            └──────────┬───────────┘
//!                       │
//!        ┌──────────────┼──────────────┐
//!        │              │              │
//!        ▼              ▼              ▼
//!     Session        Runtime      ClientListener
//!   (game socket)   (scripts)     (front ends)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let mut hub = Hub::new(Config::load()?)?;
//! hub.listen()?;
//! hub.connect()?;
//! hub.run(&shutdown_flag)?;
//! hub.shutdown();
//! ```

pub mod commands;
pub mod workers;

pub use commands::{dispatch_client_line, HubCommand, HUB_ORIGIN};
pub use workers::{ClientListener, LineHandler};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Result};

use crate::client::{ClientId, ClientRegistry, SharedClients};
use crate::config::Config;
use crate::distribution::Distributor;
use crate::hooks::HookChain;
use crate::parser::{Parser, ParserSettings};
use crate::sanitizer::Sanitizer;
use crate::script::{Outlet, Runtime, RuntimeSettings, ScriptLoader, ScriptRegistry};
use crate::session::{Pipeline, Session, Upstream};
use crate::state::{shared_state, StateReader};
use crate::trust::{FileTrustStore, TrustStore};

/// How often the main loop checks for shutdown and session loss.
const TICK: Duration = Duration::from_millis(100);

/// Central orchestrator for stormhub.
pub struct Hub {
    config: Config,
    clients: SharedClients,
    registry: Arc<ScriptRegistry>,
    state: StateReader,
    upstream: Arc<Upstream>,
    downstream_hooks: Arc<HookChain>,
    runtime: Runtime,
    /// Consumed by the first `connect`; the parser inside owns the only
    /// snapshot writer.
    pipeline: Option<Pipeline>,
    session: Option<Session>,
    listeners: Vec<ClientListener>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("game", &self.config.game_addr())
            .field("connected", &self.is_connected())
            .field("scripts", &self.registry.len())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Build a hub from configuration, opening the trust file.
    pub fn new(config: Config) -> Result<Self> {
        let trust_path = config.trust_path()?;
        let trust: Arc<dyn TrustStore> = Arc::new(
            FileTrustStore::open(&trust_path)
                .with_context(|| format!("opening trust file {}", trust_path.display()))?,
        );
        Ok(Self::with_trust(config, trust))
    }

    /// Build a hub with an explicit trust store.
    pub fn with_trust(config: Config, trust: Arc<dyn TrustStore>) -> Self {
        let clients = ClientRegistry::shared();
        let registry = Arc::new(ScriptRegistry::new());
        let downstream_hooks = Arc::new(HookChain::new("downstream"));
        let upstream = Arc::new(Upstream::new(
            Arc::new(HookChain::new("upstream")),
            Arc::clone(&clients),
            Arc::clone(&registry),
        ));

        let (writer, state) = shared_state();
        let outlet: Arc<dyn Outlet> = Arc::clone(&upstream) as Arc<dyn Outlet>;
        let runtime = Runtime::new(
            Arc::clone(&registry),
            state.clone(),
            outlet,
            trust,
            ScriptLoader::new(Some(config.script_dir.clone())),
            RuntimeSettings::from(&config),
        );

        let parser = Parser::new(
            writer,
            ParserSettings {
                mana_stat_bonus: config.mana_stat_bonus,
            },
        );
        let pipeline = Pipeline::new(
            Sanitizer::new(config.sanitizer),
            parser,
            Arc::clone(&downstream_hooks),
            Arc::clone(&clients),
            Distributor::new(runtime.clone()),
        );

        log::info!("[Hub] Created for {}", config.game_addr());
        Self {
            config,
            clients,
            registry,
            state,
            upstream,
            downstream_hooks,
            runtime,
            pipeline: Some(pipeline),
            session: None,
            listeners: Vec::new(),
        }
    }

    /// Start accepting presentation clients on the configured addresses.
    pub fn listen(&mut self) -> Result<()> {
        let primary = self.listener(&self.config.listen, ClientId::Primary, self.config.dialect)?;
        self.listeners.push(primary);
        if let Some(addr) = self.config.secondary_listen.clone() {
            let secondary =
                self.listener(&addr, ClientId::Secondary, self.config.secondary_dialect)?;
            self.listeners.push(secondary);
        }
        Ok(())
    }

    fn listener(
        &self,
        addr: &str,
        slot: ClientId,
        dialect: crate::client::Dialect,
    ) -> Result<ClientListener> {
        let runtime = self.runtime.clone();
        let upstream = Arc::clone(&self.upstream);
        let on_line: LineHandler = Arc::new(move |_slot: ClientId, line: &str| {
            dispatch_client_line(&runtime, upstream.as_ref(), line);
        });
        ClientListener::bind(addr, slot, dialect, Arc::clone(&self.clients), on_line)
    }

    /// Connect to the configured game server.
    pub fn connect(&mut self) -> Result<()> {
        let addr = self.config.game_addr();
        self.connect_to(&addr)
    }

    /// Connect to an explicit address. A hub drives a single session.
    pub fn connect_to(&mut self, addr: &str) -> Result<()> {
        let pipeline = self
            .pipeline
            .take()
            .context("hub already ran its session; start a new hub to reconnect")?;
        let session = Session::connect(addr, pipeline, Arc::clone(&self.upstream))?;
        self.runtime.set_injector(session.injector());
        self.session = Some(session);
        Ok(())
    }

    /// Handle a line as if a presentation client typed it.
    pub fn handle_client_line(&self, line: &str) {
        dispatch_client_line(&self.runtime, self.upstream.as_ref(), line);
    }

    /// Block until `shutdown` is set or the game connection closes.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        log::info!("[Hub] Main loop starting");
        while !shutdown.load(Ordering::SeqCst) {
            if self.session.as_ref().is_some_and(Session::is_closed) {
                log::info!("[Hub] Game session ended");
                break;
            }
            thread::sleep(TICK);
        }
        log::info!("[Hub] Main loop exiting");
        Ok(())
    }

    /// Kill every script, close the session and stop listening.
    pub fn shutdown(&mut self) {
        log::info!("[Hub] Shutting down");
        self.runtime.kill_all();
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        for listener in self.listeners.drain(..) {
            listener.shutdown();
        }
    }

    /// Whether a live game session exists.
    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Addresses the client listeners bound, primary first.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(ClientListener::local_addr).collect()
    }

    /// The script runtime.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Read handle on the game-state snapshot.
    pub fn state(&self) -> &StateReader {
        &self.state
    }

    /// Attached presentation clients.
    pub fn clients(&self) -> &SharedClients {
        &self.clients
    }

    /// The upstream writer and its hook chain.
    pub fn upstream(&self) -> &Arc<Upstream> {
        &self.upstream
    }

    /// Hooks applied to downstream lines before clients see them.
    pub fn downstream_hooks(&self) -> &Arc<HookChain> {
        &self.downstream_hooks
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.shutdown();
    }
}
