//! Stormhub - Session middleware for text-game automation.
//!
//! This crate sits between a game server and one or two presentation
//! clients, repairing the markup stream, tracking game state and running
//! automation scripts against it.
//!
//! # Architecture
//!
//! The crate follows a single-writer state store pattern:
//!
//! - **Session** - Game socket, line assembly and the per-line pipeline
//! - **Parser** - Sole writer of the [`state::GameState`] snapshot
//! - **Runtime** - Script scheduler; scripts only ever read the snapshot
//! - **Clients** - Front ends, each re-encoded in its own dialect
//! - **Hub** - Central orchestrator wiring the above together
//!
//! # Modules
//!
//! - [`sanitizer`] - Repairs malformed markup before parsing
//! - [`parser`] - Markup tokenizer and state updates
//! - [`script`] - Script compiler, interpreter and scheduler
//! - [`session`] - Game connection and upstream writer
//! - [`hub`] - Orchestration, client listeners and `;` commands
//! - [`config`] - Configuration loading/saving

use std::sync::{Mutex, MutexGuard};

// Library modules
pub mod client;
pub mod distribution;
pub mod hub;
pub mod parser;
pub mod sanitizer;
pub mod script;
pub mod session;
pub mod state;

pub mod config;
pub mod constants;
pub mod env;
pub mod hooks;
pub mod mailbox;
pub mod trust;

// Re-export commonly used types
pub use client::{ClientId, ClientRegistry, Dialect};
pub use config::Config;
pub use script::{Runtime, ScriptError, ScriptRegistry, StartOptions};
pub use session::{Pipeline, Session, Upstream};
pub use state::{GameState, StateReader};

// Re-export Hub
pub use hub::Hub;

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Script bodies run under `catch_unwind`, so a poisoned lock only means a
/// script died mid-update; the protected data is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
