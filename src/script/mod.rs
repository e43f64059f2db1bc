//! Script runtime and scheduler.
//!
//! Scripts are compiled ahead of time into label blocks and executed by a
//! small interpreter, one worker thread per script. The scheduler
//! ([`Runtime`]) starts, pauses and kills them and keeps the registry of
//! running scripts.
//!
//! # Architecture
//!
//! ```text
//! source ──► legacy::transpile (.cmd/.wiz) ──► compile ──► Program
//!                                                            │
//! Runtime::start ──► Script (mailboxes, flags) ──► worker thread ──► exec
//!                                                            │
//!                        Outlet (upstream socket, client echo) ◄──┘
//! ```
//!
//! Scripts never touch the game-state snapshot except through a
//! [`StateReader`](crate::state::StateReader).

pub mod compile;
pub mod expr;
pub mod legacy;
pub mod loader;
pub mod registry;
pub mod runtime;

mod exec;
mod scheduler;

use thiserror::Error;

pub use compile::{compile, CompileError, Label, Line, MatchPattern, Program, Stmt};
pub use legacy::{transpile, Transpiled};
pub use loader::ScriptLoader;
pub use registry::ScriptRegistry;
pub use runtime::{Flag, Script, ScriptInfo};
pub use scheduler::{Runtime, RuntimeSettings, StartOptions};

/// Origin tag used for commands typed by a presentation client.
pub const CLIENT_ORIGIN: &str = "client";

/// Why a script stopped abnormally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    /// The source failed to compile.
    #[error("syntax error: {0}")]
    Syntax(#[from] CompileError),
    /// A resource limit (variables, ...) was exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// A restricted operation was attempted without trust.
    #[error("illegal operation: {0}")]
    IllegalOperation(String),
    /// A worker thread could not be spawned.
    #[error("threading failure: {0}")]
    Threading(String),
    /// `gosub` nested deeper than the limit.
    #[error("stack overflow: gosub nested deeper than {0}")]
    StackOverflow(usize),
    /// A jump named a label that does not exist and no fallback is defined.
    #[error("undefined label '{0}'")]
    UndefinedLabel(String),
    /// The script was killed while running.
    #[error("killed")]
    Killed,
    /// Anything else.
    #[error("{0}")]
    Runtime(String),
}

impl ScriptError {
    /// Short category name used in diagnostics.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            ScriptError::Syntax(_) => "syntax",
            ScriptError::ResourceExhausted(_) => "resource",
            ScriptError::IllegalOperation(_) => "illegal-operation",
            ScriptError::Threading(_) => "threading",
            ScriptError::StackOverflow(_) => "stack-overflow",
            ScriptError::UndefinedLabel(_) => "undefined-label",
            ScriptError::Killed => "killed",
            ScriptError::Runtime(_) => "runtime",
        }
    }
}

/// Where scripts send commands and user-visible output.
///
/// Implemented by the session's upstream writer; tests use an in-memory
/// recorder.
pub trait Outlet: Send + Sync {
    /// Send one command line to the game server on behalf of `origin`.
    fn send_upstream(&self, line: &str, origin: &str) -> anyhow::Result<()>;

    /// Show a line of script output to attached clients.
    fn echo(&self, text: &str, origin: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories_and_display() {
        let err = ScriptError::UndefinedLabel("nowhere".into());
        assert_eq!(err.category(), "undefined-label");
        assert_eq!(err.to_string(), "undefined label 'nowhere'");

        let err: ScriptError = CompileError {
            line: 3,
            message: "unknown command 'jump'".into(),
        }
        .into();
        assert_eq!(err.category(), "syntax");
        assert!(err.to_string().contains("line 3"));
    }
}
