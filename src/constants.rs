//! Application-wide constants for stormhub.
//!
//! Centralizes magic numbers and protocol strings so the parser, sanitizer
//! and scheduler agree on them.

use std::time::Duration;

// ============================================================================
// Scheduling
// ============================================================================

/// Interval at which suspension points re-check kill and pause flags.
///
/// Every blocking read and explicit wait polls at this granularity, so it
/// bounds both pause latency and how long a kill waits for a worker.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long a kill waits for a worker thread before detaching it.
pub const DEFAULT_KILL_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for `move` to observe a room change.
pub const DEFAULT_MOVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default mailbox capacity (lines) per script buffer.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 500;

/// Maximum `gosub` nesting before a script fails with a stack overflow.
pub const MAX_CALL_DEPTH: usize = 256;

/// Maximum number of local variables a script may hold.
pub const MAX_VARIABLES: usize = 10_000;

/// Statements executed between cooperative yields in tight loops.
pub const YIELD_EVERY_STATEMENTS: usize = 1_000;

// ============================================================================
// Script source
// ============================================================================

/// Name of the implicit label holding code before the first explicit label.
pub const DEFAULT_LABEL: &str = "~start";

/// Fallback label that catches jumps to undefined labels.
pub const LABEL_ERROR: &str = "LabelError";

/// File extension for native scripts.
pub const NATIVE_EXTENSION: &str = "scr";

/// File extensions for legacy macro scripts, transpiled before scheduling.
pub const LEGACY_EXTENSIONS: &[&str] = &["cmd", "wiz"];

// ============================================================================
// Protocol
// ============================================================================

/// Text that marks a container as closed inside an `<inv>` element.
pub const CONTAINER_CLOSED_TEXT: &str = "is closed.";

/// Number of escape-and-retry attempts before the parser resets.
pub const MAX_PARSE_RETRIES: usize = 3;

/// Delay before retrying the read loop after a transient socket error.
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Consecutive transient errors tolerated before the session gives up.
pub const MAX_TRANSIENT_ERRORS: u32 = 50;

/// Maximum length of a pending (unterminated) line held for more data.
pub const MAX_PENDING_LINE_LEN: usize = 64 * 1024;
