//! Session transport: the game socket and the per-line pipeline.
//!
//! # Architecture
//!
//! ```text
//! socket ──► read loop ──► LineAssembler ──┐
//!                                          ├──► Pipeline::process_line
//! inject channel ──► inject pump ──────────┘        │
//!                                                   ├─ Sanitizer
//!                                                   ├─ Parser (sole state writer)
//!                                                   ├─ Distributor ──► script mailboxes
//!                                                   ├─ downstream hooks
//!                                                   └─ ClientRegistry::broadcast_game
//! ```
//!
//! Both entry points share the pipeline behind one lock, so the parser keeps
//! exclusive ownership of the snapshot writer.

pub mod line_reader;
pub mod upstream;

use std::io::{ErrorKind, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context as _, Result};

use crate::client::SharedClients;
use crate::constants::{MAX_TRANSIENT_ERRORS, TRANSIENT_RETRY_DELAY};
use crate::distribution::Distributor;
use crate::hooks::HookChain;
use crate::lock;
use crate::parser::tokenizer::strip_markup;
use crate::parser::{ParseOutput, Parser, ParserEvent};
use crate::sanitizer::Sanitizer;
use crate::script::Outlet;
use crate::state::StateReader;

pub use line_reader::LineAssembler;
pub use upstream::Upstream;

/// Bytes requested per socket read.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How often the inject pump re-checks the closed flag.
const INJECT_POLL: Duration = Duration::from_millis(100);

/// Origin used for session-level diagnostics.
const SESSION_ORIGIN: &str = "session";

/// How a socket error affects the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Log, pause briefly and retry.
    Transient,
    /// Stop the read loop and close the session.
    Fatal,
}

/// Classify a socket error kind. Unknown kinds are fatal.
#[must_use]
pub fn classify_io_error(kind: ErrorKind) -> ErrorClass {
    match kind {
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => {
            ErrorClass::Transient
        }
        _ => ErrorClass::Fatal,
    }
}

/// Everything that happens to one downstream line.
pub struct Pipeline {
    sanitizer: Sanitizer,
    parser: Parser,
    state: StateReader,
    hooks: Arc<HookChain>,
    clients: SharedClients,
    distributor: Distributor,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("combat_depth", &self.sanitizer.combat_depth())
            .field("hooks", &self.hooks.names())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Assemble a pipeline. The parser brings the snapshot writer.
    pub fn new(
        sanitizer: Sanitizer,
        parser: Parser,
        hooks: Arc<HookChain>,
        clients: SharedClients,
        distributor: Distributor,
    ) -> Self {
        let state = parser.reader();
        Self {
            sanitizer,
            parser,
            state,
            hooks,
            clients,
            distributor,
        }
    }

    /// Read handle on the snapshot.
    pub fn state(&self) -> &StateReader {
        &self.state
    }

    /// Run one raw line through sanitize, parse, distribute, hooks and
    /// client re-encoding.
    pub fn process_line(&mut self, line: &str) -> ParseOutput {
        let clean = self.sanitizer.sanitize(line);
        let out = self.parser.feed(&clean);
        if out.events.contains(&ParserEvent::Reset) {
            self.sanitizer.reset();
        }

        let plain = (!out.plain.is_empty()).then_some(out.plain.as_str());
        self.distributor.distribute(plain, &clean);

        let Some(shown) = self.hooks.run(&clean) else {
            log::debug!("[Session] Line gagged by downstream hook");
            return out;
        };
        let shown_plain = if shown == clean {
            out.plain.clone()
        } else {
            strip_markup(&shown)
        };

        let state = self.state.read();
        let failed = lock(&self.clients).broadcast_game(&shown, &shown_plain, &state);
        for id in failed {
            log::warn!("[Session] Detached {} client after write failure", id);
        }
        out
    }
}

/// A live connection to the game server.
pub struct Session {
    stream: TcpStream,
    pipeline: Arc<Mutex<Pipeline>>,
    upstream: Arc<Upstream>,
    closed: Arc<AtomicBool>,
    inject_tx: Sender<String>,
    threads: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.stream.peer_addr().ok())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect to `addr` and start the read loop.
    pub fn connect(addr: &str, pipeline: Pipeline, upstream: Arc<Upstream>) -> Result<Self> {
        let stream =
            TcpStream::connect(addr).with_context(|| format!("connecting to game server {addr}"))?;
        log::info!("[Session] Connected to {}", addr);
        Self::from_stream(stream, pipeline, upstream)
    }

    /// Run a session over an established stream.
    pub fn from_stream(
        stream: TcpStream,
        pipeline: Pipeline,
        upstream: Arc<Upstream>,
    ) -> Result<Self> {
        let _ = stream.set_nodelay(true);
        upstream.attach(Box::new(stream.try_clone().context("cloning socket for writes")?));
        let reader = stream.try_clone().context("cloning socket for reads")?;

        let pipeline = Arc::new(Mutex::new(pipeline));
        let closed = Arc::new(AtomicBool::new(false));
        let (inject_tx, inject_rx) = mpsc::channel::<String>();

        let read_thread = {
            let pipeline = Arc::clone(&pipeline);
            let upstream = Arc::clone(&upstream);
            let closed = Arc::clone(&closed);
            thread::Builder::new()
                .name("session-read".into())
                .spawn(move || {
                    read_loop(reader, &pipeline, &closed);
                    closed.store(true, Ordering::SeqCst);
                    upstream.detach();
                    upstream.echo("connection closed", SESSION_ORIGIN);
                })
                .context("spawning session read thread")?
        };

        let inject_thread = {
            let pipeline = Arc::clone(&pipeline);
            let closed = Arc::clone(&closed);
            thread::Builder::new()
                .name("session-inject".into())
                .spawn(move || loop {
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    match inject_rx.recv_timeout(INJECT_POLL) {
                        Ok(line) => {
                            lock(&pipeline).process_line(&line);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                })
                .context("spawning session inject thread")?
        };

        Ok(Self {
            stream,
            pipeline,
            upstream,
            closed,
            inject_tx,
            threads: vec![read_thread, inject_thread],
        })
    }

    /// Sender that feeds synthetic downstream lines into the pipeline.
    pub fn injector(&self) -> Sender<String> {
        self.inject_tx.clone()
    }

    /// Feed a synthetic downstream line into the pipeline.
    pub fn inject(&self, line: &str) -> Result<()> {
        self.inject_tx
            .send(line.to_string())
            .context("session inject pump has stopped")
    }

    /// The upstream writer.
    pub fn upstream(&self) -> &Arc<Upstream> {
        &self.upstream
    }

    /// Read handle on the snapshot.
    pub fn state(&self) -> StateReader {
        lock(&self.pipeline).state().clone()
    }

    /// Whether the read loop has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the socket and stop both threads.
    pub fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::info!("[Session] Closing");
        }
        self.upstream.detach();
        let _ = self.stream.shutdown(Shutdown::Both);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::warn!("[Session] Session thread panicked");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read until EOF, a fatal error, or too many transient errors in a row.
fn read_loop<R: Read>(mut reader: R, pipeline: &Mutex<Pipeline>, closed: &AtomicBool) {
    let mut assembler = LineAssembler::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut transient = 0u32;

    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        match reader.read(&mut buf) {
            Ok(0) => {
                log::info!("[Session] Game server closed the connection");
                break;
            }
            Ok(n) => {
                transient = 0;
                for line in assembler.feed(&buf[..n]) {
                    lock(pipeline).process_line(&line);
                }
            }
            Err(e) => match classify_io_error(e.kind()) {
                ErrorClass::Transient => {
                    transient += 1;
                    if transient > MAX_TRANSIENT_ERRORS {
                        log::error!("[Session] Giving up after {} transient errors: {}", transient, e);
                        break;
                    }
                    log::warn!("[Session] Transient read error ({}), retrying: {}", transient, e);
                    thread::sleep(TRANSIENT_RETRY_DELAY);
                }
                ErrorClass::Fatal => {
                    if !closed.load(Ordering::SeqCst) {
                        log::error!("[Session] Read failed: {}", e);
                    }
                    break;
                }
            },
        }
    }

    if let Some(rest) = assembler.flush() {
        lock(pipeline).process_line(&rest);
    }
}
