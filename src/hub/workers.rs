//! Background worker threads for presentation-client connections.
//!
//! # Workers
//!
//! - [`ClientListener`] - Accepts clients for one slot and reads their input

use std::io::{BufRead, BufReader, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context as _, Result};

use crate::client::{ClientId, Dialect, SharedClients, StreamClient};
use crate::lock;

/// Callback for each line a client types.
pub type LineHandler = Arc<dyn Fn(ClientId, &str) + Send + Sync>;

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// State shared between the accept loop and per-connection readers.
struct SlotState {
    slot: ClientId,
    dialect: Dialect,
    clients: SharedClients,
    on_line: LineHandler,
    /// Incremented per accepted connection; a reader only detaches the slot
    /// if it still owns the latest generation.
    generation: AtomicU64,
    /// Socket of the current connection, shut down when replaced.
    current: Mutex<Option<TcpStream>>,
}

/// Accepts presentation clients for one slot.
///
/// A new connection replaces the previous one in the slot.
pub struct ClientListener {
    local_addr: SocketAddr,
    /// Shutdown flag shared with worker thread.
    shutdown: Arc<AtomicBool>,
    state: Arc<SlotState>,
    /// Worker thread handle.
    thread_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ClientListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientListener")
            .field("slot", &self.state.slot)
            .field("local_addr", &self.local_addr)
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ClientListener {
    /// Bind `addr` and start accepting clients for `slot`.
    pub fn bind(
        addr: &str,
        slot: ClientId,
        dialect: Dialect,
        clients: SharedClients,
        on_line: LineHandler,
    ) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("binding {slot} listener on {addr}"))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(SlotState {
            slot,
            dialect,
            clients,
            on_line,
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
        });

        let thread_handle = {
            let shutdown = Arc::clone(&shutdown);
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name(format!("listen-{slot}"))
                .spawn(move || Self::accept_loop(&listener, &state, &shutdown))
                .context("spawning listener thread")?
        };

        log::info!("[Clients] Listening for {} client on {}", slot, local_addr);
        Ok(Self {
            local_addr,
            shutdown,
            state,
            thread_handle: Some(thread_handle),
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Worker loop - runs on dedicated thread.
    fn accept_loop(listener: &TcpListener, state: &Arc<SlotState>, shutdown: &AtomicBool) {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                log::info!("[Clients] {} listener shutting down", state.slot);
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = Self::attach(state, stream) {
                        log::warn!("[Clients] Failed to attach {} client {}: {:#}", state.slot, peer, e);
                    } else {
                        log::info!("[Clients] {} client connected from {}", state.slot, peer);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    log::warn!("[Clients] Accept failed on {} listener: {}", state.slot, e);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    fn attach(state: &Arc<SlotState>, stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        let writer = stream.try_clone()?;
        let reader = stream.try_clone()?;
        let generation = state.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(old) = lock(&state.current).replace(stream) {
            let _ = old.shutdown(std::net::Shutdown::Both);
        }
        lock(&state.clients).register(Box::new(StreamClient::new(state.slot, state.dialect, writer)));

        let state = Arc::clone(state);
        thread::Builder::new()
            .name(format!("client-{}", state.slot))
            .spawn(move || Self::read_loop(&state, reader, generation))?;
        Ok(())
    }

    fn read_loop(state: &SlotState, stream: TcpStream, generation: u64) {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => (state.on_line)(state.slot, line.trim_end_matches('\r')),
                Err(e) => {
                    log::debug!("[Clients] {} client read ended: {}", state.slot, e);
                    break;
                }
            }
        }
        if state.generation.load(Ordering::SeqCst) == generation {
            lock(&state.clients).unregister(state.slot);
            lock(&state.current).take();
            log::info!("[Clients] {} client disconnected", state.slot);
        }
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(stream) = lock(&self.state.current).take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Drop for ClientListener {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientRegistry;
    use std::io::{Read, Write};
    use std::sync::mpsc;
    use std::time::Instant;

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_client_lines_reach_handler_and_output_reaches_client() {
        let clients = ClientRegistry::shared();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let listener = ClientListener::bind(
            "127.0.0.1:0",
            ClientId::Primary,
            Dialect::Plain,
            Arc::clone(&clients),
            Arc::new(move |slot: ClientId, line: &str| {
                let _ = lock(&tx).send((slot, line.to_string()));
            }),
        )
        .unwrap();

        let mut conn = TcpStream::connect(listener.local_addr()).unwrap();
        conn.write_all(b"look\r\n").unwrap();
        let (slot, line) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(slot, ClientId::Primary);
        assert_eq!(line, "look");

        assert!(wait_for(|| clients.lock().unwrap().contains(ClientId::Primary)));
        clients.lock().unwrap().broadcast_echo("hello");
        let mut buf = [0u8; 7];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello\r\n");

        drop(conn);
        assert!(wait_for(|| clients.lock().unwrap().is_empty()));
    }
}
