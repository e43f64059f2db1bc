//! The single serialized write path to the game server.
//!
//! Commands from scripts and from presentation clients all pass through
//! [`Upstream::send_upstream`], which runs the upstream hook chain, writes
//! the line under one lock and echoes it to interested scripts and clients.

use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};

use crate::client::SharedClients;
use crate::distribution::echo_upstream;
use crate::hooks::HookChain;
use crate::lock;
use crate::script::{Flag, Outlet, ScriptRegistry, CLIENT_ORIGIN};

/// Serialized upstream writer plus the script echo path.
pub struct Upstream {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    hooks: Arc<HookChain>,
    clients: SharedClients,
    registry: Arc<ScriptRegistry>,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("connected", &self.is_connected())
            .field("hooks", &self.hooks.names())
            .finish_non_exhaustive()
    }
}

impl Upstream {
    /// Create a writer with no socket attached yet.
    pub fn new(hooks: Arc<HookChain>, clients: SharedClients, registry: Arc<ScriptRegistry>) -> Self {
        Self {
            writer: Mutex::new(None),
            hooks,
            clients,
            registry,
        }
    }

    /// Attach the socket (or any writer).
    pub fn attach(&self, writer: Box<dyn Write + Send>) {
        *lock(&self.writer) = Some(writer);
    }

    /// Drop the socket; later sends fail.
    pub fn detach(&self) {
        *lock(&self.writer) = None;
    }

    /// Whether a writer is attached.
    pub fn is_connected(&self) -> bool {
        lock(&self.writer).is_some()
    }

    /// The upstream hook chain.
    pub fn hooks(&self) -> &Arc<HookChain> {
        &self.hooks
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = lock(&self.writer);
        let writer = guard.as_mut().context("not connected to the game server")?;
        let result = writer
            .write_all(format!("{line}\n").as_bytes())
            .and_then(|()| writer.flush());
        if let Err(e) = result {
            *guard = None;
            return Err(e).context("write to game server failed");
        }
        Ok(())
    }
}

impl Outlet for Upstream {
    fn send_upstream(&self, line: &str, origin: &str) -> Result<()> {
        let Some(line) = self.hooks.run(line) else {
            log::debug!("[Upstream] Command from {} swallowed by hook", origin);
            return Ok(());
        };
        self.write_line(&line)?;
        log::debug!("[Upstream] {} > {}", origin, line);

        echo_upstream(&self.registry, &line, origin);
        let silent = self
            .registry
            .find(origin)
            .is_some_and(|script| script.flag(Flag::Silent));
        if origin != CLIENT_ORIGIN && !silent {
            lock(&self.clients).broadcast_echo(&format!("[{origin}]>{line}"));
        }
        Ok(())
    }

    fn echo(&self, text: &str, origin: &str) {
        lock(&self.clients).broadcast_echo(&format!("[{origin}: {text}]"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientId, ClientRegistry, Dialect, StreamClient};
    use crate::script::Script;
    use std::io;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Sink {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn upstream() -> (Upstream, Sink, Sink) {
        upstream_with(Arc::new(ScriptRegistry::new()))
    }

    fn upstream_with(registry: Arc<ScriptRegistry>) -> (Upstream, Sink, Sink) {
        let clients = ClientRegistry::shared();
        let screen = Sink::default();
        clients.lock().unwrap().register(Box::new(StreamClient::new(
            ClientId::Primary,
            Dialect::Plain,
            screen.clone(),
        )));
        let up = Upstream::new(
            Arc::new(HookChain::new("upstream")),
            clients,
            registry,
        );
        let socket = Sink::default();
        up.attach(Box::new(socket.clone()));
        (up, socket, screen)
    }

    #[test]
    fn test_script_command_is_written_and_echoed() {
        let (up, socket, screen) = upstream();
        up.send_upstream("look", "hunt").unwrap();
        up.send_upstream("north", CLIENT_ORIGIN).unwrap();
        assert_eq!(socket.text(), "look\nnorth\n");
        assert_eq!(screen.text(), "[hunt]>look\r\n");
    }

    #[test]
    fn test_silent_script_is_not_echoed() {
        let registry = Arc::new(ScriptRegistry::new());
        let program = Arc::new(crate::script::compile("").unwrap());
        let script = Arc::new(Script::new(registry.allocate_id(), "sneak", program, Vec::new(), false, 8));
        registry.insert(Arc::clone(&script));
        script.set_flag(Flag::Silent, true);

        let (up, socket, screen) = upstream_with(registry);
        up.send_upstream("hide", "sneak").unwrap();
        up.send_upstream("look", "hunt").unwrap();
        assert_eq!(socket.text(), "hide\nlook\n");
        assert_eq!(screen.text(), "[hunt]>look\r\n");
    }

    #[test]
    fn test_hooks_rewrite_and_swallow() {
        let (up, socket, _) = upstream();
        up.hooks().add("alias", Arc::new(|l: &str| Some(l.replace("n", "north"))));
        up.hooks().add("block", Arc::new(|l: &str| (l != "quit").then(|| l.to_string())));
        up.send_upstream("n", CLIENT_ORIGIN).unwrap();
        up.send_upstream("quit", CLIENT_ORIGIN).unwrap();
        assert_eq!(socket.text(), "north\n");
    }

    #[test]
    fn test_send_without_socket_fails() {
        let (up, _, screen) = upstream();
        up.detach();
        assert!(up.send_upstream("look", "hunt").is_err());
        up.echo("hello", "hunt");
        assert_eq!(screen.text(), "[hunt: hello]\r\n");
    }
}
