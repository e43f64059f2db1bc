//! Registry of attached presentation clients.
//!
//! At most one client per [`ClientId`] slot. Broadcasts write to each client
//! independently; a client whose write fails is detached and reported, and
//! the remaining clients still receive the line.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::state::GameState;

use super::{Client, ClientId};

/// Registry shared between the downstream pipeline and the upstream writer.
pub type SharedClients = Arc<Mutex<ClientRegistry>>;

/// All attached clients by slot.
pub struct ClientRegistry {
    clients: HashMap<ClientId, Box<dyn Client>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    /// Create an empty registry wrapped for sharing.
    pub fn shared() -> SharedClients {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Attach a client.
    ///
    /// If a client already occupies the slot, it is replaced and returned.
    pub fn register(&mut self, client: Box<dyn Client>) -> Option<Box<dyn Client>> {
        let id = client.id();
        log::info!("[Clients] Attached {} client ({:?})", id, client.dialect());
        self.clients.insert(id, client)
    }

    /// Detach a client. Returns the removed client if it existed.
    pub fn unregister(&mut self, id: ClientId) -> Option<Box<dyn Client>> {
        let removed = self.clients.remove(&id);
        if removed.is_some() {
            log::info!("[Clients] Detached {} client", id);
        }
        removed
    }

    /// Whether a slot is occupied.
    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Get client by ID (mutable).
    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Box<dyn Client>> {
        self.clients.get_mut(&id)
    }

    /// Get all client IDs.
    pub fn client_ids(&self) -> impl Iterator<Item = &ClientId> {
        self.clients.keys()
    }

    /// Number of attached clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Send a downstream line to every client.
    ///
    /// Returns the ids of clients detached because their write failed.
    pub fn broadcast_game(&mut self, raw: &str, plain: &str, state: &GameState) -> Vec<ClientId> {
        self.for_each_detaching(|client| client.send_game(raw, plain, state))
    }

    /// Send script output to every client.
    pub fn broadcast_echo(&mut self, text: &str) -> Vec<ClientId> {
        self.for_each_detaching(|client| client.send_echo(text))
    }

    fn for_each_detaching<F>(&mut self, mut send: F) -> Vec<ClientId>
    where
        F: FnMut(&mut dyn Client) -> std::io::Result<()>,
    {
        let mut failed = Vec::new();
        for (id, client) in &mut self.clients {
            if let Err(e) = send(client.as_mut()) {
                log::warn!("[Clients] Write to {} client failed: {}", id, e);
                failed.push(*id);
            }
        }
        for id in &failed {
            self.unregister(*id);
        }
        failed
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Dialect, StreamClient};
    use std::io::{self, Write};

    /// Writer shared with the test so output can be inspected after broadcast.
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

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_each_client_gets_its_own_dialect() {
        let primary = Sink::default();
        let secondary = Sink::default();
        let mut reg = ClientRegistry::new();
        reg.register(Box::new(StreamClient::new(ClientId::Primary, Dialect::Stormfront, primary.clone())));
        reg.register(Box::new(StreamClient::new(ClientId::Secondary, Dialect::Plain, secondary.clone())));

        let failed = reg.broadcast_game("<b>Hi</b>", "Hi", &GameState::default());
        assert!(failed.is_empty());
        assert_eq!(primary.text(), "<b>Hi</b>\r\n");
        assert_eq!(secondary.text(), "Hi\r\n");
    }

    #[test]
    fn test_failed_client_is_detached_without_affecting_others() {
        let primary = Sink::default();
        let mut reg = ClientRegistry::new();
        reg.register(Box::new(StreamClient::new(ClientId::Primary, Dialect::Plain, primary.clone())));
        reg.register(Box::new(StreamClient::new(ClientId::Secondary, Dialect::Plain, Broken)));

        let failed = reg.broadcast_echo("one");
        assert_eq!(failed, vec![ClientId::Secondary]);
        assert_eq!(reg.len(), 1);

        reg.broadcast_echo("two");
        assert_eq!(primary.text(), "one\r\ntwo\r\n");
    }

    #[test]
    fn test_register_replaces_slot() {
        let mut reg = ClientRegistry::default();
        assert!(reg
            .register(Box::new(StreamClient::new(ClientId::Primary, Dialect::Plain, Vec::new())))
            .is_none());
        assert!(reg
            .register(Box::new(StreamClient::new(ClientId::Primary, Dialect::Wizard, Vec::new())))
            .is_some());
        assert!(reg.contains(ClientId::Primary));
        assert!(reg.unregister(ClientId::Primary).is_some());
        assert!(reg.is_empty());
    }
}
