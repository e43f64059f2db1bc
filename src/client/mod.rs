//! Presentation clients attached to the hub.
//!
//! This module provides:
//! - `ClientId` - which client slot a connection occupies (primary/secondary)
//! - `Dialect` - the wire format a client speaks
//! - `Client` - the write side of an attached client
//! - `ClientRegistry` - attached clients with failure isolation
//!
//! # Architecture
//!
//! ```text
//! game line ──► Parser ──► ClientRegistry::broadcast_game()
//!                               ├──► primary   (Encoder: own dialect) ──► socket
//!                               └──► secondary (Encoder: own dialect) ──► socket
//! ```
//!
//! A write failure detaches only the client that failed.

mod encode;
mod registry;

use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::state::GameState;

pub use encode::{escape_markup, Encoder};
pub use registry::{ClientRegistry, SharedClients};

/// Client slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientId {
    /// The main front-end connection.
    Primary,
    /// A detachable second viewer.
    Secondary,
}

impl ClientId {
    /// Check if this is the primary client.
    pub fn is_primary(&self) -> bool {
        matches!(self, ClientId::Primary)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientId::Primary => write!(f, "primary"),
            ClientId::Secondary => write!(f, "secondary"),
        }
    }
}

/// Wire format spoken by a presentation client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Legacy line-oriented escape codes.
    Wizard,
    /// Structured markup, close to the raw stream.
    #[default]
    Stormfront,
    /// Text only, markup stripped.
    Plain,
}

impl std::str::FromStr for Dialect {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wizard" => Ok(Dialect::Wizard),
            "stormfront" => Ok(Dialect::Stormfront),
            "plain" => Ok(Dialect::Plain),
            other => anyhow::bail!("unknown dialect '{}'", other),
        }
    }
}

/// Write side of an attached presentation client.
pub trait Client: Send {
    /// Slot this client occupies.
    fn id(&self) -> ClientId;

    /// Dialect the client speaks.
    fn dialect(&self) -> Dialect;

    /// Send a downstream line (already applied to `state`).
    fn send_game(&mut self, raw: &str, plain: &str, state: &GameState) -> io::Result<()>;

    /// Send script output.
    fn send_echo(&mut self, text: &str) -> io::Result<()>;
}

/// A client backed by any byte sink (TCP stream, pipe, buffer).
pub struct StreamClient<W: Write + Send> {
    id: ClientId,
    encoder: Encoder,
    writer: W,
}

impl<W: Write + Send> std::fmt::Debug for StreamClient<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("id", &self.id)
            .field("dialect", &self.encoder.dialect())
            .finish_non_exhaustive()
    }
}

impl<W: Write + Send> StreamClient<W> {
    /// Wrap a writer.
    pub fn new(id: ClientId, dialect: Dialect, writer: W) -> Self {
        Self {
            id,
            encoder: Encoder::new(dialect),
            writer,
        }
    }

    /// Consume the client, returning its writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Client for StreamClient<W> {
    fn id(&self) -> ClientId {
        self.id
    }

    fn dialect(&self) -> Dialect {
        self.encoder.dialect()
    }

    fn send_game(&mut self, raw: &str, plain: &str, state: &GameState) -> io::Result<()> {
        if let Some(bytes) = self.encoder.game_line(raw, plain, state) {
            self.writer.write_all(bytes.as_bytes())?;
            self.writer.flush()?;
        }
        Ok(())
    }

    fn send_echo(&mut self, text: &str) -> io::Result<()> {
        let bytes = self.encoder.echo(text);
        self.writer.write_all(bytes.as_bytes())?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_display() {
        assert_eq!(ClientId::Primary.to_string(), "primary");
        assert_eq!(ClientId::Secondary.to_string(), "secondary");
        assert!(ClientId::Primary.is_primary());
    }

    #[test]
    fn test_dialect_parse() {
        assert_eq!("Wizard".parse::<Dialect>().unwrap(), Dialect::Wizard);
        assert_eq!("plain".parse::<Dialect>().unwrap(), Dialect::Plain);
        assert!("genie".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_stream_client_writes_encoded_lines() {
        let mut client = StreamClient::new(ClientId::Primary, Dialect::Plain, Vec::new());
        let state = GameState::default();
        client.send_game("<b>Hello</b>", "Hello", &state).unwrap();
        client.send_game("<nav/>", "", &state).unwrap();
        client.send_echo("[script: hi]").unwrap();
        assert_eq!(
            String::from_utf8(client.into_inner()).unwrap(),
            "Hello\r\n[script: hi]\r\n"
        );
    }
}
