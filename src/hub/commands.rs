//! Hub commands typed by presentation clients.
//!
//! A client line starting with `;` is a hub command; anything else is a game
//! command and goes upstream.
//!
//! # Command Types
//!
//! - [`HubCommand::Start`] - `;start NAME [ARGS]`
//! - [`HubCommand::Kill`] - `;kill NAME`
//! - [`HubCommand::Pause`] / [`HubCommand::Unpause`] - `;pause NAME`, `;unpause NAME`
//! - [`HubCommand::List`] - `;list [all]`
//! - [`HubCommand::Trust`] / [`HubCommand::Distrust`] - `;trust NAME`, `;distrust NAME`
//! - [`HubCommand::Send`] - `;send NAME TEXT` (script's unique buffer)
//!
//! Trust changes apply to scripts started afterwards.

use anyhow::{bail, Result};

use crate::script::{Outlet, Runtime, StartOptions, CLIENT_ORIGIN};

/// Origin tag for hub replies.
pub const HUB_ORIGIN: &str = "hub";

/// A parsed `;` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubCommand {
    /// Start a script.
    Start {
        /// Script name.
        name: String,
        /// Positional arguments.
        args: Vec<String>,
    },
    /// Kill a script.
    Kill(String),
    /// Pause a script.
    Pause(String),
    /// Resume a paused script.
    Unpause(String),
    /// List running scripts.
    List {
        /// Include hidden scripts.
        all: bool,
    },
    /// Allow a script restricted operations.
    Trust(String),
    /// Revoke trust.
    Distrust(String),
    /// Push a line to a script's unique buffer.
    Send {
        /// Script name.
        name: String,
        /// Line to deliver.
        text: String,
    },
}

impl HubCommand {
    /// Parse a client line. `Ok(None)` means it is not a hub command.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let Some(body) = line.trim().strip_prefix(';') else {
            return Ok(None);
        };
        let mut words = body.split_whitespace();
        let Some(verb) = words.next() else {
            bail!("empty command");
        };
        let name = words.next().map(str::to_string);
        let need_name = |cmd: &str| match &name {
            Some(n) => Ok(n.clone()),
            None => Err(anyhow::anyhow!("usage: ;{} NAME", cmd)),
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "start" => HubCommand::Start {
                name: need_name("start")?,
                args: words.map(str::to_string).collect(),
            },
            "kill" => HubCommand::Kill(need_name("kill")?),
            "pause" => HubCommand::Pause(need_name("pause")?),
            "unpause" => HubCommand::Unpause(need_name("unpause")?),
            "list" => HubCommand::List {
                all: name.as_deref().is_some_and(|w| w.eq_ignore_ascii_case("all")),
            },
            "trust" => HubCommand::Trust(need_name("trust")?),
            "distrust" => HubCommand::Distrust(need_name("distrust")?),
            "send" => {
                let name = need_name("send")?;
                let text = words.collect::<Vec<_>>().join(" ");
                if text.is_empty() {
                    bail!("usage: ;send NAME TEXT");
                }
                HubCommand::Send { name, text }
            }
            other => bail!("unknown command ';{}'", other),
        };
        Ok(Some(command))
    }

    /// Run the command and return reply lines for the client.
    pub fn execute(&self, rt: &Runtime) -> Vec<String> {
        match self {
            HubCommand::Start { name, args } => {
                match rt.start(name, args.clone(), StartOptions::default()) {
                    Ok(_) => Vec::new(),
                    Err(e) => vec![format!("cannot start {name}: {e}")],
                }
            }
            HubCommand::Kill(name) => not_found_unless(rt.kill(name), name),
            HubCommand::Pause(name) => not_found_unless(rt.pause(name), name),
            HubCommand::Unpause(name) => not_found_unless(rt.unpause(name), name),
            HubCommand::List { all } => {
                let scripts = rt.list(*all);
                if scripts.is_empty() {
                    return vec!["no scripts running".to_string()];
                }
                scripts
                    .into_iter()
                    .map(|s| {
                        let mut row = format!("{} (#{})", s.name, s.id);
                        if s.paused {
                            row.push_str(" paused");
                        }
                        if s.hidden {
                            row.push_str(" hidden");
                        }
                        if s.trusted {
                            row.push_str(" trusted");
                        }
                        row
                    })
                    .collect()
            }
            HubCommand::Trust(name) => match rt.trust().trust(name) {
                Ok(()) => vec![format!("{name} is now trusted")],
                Err(e) => vec![format!("cannot trust {name}: {e:#}")],
            },
            HubCommand::Distrust(name) => match rt.trust().distrust(name) {
                Ok(()) => vec![format!("{name} is no longer trusted")],
                Err(e) => vec![format!("cannot distrust {name}: {e:#}")],
            },
            HubCommand::Send { name, text } => not_found_unless(rt.send_unique(name, text), name),
        }
    }
}

fn not_found_unless(found: bool, name: &str) -> Vec<String> {
    if found {
        Vec::new()
    } else {
        vec![format!("no script named {name}")]
    }
}

/// Handle one line typed by a presentation client.
pub fn dispatch_client_line(rt: &Runtime, outlet: &dyn Outlet, line: &str) {
    match HubCommand::parse(line) {
        Ok(Some(command)) => {
            log::info!("[Hub] Command {:?}", command);
            for reply in command.execute(rt) {
                outlet.echo(&reply, HUB_ORIGIN);
            }
        }
        Ok(None) => {
            if let Err(e) = outlet.send_upstream(line, CLIENT_ORIGIN) {
                log::warn!("[Hub] Dropped client command: {:#}", e);
                outlet.echo(&format!("not sent: {e:#}"), HUB_ORIGIN);
            }
        }
        Err(e) => outlet.echo(&e.to_string(), HUB_ORIGIN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(HubCommand::parse("look").unwrap(), None);
        assert_eq!(
            HubCommand::parse(";start hunt kobold 3").unwrap(),
            Some(HubCommand::Start {
                name: "hunt".into(),
                args: vec!["kobold".into(), "3".into()]
            })
        );
        assert_eq!(HubCommand::parse(";KILL hunt").unwrap(), Some(HubCommand::Kill("hunt".into())));
        assert_eq!(HubCommand::parse(";list").unwrap(), Some(HubCommand::List { all: false }));
        assert_eq!(HubCommand::parse(";list all").unwrap(), Some(HubCommand::List { all: true }));
        assert_eq!(
            HubCommand::parse(";send hunt go  north").unwrap(),
            Some(HubCommand::Send { name: "hunt".into(), text: "go north".into() })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(HubCommand::parse(";").is_err());
        assert!(HubCommand::parse(";kill").is_err());
        assert!(HubCommand::parse(";send hunt").is_err());
        assert!(HubCommand::parse(";frob x").is_err());
    }
}
