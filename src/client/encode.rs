//! Per-dialect re-encoding of downstream lines.
//!
//! Every attached client gets its own [`Encoder`], so two clients speaking
//! different dialects see independent renderings of the same line.
//!
//! # Legacy escape codes (wizard dialect)
//!
//! Each code is `0x1C` followed by a three-letter tag and fixed-width
//! zero-padded decimal fields, on its own line:
//!
//! | Code  | Fields                                                            |
//! |-------|-------------------------------------------------------------------|
//! | `GSQ` | roundtime end (server epoch seconds)                              |
//! | `GSq` | server time from the prompt                                       |
//! | `GSV` | max mana, mana, max health, health, max spirit, spirit, max stamina, stamina |
//! | `GSj` | one `0`/`1` flag per compass direction (n ne e se s sw w nw up down out)     |

use crate::state::GameState;

use super::Dialect;

const ESC: char = '\x1c';
const COMPASS_ORDER: &[&str] = &["n", "ne", "e", "se", "s", "sw", "w", "nw", "up", "down", "out"];

/// Stateful encoder for one client.
#[derive(Debug, Clone)]
pub struct Encoder {
    dialect: Dialect,
    last_vitals: Option<[i32; 8]>,
}

impl Encoder {
    /// Create an encoder for `dialect`.
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            last_vitals: None,
        }
    }

    /// The dialect this encoder produces.
    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Encode a downstream line. `None` means nothing to send.
    ///
    /// `raw` is the sanitized markup line, `plain` its display text and
    /// `state` the snapshot after the line was applied.
    pub fn game_line(&mut self, raw: &str, plain: &str, state: &GameState) -> Option<String> {
        match self.dialect {
            Dialect::Stormfront => Some(format!("{raw}\r\n")),
            Dialect::Plain => {
                if plain.is_empty() && !raw.is_empty() {
                    None
                } else {
                    Some(format!("{plain}\r\n"))
                }
            }
            Dialect::Wizard => self.wizard_line(raw, plain, state),
        }
    }

    /// Encode script output (echo) for this client.
    #[must_use]
    pub fn echo(&self, text: &str) -> String {
        match self.dialect {
            Dialect::Stormfront => format!("{}\r\n", escape_markup(text)),
            Dialect::Plain | Dialect::Wizard => format!("{text}\r\n"),
        }
    }

    fn wizard_line(&mut self, raw: &str, plain: &str, state: &GameState) -> Option<String> {
        let mut out = String::new();

        if raw.contains("<roundTime") {
            out.push_str(&format!("{ESC}GSQ{:010}\r\n", state.roundtime_end));
        }

        let v = &state.vitals;
        let vitals = [
            v.mana.max,
            v.mana.current,
            v.health.max,
            v.health.current,
            v.spirit.max,
            v.spirit.current,
            v.stamina.max,
            v.stamina.current,
        ];
        if raw.contains("<progressBar") && self.last_vitals != Some(vitals) {
            self.last_vitals = Some(vitals);
            out.push(ESC);
            out.push_str("GSV");
            for field in vitals {
                out.push_str(&format!("{field:010}"));
            }
            out.push_str("\r\n");
        }

        if raw.contains("</compass>") || raw.contains("<compass/>") {
            out.push(ESC);
            out.push_str("GSj");
            for dir in COMPASS_ORDER {
                let present = state.room.exits.iter().any(|e| e == dir);
                out.push(if present { '1' } else { '0' });
            }
            out.push_str("\r\n");
        }

        if raw.contains("<prompt") {
            out.push_str(&format!("{ESC}GSq{:010}", state.server_time()));
        }

        if !plain.is_empty() || raw.is_empty() {
            out.push_str(plain);
            out.push_str("\r\n");
        } else if out.ends_with(|c: char| c.is_ascii_digit()) {
            // A prompt code with no text still needs its terminator.
            out.push_str("\r\n");
        }

        (!out.is_empty()).then_some(out)
    }
}

/// Escape text for embedding in the structured-markup dialect.
#[must_use]
pub fn escape_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Vital;

    #[test]
    fn test_stormfront_passes_markup_and_escapes_echo() {
        let mut enc = Encoder::new(Dialect::Stormfront);
        let state = GameState::default();
        assert_eq!(
            enc.game_line("<pushBold/>Hi<popBold/>", "Hi", &state).as_deref(),
            Some("<pushBold/>Hi<popBold/>\r\n")
        );
        assert_eq!(enc.echo("a < b & c"), "a &lt; b &amp; c\r\n");
    }

    #[test]
    fn test_plain_drops_markup_only_lines() {
        let mut enc = Encoder::new(Dialect::Plain);
        let state = GameState::default();
        assert_eq!(enc.game_line(r#"<nav rm="1"/>"#, "", &state), None);
        assert_eq!(enc.game_line("", "", &state).as_deref(), Some("\r\n"));
        assert_eq!(enc.game_line("<b>x</b>", "x", &state).as_deref(), Some("x\r\n"));
        assert_eq!(enc.echo("a < b"), "a < b\r\n");
    }

    #[test]
    fn test_wizard_vitals_code_only_on_change() {
        let mut enc = Encoder::new(Dialect::Wizard);
        let mut state = GameState::default();
        state.vitals.mana = Vital { current: 20, max: 40 };
        state.vitals.health = Vital { current: 95, max: 100 };
        let raw = r#"<progressBar id="mana" text="mana 20/40"/>"#;
        let first = enc.game_line(raw, "", &state).unwrap();
        assert_eq!(
            first,
            "\x1cGSV00000000400000000020000000010000000000950000000000000000000000000000000000000000\r\n"
        );
        assert_eq!(enc.game_line(raw, "", &state), None);
    }

    #[test]
    fn test_wizard_roundtime_and_compass() {
        let mut enc = Encoder::new(Dialect::Wizard);
        let mut state = GameState::default();
        state.roundtime_end = 1_700_000_000;
        state.room.exits = vec!["n".into(), "out".into()];
        let out = enc
            .game_line(r#"<roundTime value="1700000000"/><compass><dir value="n"/></compass>You swing."#, "You swing.", &state)
            .unwrap();
        assert_eq!(
            out,
            "\x1cGSQ1700000000\r\n\x1cGSj10000000001\r\nYou swing.\r\n"
        );
    }
}
