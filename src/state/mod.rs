//! Game-state snapshot.
//!
//! The snapshot is a structured, continuously-updated view of the character
//! and its surroundings. It has exactly one writer: the protocol parser owns
//! the only [`StateWriter`] and mutates the snapshot while handling a line.
//! Everything else (scripts, encoders, hub commands) holds a cloneable
//! [`StateReader`] and can never obtain mutable access.

pub mod dialogs;
pub mod objects;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

pub use dialogs::{parse_expiry, Dialogs, EffectLookup};
pub use objects::{Collection, GameObj, Hand, ObjectRegistry};

/// Current/maximum pair for a vital statistic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Vital {
    /// Current value.
    pub current: i32,
    /// Maximum value.
    pub max: i32,
}

/// All tracked vitals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Vitals {
    /// Hit points.
    pub health: Vital,
    /// Mana.
    pub mana: Vital,
    /// Spirit.
    pub spirit: Vital,
    /// Stamina.
    pub stamina: Vital,
    /// Concentration.
    pub concentration: Vital,
}

impl Vitals {
    /// Look a vital up by its progress-bar id.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Vital> {
        match name {
            "health" => Some(self.health),
            "mana" => Some(self.mana),
            "spirit" => Some(self.spirit),
            "stamina" => Some(self.stamina),
            "concentration" => Some(self.concentration),
            _ => None,
        }
    }

    pub(crate) fn by_name_mut(&mut self, name: &str) -> Option<&mut Vital> {
        match name {
            "health" => Some(&mut self.health),
            "mana" => Some(&mut self.mana),
            "spirit" => Some(&mut self.spirit),
            "stamina" => Some(&mut self.stamina),
            "concentration" => Some(&mut self.concentration),
            _ => None,
        }
    }
}

/// A numeric level with its descriptive text (stance, mind, encumbrance).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Level {
    /// Numeric value (usually a percentage).
    pub value: i32,
    /// Text shown alongside it.
    pub text: String,
}

/// The room the character (or its familiar) is in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Room {
    /// Server room number, when provided.
    pub id: Option<u64>,
    /// Room title without brackets.
    pub title: String,
    /// Room description text.
    pub description: String,
    /// Exit directions from the compass.
    pub exits: Vec<String>,
    /// The "Obvious paths/exits" line, verbatim.
    pub exits_text: String,
}

/// The full snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameState {
    /// Vital statistics.
    pub vitals: Vitals,
    /// Status indicators (`IconSTUNNED`, `IconKNEELING`, ...) by id.
    pub indicators: HashMap<String, bool>,
    /// Combat stance.
    pub stance: Level,
    /// Mind (experience absorption) state.
    pub mind: Level,
    /// Encumbrance.
    pub encumbrance: Level,
    /// Current room.
    pub room: Room,
    /// Room the familiar is viewing.
    pub familiar_room: Room,
    /// Monotonic room-change counter.
    pub room_count: u64,
    /// Timed effects by category.
    pub dialogs: Dialogs,
    /// Object collections and statuses.
    pub objects: ObjectRegistry,
    /// Ids of attackable targets.
    pub target_ids: Vec<String>,
    /// Currently selected target, if any.
    pub current_target: Option<String>,
    /// Server time (epoch seconds) at which roundtime ends.
    pub roundtime_end: i64,
    /// Server time (epoch seconds) at which cast time ends.
    pub casttime_end: i64,
    /// Server clock minus local clock, in seconds.
    pub server_time_offset: i64,
    /// Prepared spell name.
    pub prepared_spell: Option<String>,
    /// Character name from the handshake.
    pub character: Option<String>,
    /// Game code from the handshake.
    pub game: Option<String>,
    /// Accumulated text per named region (stream/component).
    pub regions: HashMap<String, String>,
    /// Local time of the last inferred mana pulse.
    pub last_pulse: Option<DateTime<Utc>>,
}

impl GameState {
    /// Whether an indicator is currently lit.
    #[must_use]
    pub fn indicator(&self, id: &str) -> bool {
        self.indicators.get(id).copied().unwrap_or(false)
    }

    /// Current server time estimate in epoch seconds.
    #[must_use]
    pub fn server_time(&self) -> i64 {
        Utc::now().timestamp() + self.server_time_offset
    }

    /// Seconds of roundtime left (0 when none).
    #[must_use]
    pub fn roundtime_left(&self) -> i64 {
        (self.roundtime_end - self.server_time()).max(0)
    }

    /// Seconds of cast time left (0 when none).
    #[must_use]
    pub fn casttime_left(&self) -> i64 {
        (self.casttime_end - self.server_time()).max(0)
    }

    /// Text of one region, empty if never seen.
    #[must_use]
    pub fn region(&self, name: &str) -> &str {
        self.regions.get(name).map_or("", String::as_str)
    }

    /// Look up a timed effect in one category.
    #[must_use]
    pub fn effect(&self, category: &str, key: &str) -> EffectLookup {
        self.dialogs.lookup(category, key, Utc::now())
    }

    /// Reset after an unrecoverable parse failure.
    ///
    /// The room counter and character identity survive; scripts waiting on a
    /// room change must never see the counter move backwards.
    pub(crate) fn reset(&mut self) {
        let room_count = self.room_count;
        let character = self.character.take();
        let game = self.game.take();
        *self = Self {
            room_count,
            character,
            game,
            ..Self::default()
        };
    }

    /// Named scalar lookup used by script interpolation (`$health`, ...).
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<String> {
        let value = match name {
            "health" | "mana" | "spirit" | "stamina" | "concentration" => {
                self.vitals.by_name(name)?.current.to_string()
            }
            "maxhealth" | "maxmana" | "maxspirit" | "maxstamina" | "maxconcentration" => {
                self.vitals.by_name(&name[3..])?.max.to_string()
            }
            "room_count" => self.room_count.to_string(),
            "room_id" => self.room.id.map(|id| id.to_string()).unwrap_or_default(),
            "room_title" => self.room.title.clone(),
            "room_desc" => self.room.description.clone(),
            "room_exits" => self.room.exits.join(" "),
            "stance" => self.stance.text.clone(),
            "mind" => self.mind.text.clone(),
            "encumbrance" => self.encumbrance.text.clone(),
            "roundtime" => self.roundtime_left().to_string(),
            "casttime" => self.casttime_left().to_string(),
            "spell" => self.prepared_spell.clone().unwrap_or_default(),
            "target" => self.current_target.clone().unwrap_or_default(),
            "lefthand" => self
                .objects
                .hand(Hand::Left)
                .map(|o| o.name.clone())
                .unwrap_or_default(),
            "righthand" => self
                .objects
                .hand(Hand::Right)
                .map(|o| o.name.clone())
                .unwrap_or_default(),
            "character" => self.character.clone().unwrap_or_default(),
            "game" => self.game.clone().unwrap_or_default(),
            _ => return None,
        };
        Some(value)
    }
}

/// The single mutable handle to the snapshot. Deliberately not `Clone`.
#[derive(Debug)]
pub struct StateWriter {
    inner: Arc<RwLock<GameState>>,
}

/// Read-only handle to the snapshot.
#[derive(Debug, Clone)]
pub struct StateReader {
    inner: Arc<RwLock<GameState>>,
}

/// Create a fresh snapshot with its unique writer and a first reader.
#[must_use]
pub fn shared_state() -> (StateWriter, StateReader) {
    let inner = Arc::new(RwLock::new(GameState::default()));
    (
        StateWriter {
            inner: Arc::clone(&inner),
        },
        StateReader { inner },
    )
}

impl StateWriter {
    /// Exclusive access for the duration of one line's updates.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, GameState> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Another read-only handle.
    #[must_use]
    pub fn reader(&self) -> StateReader {
        StateReader {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl StateReader {
    /// Shared access to the snapshot.
    pub fn read(&self) -> RwLockReadGuard<'_, GameState> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run a closure against the snapshot.
    pub fn with<R>(&self, f: impl FnOnce(&GameState) -> R) -> R {
        f(&self.read())
    }

    /// Current room-change counter.
    #[must_use]
    pub fn room_count(&self) -> u64 {
        self.read().room_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_updates_visible_to_readers() {
        let (writer, reader) = shared_state();
        let other = writer.reader();
        writer.write().vitals.health = Vital { current: 80, max: 100 };
        assert_eq!(reader.read().vitals.health.current, 80);
        assert_eq!(other.with(|s| s.vitals.health.max), 100);
    }

    #[test]
    fn test_reset_keeps_room_count_and_identity() {
        let (writer, reader) = shared_state();
        {
            let mut state = writer.write();
            state.room_count = 12;
            state.character = Some("Tester".into());
            state.room.title = "Town Square".into();
            state.indicators.insert("IconSTUNNED".into(), true);
            state.reset();
        }
        let state = reader.read();
        assert_eq!(state.room_count, 12);
        assert_eq!(state.character.as_deref(), Some("Tester"));
        assert!(state.room.title.is_empty());
        assert!(!state.indicator("IconSTUNNED"));
    }

    #[test]
    fn test_variables() {
        let mut state = GameState::default();
        state.vitals.mana = Vital { current: 5, max: 40 };
        state.room_count = 3;
        assert_eq!(state.variable("mana").as_deref(), Some("5"));
        assert_eq!(state.variable("maxmana").as_deref(), Some("40"));
        assert_eq!(state.variable("room_count").as_deref(), Some("3"));
        assert_eq!(state.variable("nonsense"), None);
    }

    #[test]
    fn test_roundtime_left_never_negative() {
        let state = GameState {
            roundtime_end: 0,
            ..GameState::default()
        };
        assert_eq!(state.roundtime_left(), 0);
    }
}
