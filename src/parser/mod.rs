//! Protocol state machine.
//!
//! Consumes sanitized markup lines, updates the game-state snapshot through
//! the sole [`StateWriter`], and returns the line's display text plus any
//! derived events (room change, mana pulse, ...).
//!
//! # Line handling
//!
//! 1. The whole line is tokenized first. If that fails, escaping repairs are
//!    applied cumulatively and tokenizing retried, up to
//!    [`MAX_PARSE_RETRIES`] times.
//! 2. When every attempt fails, the fragment is logged and both the
//!    parser-local stacks and the snapshot are reset.
//! 3. Otherwise the tokens are applied under one write lock, so readers
//!    never observe a half-applied line.
//!
//! # Regions
//!
//! `pushStream`/`popStream` markers and `component`/`compDef` elements open
//! named regions. Text in the `inv`, `room` and `familiar` streams is kept
//! out of the display text and only lands in region buffers.

pub mod repair;
pub mod tokenizer;

use std::borrow::Cow;

use chrono::Utc;

use crate::constants::{CONTAINER_CLOSED_TEXT, MAX_PARSE_RETRIES};
use crate::state::{
    parse_expiry, Collection, GameObj, GameState, Hand, Level, StateReader, StateWriter, Vital,
};
use tokenizer::{strip_markup, tokenize, Token};

/// Streams whose text never reaches the display text.
const HIDDEN_STREAMS: &[&str] = &["inv", "room", "familiar"];

/// Words recorded as an object's `before_name`.
const DETERMINERS: &[&str] = &["a", "an", "the", "some"];

/// Tunables for state inference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserSettings {
    /// Per-character bonus added to the expected mana regeneration step.
    pub mana_stat_bonus: i32,
}

/// Something the parser noticed while applying a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    /// The character moved; carries the new room counter.
    RoomChanged(u64),
    /// A mana increase matched a regeneration tick.
    ManaPulse,
    /// A dialog category was cleared ahead of a refresh.
    DialogCleared(String),
    /// A container was reported closed and forgotten.
    ContainerClosed(String),
    /// The line could not be parsed and state was reset.
    Reset,
}

/// Result of feeding one line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOutput {
    /// Display text with all markup removed.
    pub plain: String,
    /// Events in the order they occurred.
    pub events: Vec<ParserEvent>,
}

/// Markup parser bound to the snapshot's single writer.
#[derive(Debug)]
pub struct Parser {
    writer: StateWriter,
    ctx: Context,
}

impl Parser {
    /// Create a parser that owns the snapshot's writer.
    #[must_use]
    pub fn new(writer: StateWriter, settings: ParserSettings) -> Self {
        Self {
            writer,
            ctx: Context::new(settings),
        }
    }

    /// A read-only handle to the snapshot this parser maintains.
    #[must_use]
    pub fn reader(&self) -> StateReader {
        self.writer.reader()
    }

    /// Parse one sanitized line.
    pub fn feed(&mut self, line: &str) -> ParseOutput {
        let mut last_error = None;
        for attempt in 0..=MAX_PARSE_RETRIES {
            let candidate: Cow<'_, str> = if attempt == 0 {
                Cow::Borrowed(line)
            } else {
                Cow::Owned(repair::repair(line, attempt))
            };
            match tokenize(&candidate) {
                Ok(tokens) => {
                    if attempt > 0 {
                        log::debug!("[Parser] Line recovered after {} repair pass(es)", attempt);
                    }
                    let mut state = self.writer.write();
                    return self.ctx.apply(&mut state, tokens);
                }
                Err(e) => last_error = Some(e),
            }
        }

        log::warn!(
            "[Parser] Giving up on line after {} repairs ({}): {:?}",
            MAX_PARSE_RETRIES,
            last_error.map(|e| e.to_string()).unwrap_or_default(),
            line
        );
        self.reset();
        ParseOutput {
            plain: strip_markup(line),
            events: vec![ParserEvent::Reset],
        }
    }

    /// Drop all parser-local stacks and reset the snapshot.
    ///
    /// The room counter survives the reset, and so does the knowledge of
    /// which signal this server uses for room changes.
    pub fn reset(&mut self) {
        let room_region_seen = self.ctx.room_region_seen;
        self.ctx = Context::new(self.ctx.settings);
        self.ctx.room_region_seen = room_region_seen;
        self.writer.write().reset();
    }
}

// ============================================================================
// Parse context
// ============================================================================

#[derive(Debug)]
struct OpenTag {
    name: String,
    id: Option<String>,
}

#[derive(Debug)]
struct LinkCapture {
    exist: String,
    noun: String,
    text: String,
    bold: bool,
}

#[derive(Debug)]
struct HandCapture {
    hand: Hand,
    exist: String,
    noun: String,
    text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StyleKind {
    RoomName,
    RoomDesc,
}

#[derive(Debug)]
struct InvCapture {
    container: String,
    text: String,
}

#[derive(Debug)]
enum Segment {
    Text(String),
    Obj { obj: GameObj, bold: bool },
}

/// Text and links collected inside a component or the inventory stream.
#[derive(Debug)]
struct ObjectCapture {
    id: String,
    familiar: bool,
    segments: Vec<Segment>,
}

impl ObjectCapture {
    fn new(id: &str, familiar: bool) -> Self {
        Self {
            id: id.to_string(),
            familiar,
            segments: Vec::new(),
        }
    }

    fn push_text(&mut self, text: &str) {
        if let Some(Segment::Text(s)) = self.segments.last_mut() {
            s.push_str(text);
        } else {
            self.segments.push(Segment::Text(text.to_string()));
        }
    }

    fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Text(t) => t.as_str(),
                Segment::Obj { obj, .. } => obj.name.as_str(),
            })
            .collect()
    }

    /// Objects with `before_name`/`after_name` filled from adjacent text.
    fn into_objects(self) -> Vec<(GameObj, bool)> {
        let mut out = Vec::new();
        for i in 0..self.segments.len() {
            let Segment::Obj { obj, bold } = &self.segments[i] else {
                continue;
            };
            let mut obj = obj.clone();
            if let Some(Segment::Text(prev)) = i.checked_sub(1).map(|p| &self.segments[p]) {
                obj.before_name = before_word(prev);
            }
            if let Some(Segment::Text(next)) = self.segments.get(i + 1) {
                obj.after_name = after_text(next);
            }
            out.push((obj, *bold));
        }
        out
    }
}

fn before_word(text: &str) -> Option<String> {
    let trimmed = text.trim_end();
    let word = trimmed.rsplit(char::is_whitespace).next()?;
    DETERMINERS
        .iter()
        .any(|d| word.eq_ignore_ascii_case(d))
        .then(|| word.to_string())
}

fn after_text(text: &str) -> Option<String> {
    let end = [",", " and ", "."]
        .iter()
        .filter_map(|d| text.find(d))
        .min()
        .unwrap_or(text.len());
    let s = text[..end].trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn status_from_after(after: &str) -> Option<String> {
    let s = after.trim();
    if let Some(inner) = s.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        return Some(inner.trim().to_string());
    }
    s.strip_prefix("that appears ")
        .or_else(|| s.strip_prefix("that is "))
        .map(|rest| rest.trim().to_string())
}

/// Integers appearing in a progress bar's text ("mana 20/40" -> [20, 40]).
fn numbers_in(text: &str) -> Vec<i32> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '-'))
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn bracketed_title(subtitle: &str) -> Option<String> {
    let start = subtitle.find('[')?;
    let end = subtitle[start..].find(']')? + start;
    Some(subtitle[start + 1..end].to_string())
}

/// Parser-local state. Rebuilt on reset, keeping only `room_region_seen`.
#[derive(Debug)]
struct Context {
    settings: ParserSettings,
    tags: Vec<OpenTag>,
    streams: Vec<String>,
    bold: bool,
    room_region_seen: bool,
    mana_seen: bool,
    link: Option<LinkCapture>,
    hand: Option<HandCapture>,
    spell: Option<String>,
    style: Option<(StyleKind, String)>,
    inv: Option<InvCapture>,
    compass: Option<Vec<String>>,
    component: Option<ObjectCapture>,
    inventory: Option<ObjectCapture>,
}

impl Context {
    fn new(settings: ParserSettings) -> Self {
        Self {
            settings,
            tags: Vec::new(),
            streams: Vec::new(),
            bold: false,
            room_region_seen: false,
            mana_seen: false,
            link: None,
            hand: None,
            spell: None,
            style: None,
            inv: None,
            compass: None,
            component: None,
            inventory: None,
        }
    }

    fn in_stream(&self, id: &str) -> bool {
        self.streams.iter().any(|s| s == id)
    }

    fn hidden(&self) -> bool {
        self.streams.iter().any(|s| HIDDEN_STREAMS.contains(&s.as_str()))
    }

    fn apply(&mut self, state: &mut GameState, tokens: Vec<Token>) -> ParseOutput {
        let mut out = ParseOutput::default();
        for token in tokens {
            match token {
                Token::Text(text) => self.text(state, &text, &mut out),
                Token::Start {
                    name,
                    attrs,
                    self_closing,
                } => {
                    let attr = |key: &str| -> String {
                        attrs
                            .iter()
                            .find(|(k, _)| k == key)
                            .map(|(_, v)| v.clone())
                            .unwrap_or_default()
                    };
                    self.start(state, &name, &attr, &mut out);
                    if self_closing {
                        self.end(state, &name, &mut out);
                    } else {
                        let id = attrs.iter().find(|(k, _)| k == "id").map(|(_, v)| v.clone());
                        self.tags.push(OpenTag { name, id });
                    }
                }
                Token::End { name } => self.close(state, &name, &mut out),
            }
        }
        out
    }

    /// Handle an end tag, closing any unclosed children first.
    fn close(&mut self, state: &mut GameState, name: &str, out: &mut ParseOutput) {
        let Some(pos) = self.tags.iter().rposition(|t| t.name == name) else {
            log::debug!("[Parser] Ignoring unmatched </{}>", name);
            return;
        };
        while self.tags.len() > pos {
            if let Some(tag) = self.tags.pop() {
                if tag.name != name {
                    log::debug!("[Parser] Implicitly closing <{}> at </{}>", tag.name, name);
                }
                self.end(state, &tag.name, out);
            }
        }
    }

    /// Innermost open `dialogData` category.
    fn dialog_category(&self) -> Option<&str> {
        self.tags
            .iter()
            .rev()
            .find(|t| t.name == "dialogData")
            .and_then(|t| t.id.as_deref())
    }

    fn start(
        &mut self,
        state: &mut GameState,
        name: &str,
        attr: &dyn Fn(&str) -> String,
        out: &mut ParseOutput,
    ) {
        match name {
            "pushStream" => {
                let id = attr("id");
                state.regions.insert(id.clone(), String::new());
                if id == "room" {
                    self.room_region_seen = true;
                }
                if id == "inv" {
                    self.inventory = Some(ObjectCapture::new("inv", false));
                }
                self.streams.push(id);
            }
            "popStream" => self.pop_stream(state, &attr("id"), out),
            "clearStream" => {
                state.regions.insert(attr("id"), String::new());
            }
            "component" | "compDef" => {
                let id = attr("id");
                state.regions.insert(id.clone(), String::new());
                self.component = Some(ObjectCapture::new(&id, self.in_stream("familiar")));
            }
            "pushBold" | "b" => self.bold = true,
            "popBold" => self.bold = false,
            "a" => {
                self.link = Some(LinkCapture {
                    exist: attr("exist"),
                    noun: attr("noun"),
                    text: String::new(),
                    bold: self.bold,
                });
            }
            "left" | "right" => {
                self.hand = Some(HandCapture {
                    hand: if name == "left" { Hand::Left } else { Hand::Right },
                    exist: attr("exist"),
                    noun: attr("noun"),
                    text: String::new(),
                });
            }
            "spell" => self.spell = Some(String::new()),
            "style" => {
                self.finish_style(state);
                self.style = match attr("id").as_str() {
                    "roomName" => Some((StyleKind::RoomName, String::new())),
                    "roomDesc" => Some((StyleKind::RoomDesc, String::new())),
                    _ => None,
                };
            }
            "compass" => {
                self.compass = Some(Vec::new());
                if !self.room_region_seen && !self.in_stream("familiar") {
                    state.room_count += 1;
                    out.events.push(ParserEvent::RoomChanged(state.room_count));
                }
            }
            "dir" => {
                if let Some(exits) = self.compass.as_mut() {
                    exits.push(attr("value"));
                }
            }
            "nav" => {
                if let Ok(id) = attr("rm").parse() {
                    state.room.id = Some(id);
                }
            }
            "streamWindow" => {
                let id = attr("id");
                if id == "main" || id == "room" {
                    if let Some(title) = bracketed_title(&attr("subtitle")) {
                        state.room.title = title;
                    }
                }
            }
            "dialogData" => {
                let id = attr("id");
                if attr("clear") == "t" {
                    state.dialogs.clear(&id);
                    out.events.push(ParserEvent::DialogCleared(id));
                }
            }
            "progressBar" => self.progress_bar(state, attr, out),
            "indicator" => {
                state.indicators.insert(attr("id"), attr("visible") == "y");
            }
            "roundTime" => {
                if let Ok(v) = attr("value").parse() {
                    state.roundtime_end = v;
                }
            }
            "castTime" => {
                if let Ok(v) = attr("value").parse() {
                    state.casttime_end = v;
                }
            }
            "prompt" => {
                if let Ok(server) = attr("time").parse::<i64>() {
                    state.server_time_offset = server - Utc::now().timestamp();
                }
            }
            "dropDownBox" => {
                if attr("id") == "dDBTarget" {
                    state.target_ids = attr("content_value")
                        .split(',')
                        .filter_map(|v| v.trim().strip_prefix('#'))
                        .map(str::to_string)
                        .collect();
                    let current = attr("value");
                    state.current_target =
                        (!current.is_empty() && current != "none").then_some(current);
                }
            }
            "app" => {
                let character = attr("char");
                let game = attr("game");
                if !character.is_empty() {
                    state.character = Some(character);
                }
                if !game.is_empty() {
                    state.game = Some(game);
                }
            }
            "inv" => {
                self.inv = Some(InvCapture {
                    container: attr("id"),
                    text: String::new(),
                });
            }
            "clearContainer" => state.objects.clear_container(&attr("id")),
            _ => {}
        }
    }

    fn end(&mut self, state: &mut GameState, name: &str, out: &mut ParseOutput) {
        match name {
            "a" => self.finish_link(state),
            "left" | "right" => {
                if let Some(h) = self.hand.take() {
                    let text = h.text.trim();
                    let obj = (!h.exist.is_empty() && !text.is_empty() && text != "Empty")
                        .then(|| GameObj::new(h.exist, h.noun, text));
                    state.objects.set_hand(h.hand, obj);
                }
            }
            "spell" => {
                if let Some(text) = self.spell.take() {
                    let text = text.trim();
                    state.prepared_spell =
                        (!text.is_empty() && text != "None").then(|| text.to_string());
                }
            }
            "compass" => {
                if let Some(exits) = self.compass.take() {
                    if self.in_stream("familiar") {
                        state.familiar_room.exits = exits;
                    } else {
                        state.room.exits = exits;
                    }
                }
            }
            "component" | "compDef" => self.finish_component(state),
            "inv" => {
                if let Some(inv) = self.inv.take() {
                    if inv.text.trim() == CONTAINER_CLOSED_TEXT {
                        state.objects.delete_container(&inv.container);
                        out.events.push(ParserEvent::ContainerClosed(inv.container));
                    }
                }
            }
            "b" => self.bold = false,
            _ => {}
        }
    }

    fn pop_stream(&mut self, state: &mut GameState, id: &str, out: &mut ParseOutput) {
        let popped = if id.is_empty() {
            self.streams.pop()
        } else {
            self.streams
                .iter()
                .rposition(|s| s == id)
                .map(|pos| self.streams.remove(pos))
        };
        let Some(popped) = popped else {
            return;
        };
        match popped.as_str() {
            "room" => {
                state.room_count += 1;
                out.events.push(ParserEvent::RoomChanged(state.room_count));
            }
            "inv" => {
                if let Some(capture) = self.inventory.take() {
                    let objects = capture.into_objects().into_iter().map(|(o, _)| o).collect();
                    state.objects.redraw(Collection::Inventory, objects);
                }
            }
            _ => {}
        }
    }

    fn finish_style(&mut self, state: &mut GameState) {
        let Some((kind, text)) = self.style.take() else {
            return;
        };
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let room = if self.in_stream("familiar") {
            &mut state.familiar_room
        } else {
            &mut state.room
        };
        match kind {
            StyleKind::RoomName => {
                room.title = text.trim_start_matches('[').trim_end_matches(']').to_string();
            }
            StyleKind::RoomDesc => room.description = text.to_string(),
        }
    }

    fn finish_link(&mut self, state: &mut GameState) {
        let Some(link) = self.link.take() else {
            return;
        };
        if link.exist.is_empty() {
            return;
        }
        let obj = GameObj::new(link.exist, link.noun, link.text.trim());
        if let Some(inv) = &self.inv {
            if obj.id != inv.container {
                state.objects.add_to_container(&inv.container, obj);
            }
        } else if let Some(capture) = self.component.as_mut() {
            capture.segments.push(Segment::Obj {
                obj,
                bold: link.bold,
            });
        } else if let Some(capture) = self.inventory.as_mut() {
            capture.segments.push(Segment::Obj {
                obj,
                bold: link.bold,
            });
        }
    }

    fn finish_component(&mut self, state: &mut GameState) {
        let Some(capture) = self.component.take() else {
            return;
        };
        let text = capture.text();
        let id = capture.id.clone();
        state.regions.insert(id.clone(), text.clone());
        let familiar = capture.familiar;
        let room = if familiar {
            &mut state.familiar_room
        } else {
            &mut state.room
        };
        match id.as_str() {
            "room desc" => {
                room.description = text.trim().to_string();
                let objects = capture.into_objects().into_iter().map(|(o, _)| o).collect();
                let collection = if familiar {
                    Collection::FamRoomDesc
                } else {
                    Collection::RoomDesc
                };
                state.objects.redraw(collection, objects);
            }
            "room exits" => room.exits_text = text.trim().to_string(),
            "room objs" => {
                let (mut loot, mut npcs) = (Vec::new(), Vec::new());
                for (obj, bold) in capture.into_objects() {
                    if bold {
                        let status = obj.after_name.as_deref().and_then(status_from_after);
                        if status.is_some() {
                            state.objects.set_status(&obj.id, status);
                        }
                        npcs.push(obj);
                    } else {
                        loot.push(obj);
                    }
                }
                let (loot_c, npc_c) = if familiar {
                    (Collection::FamLoot, Collection::FamNpcs)
                } else {
                    (Collection::Loot, Collection::Npcs)
                };
                state.objects.redraw(loot_c, loot);
                state.objects.redraw(npc_c, npcs);
            }
            "room players" => {
                let objects = capture.into_objects().into_iter().map(|(o, _)| o).collect();
                let collection = if familiar {
                    Collection::FamPcs
                } else {
                    Collection::Pcs
                };
                state.objects.redraw(collection, objects);
            }
            _ => {}
        }
    }

    fn progress_bar(
        &mut self,
        state: &mut GameState,
        attr: &dyn Fn(&str) -> String,
        out: &mut ParseOutput,
    ) {
        let id = attr("id");
        let text = attr("text");
        let time = attr("time");

        if let Some(category) = self.dialog_category() {
            if !time.is_empty() {
                if let Some(expiry) = parse_expiry(&time, Utc::now()) {
                    state.dialogs.insert(category, &text, &id, expiry);
                } else {
                    log::debug!("[Parser] Unparseable dialog time {:?} for {}", time, id);
                }
                return;
            }
        }

        let value: i32 = attr("value").parse().unwrap_or(0);
        match id.as_str() {
            "pbarStance" => state.stance = Level { value, text },
            "mindState" => state.mind = Level { value, text },
            "encumlevel" => state.encumbrance = Level { value, text },
            _ => {
                let numbers = numbers_in(&text);
                let (Some(&current), Some(&max)) = (numbers.first(), numbers.get(1)) else {
                    return;
                };
                if id == "mana" {
                    self.infer_mana_pulse(state, current, max, out);
                }
                if let Some(vital) = state.vitals.by_name_mut(&id) {
                    *vital = Vital { current, max };
                }
            }
        }
    }

    /// Decide whether a mana change is a regeneration tick.
    fn infer_mana_pulse(
        &mut self,
        state: &mut GameState,
        current: i32,
        max: i32,
        out: &mut ParseOutput,
    ) {
        let last = state.vitals.mana.current;
        let seen = std::mem::replace(&mut self.mana_seen, true);
        if !seen || current <= last {
            return;
        }
        let bonus = self.settings.mana_stat_bonus;
        let noded = max * 25 / 100 + bonus;
        let unnoded = max * 15 / 100 + bonus;
        let gained = current - last;
        if gained == noded || gained == unnoded || (current == max && last + noded > max) {
            state.last_pulse = Some(Utc::now());
            out.events.push(ParserEvent::ManaPulse);
        }
    }

    fn text(&mut self, state: &mut GameState, text: &str, out: &mut ParseOutput) {
        if let Some((_, buf)) = self.style.as_mut() {
            buf.push_str(text);
        }
        if let Some(link) = self.link.as_mut() {
            link.text.push_str(text);
        }
        if let Some(hand) = self.hand.as_mut() {
            hand.text.push_str(text);
            return;
        }
        if let Some(spell) = self.spell.as_mut() {
            spell.push_str(text);
            return;
        }
        if let Some(inv) = self.inv.as_mut() {
            if self.link.is_none() {
                inv.text.push_str(text);
            }
            return;
        }

        if self.link.is_none() {
            if let Some(capture) = self.component.as_mut() {
                capture.push_text(text);
            } else if let Some(capture) = self.inventory.as_mut() {
                capture.push_text(text);
            }
        }
        if self.component.is_none() {
            if let Some(stream) = self.streams.last() {
                state.regions.entry(stream.clone()).or_default().push_str(text);
            }
        }

        if !self.hidden() {
            out.plain.push_str(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{shared_state, EffectLookup};

    fn parser() -> (Parser, StateReader) {
        let (writer, reader) = shared_state();
        (Parser::new(writer, ParserSettings::default()), reader)
    }

    #[test]
    fn test_plain_text_and_vitals() {
        let (mut p, reader) = parser();
        let out = p.feed(r#"<progressBar id="health" value="95" text="health 95/100"/>You feel fine."#);
        assert_eq!(out.plain, "You feel fine.");
        assert_eq!(reader.read().vitals.health, Vital { current: 95, max: 100 });
    }

    #[test]
    fn test_room_count_from_room_stream() {
        let (mut p, reader) = parser();
        p.feed(r#"<pushStream id="room"/>Town Square<popStream id="room"/>"#);
        let out = p.feed(r#"<pushStream id="room"/>Alley<popStream/>"#);
        assert_eq!(out.events, vec![ParserEvent::RoomChanged(2)]);
        assert_eq!(out.plain, "");
        // Once a room stream has been seen, compass alone no longer counts.
        p.feed(r#"<compass><dir value="n"/></compass>"#);
        assert_eq!(reader.room_count(), 2);
        assert_eq!(reader.read().room.exits, vec!["n".to_string()]);
    }

    #[test]
    fn test_room_count_from_compass() {
        let (mut p, reader) = parser();
        let out = p.feed(r#"<compass><dir value="n"/><dir value="e"/></compass>"#);
        assert_eq!(out.events, vec![ParserEvent::RoomChanged(1)]);
        p.feed(r#"<pushStream id="familiar"/><compass><dir value="s"/></compass><popStream/>"#);
        let state = reader.read();
        assert_eq!(state.room_count, 1);
        assert_eq!(state.familiar_room.exits, vec!["s".to_string()]);
        assert_eq!(state.room.exits, vec!["n".to_string(), "e".to_string()]);
    }

    #[test]
    fn test_dialog_clear_and_dual_keys() {
        let (mut p, reader) = parser();
        p.feed(r#"<dialogData id="Buffs"><progressBar id="215" value="50" text="Haste" time="0:05:00"/></dialogData>"#);
        p.feed(r#"<dialogData id="Cooldowns"><progressBar id="9605" value="10" text="Surge" time="0:01:00"/></dialogData>"#);
        let out = p.feed(r#"<dialogData id="Buffs" clear="t"></dialogData>"#);
        assert_eq!(out.events, vec![ParserEvent::DialogCleared("Buffs".into())]);
        let state = reader.read();
        assert_eq!(state.effect("Buffs", "Haste"), EffectLookup::Unknown);
        assert!(matches!(state.effect("Cooldowns", "Surge"), EffectLookup::Active(_)));
        assert!(matches!(state.effect("Cooldowns", "9605"), EffectLookup::Active(_)));
    }

    #[test]
    fn test_minivitals_progress_bars_are_vitals() {
        let (mut p, reader) = parser();
        p.feed(r#"<dialogData id="minivitals"><progressBar id="mana" value="50" text="mana 20/40"/></dialogData>"#);
        assert_eq!(reader.read().vitals.mana, Vital { current: 20, max: 40 });
    }

    #[test]
    fn test_mana_pulse_inference() {
        let (mut p, reader) = parser();
        p.feed(r#"<progressBar id="mana" value="0" text="mana 10/100"/>"#);
        // Unnoded step: 15% of 100.
        let out = p.feed(r#"<progressBar id="mana" value="0" text="mana 25/100"/>"#);
        assert_eq!(out.events, vec![ParserEvent::ManaPulse]);
        // Spending mana is never a pulse.
        let out = p.feed(r#"<progressBar id="mana" value="0" text="mana 5/100"/>"#);
        assert!(out.events.is_empty());
        // Arbitrary gain is not a pulse.
        let out = p.feed(r#"<progressBar id="mana" value="0" text="mana 8/100"/>"#);
        assert!(out.events.is_empty());
        // Capped at max with a noded step that would overshoot.
        let out = p.feed(r#"<progressBar id="mana" value="0" text="mana 90/100"/><progressBar id="mana" value="0" text="mana 100/100"/>"#);
        assert_eq!(out.events, vec![ParserEvent::ManaPulse]);
        assert!(reader.read().last_pulse.is_some());
    }

    #[test]
    fn test_room_objects_and_status() {
        let (mut p, reader) = parser();
        p.feed(concat!(
            r#"<component id="room objs">You also see a <pushBold/><a exist="11" noun="kobold">kobold</a><popBold/> that appears dead, "#,
            r#"some <a exist="12" noun="coins">silver coins</a> and a <pushBold/><a exist="13" noun="rat">rat</a><popBold/>.</component>"#
        ));
        let state = reader.read();
        let npcs = state.objects.get(Collection::Npcs);
        let loot = state.objects.get(Collection::Loot);
        assert_eq!(npcs.len(), 2);
        assert_eq!(loot.len(), 1);
        assert_eq!(loot[0].name, "silver coins");
        assert_eq!(loot[0].before_name.as_deref(), Some("some"));
        assert_eq!(npcs[0].after_name.as_deref(), Some("that appears dead"));
        assert_eq!(state.objects.status("11"), Some("dead"));
        assert_eq!(state.region("room objs"), "You also see a kobold that appears dead, some silver coins and a rat.");
    }

    #[test]
    fn test_room_desc_title_and_exits() {
        let (mut p, reader) = parser();
        p.feed(r#"<streamWindow id="main" title="Story" subtitle=" - [Town Square, Center]"/>"#);
        p.feed(r#"<component id="room desc">A <a exist="5" noun="fountain">fountain</a> bubbles.</component>"#);
        p.feed(r#"<component id="room exits">Obvious paths: north, east.</component>"#);
        p.feed(r#"<nav rm="228"/>"#);
        let state = reader.read();
        assert_eq!(state.room.title, "Town Square, Center");
        assert_eq!(state.room.description, "A fountain bubbles.");
        assert_eq!(state.room.exits_text, "Obvious paths: north, east.");
        assert_eq!(state.room.id, Some(228));
        assert_eq!(state.objects.get(Collection::RoomDesc)[0].noun, "fountain");
    }

    #[test]
    fn test_hidden_regions_stay_out_of_plain_text() {
        let (mut p, reader) = parser();
        let out = p.feed(r#"<pushStream id="inv"/>a <a exist="1" noun="pack">pack</a><popStream/>Visible"#);
        assert_eq!(out.plain, "Visible");
        assert_eq!(reader.read().objects.get(Collection::Inventory)[0].name, "pack");

        let out = p.feed(r#"<pushStream id="thoughts"/>You hear a voice.<popStream/>"#);
        assert_eq!(out.plain, "You hear a voice.");
        assert_eq!(reader.read().region("thoughts"), "You hear a voice.");
    }

    #[test]
    fn test_containers() {
        let (mut p, reader) = parser();
        p.feed(r#"<inv id="99">In the <a exist="99" noun="sack">sack</a>:</inv>"#);
        p.feed(r#"<inv id="99"> <a exist="100" noun="gem">blue gem</a></inv>"#);
        assert_eq!(reader.read().objects.container("99").unwrap().len(), 1);
        p.feed(r#"<clearContainer id="99"/>"#);
        assert_eq!(reader.read().objects.container("99").unwrap().len(), 0);
        p.feed(r#"<inv id="99"> <a exist="100" noun="gem">blue gem</a></inv>"#);
        let out = p.feed(r#"<inv id="99">is closed.</inv>"#);
        assert_eq!(out.events, vec![ParserEvent::ContainerClosed("99".into())]);
        assert!(reader.read().objects.container("99").is_none());
    }

    #[test]
    fn test_hands_spell_indicators_target() {
        let (mut p, reader) = parser();
        let out = p.feed(r#"<left exist="7" noun="shield">kite shield</left><right>Empty</right><spell>Spirit Warding I</spell>"#);
        assert_eq!(out.plain, "");
        p.feed(r#"<indicator id="IconKNEELING" visible="y"/><indicator id="IconSTUNNED" visible="n"/>"#);
        p.feed(r#"<dropDownBox id="dDBTarget" value="kobold" content_text="none,kobold" content_value="none,#321"/>"#);
        let state = reader.read();
        assert_eq!(state.objects.hand(Hand::Left).unwrap().name, "kite shield");
        assert!(state.objects.hand(Hand::Right).is_none());
        assert_eq!(state.prepared_spell.as_deref(), Some("Spirit Warding I"));
        assert!(state.indicator("IconKNEELING"));
        assert!(!state.indicator("IconSTUNNED"));
        assert_eq!(state.target_ids, vec!["321".to_string()]);
        assert_eq!(state.current_target.as_deref(), Some("kobold"));
    }

    #[test]
    fn test_roundtime_and_prompt() {
        let (mut p, reader) = parser();
        let now = Utc::now().timestamp();
        let out = p.feed(&format!(r#"<roundTime value="{}"/><prompt time="{}">&gt;</prompt>"#, now + 3, now));
        assert_eq!(out.plain, ">");
        let state = reader.read();
        assert!((2..=3).contains(&state.roundtime_left()));
    }

    #[test]
    fn test_repair_recovers_bare_ampersand() {
        let (mut p, _reader) = parser();
        let out = p.feed("Salt & pepper");
        assert_eq!(out.plain, "Salt & pepper");
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_unrecoverable_line_resets() {
        let (mut p, reader) = parser();
        p.feed(r#"<progressBar id="health" value="95" text="health 95/100"/>"#);
        p.feed(r#"<pushStream id="room"/>Hall<popStream/>"#);
        let out = p.feed(r#"Broken <tag attr="never closed"#);
        assert_eq!(out.events, vec![ParserEvent::Reset]);
        assert_eq!(out.plain, "Broken ");
        let state = reader.read();
        assert_eq!(state.vitals.health, Vital::default());
        assert_eq!(state.room_count, 1);
    }

    #[test]
    fn test_move_after_reset_counts_once() {
        let (mut p, reader) = parser();
        p.feed(r#"<pushStream id="room"/>Hall<popStream/>"#);
        p.feed(r#"Broken <tag attr="never closed"#);
        assert_eq!(reader.room_count(), 1);

        let out = p.feed(r#"<compass><dir value="n"/></compass><pushStream id="room"/>Yard<popStream/>"#);
        assert_eq!(out.events, vec![ParserEvent::RoomChanged(2)]);
        assert_eq!(reader.room_count(), 2);
    }

    #[test]
    fn test_mismatched_end_tags_are_lenient() {
        let (mut p, reader) = parser();
        let out = p.feed(r#"<left exist="1" noun="dagger">dagger</b></left> stray</a>"#);
        assert_eq!(out.plain, " stray");
        assert_eq!(reader.read().objects.hand(Hand::Left).unwrap().noun, "dagger");
    }

    #[test]
    fn test_style_room_name() {
        let (mut p, reader) = parser();
        let out = p.feed(r#"<style id="roomName"/>[Dark Alley]<style id=""/>"#);
        assert_eq!(out.plain, "[Dark Alley]");
        assert_eq!(reader.read().room.title, "Dark Alley");
    }
}
