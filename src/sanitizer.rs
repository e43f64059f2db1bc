//! Heuristic repair of the raw downstream stream.
//!
//! The game server emits markup that is frequently malformed: region markers
//! are duplicated, enter-markers are left dangling, tags are split across
//! network reads and the combat region is opened without ever being closed.
//! [`Sanitizer`] applies an ordered set of textual rewrites to one line at a
//! time before the structured parser sees it.
//!
//! # Rules (in order)
//!
//! 1. **Collapse duplicates** - adjacent identical `<pushStream id=X/>` (or
//!    `<popStream id=X/>`) markers collapse into one.
//! 2. **Strip orphan enters** - a `<pushStream id=X/>` immediately followed by
//!    an unrelated structural marker is dropped; the server never closes it.
//! 3. **Heal truncated tags** - known truncated prefixes at the end of a line
//!    are rewritten to well-formed closed tags.
//! 4. **Balance combat** - a signed counter of open combat regions is carried
//!    across lines; while positive, a close-marker is injected before each
//!    terminator marker that is not already preceded by one.
//!
//! Every rule is idempotent and independently toggleable through
//! [`SanitizerConfig`]. The sanitizer never fails: input it cannot recognise
//! passes through unchanged and is logged.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Per-rule switches for the sanitizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    /// Collapse adjacent duplicate region markers.
    pub collapse_duplicates: bool,
    /// Drop enter-markers followed by an unrelated structural marker.
    pub strip_orphan_enters: bool,
    /// Rewrite known truncated tags into closed tags.
    pub heal_truncated: bool,
    /// Inject missing combat close-markers.
    pub balance_combat: bool,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            collapse_duplicates: true,
            strip_orphan_enters: true,
            heal_truncated: true,
            balance_combat: true,
        }
    }
}

static REGION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<(pushStream|popStream)\s+id=["']([^"']*)["']\s*/>"#).expect("valid regex")
});

static PUSH_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<pushStream\s+id=["']([^"']*)["']\s*/>"#).expect("valid regex")
});

/// Structural markers that can never legitimately follow an enter-marker.
const UNRELATED_AFTER_ENTER: &[&str] = &[
    "<prompt",
    "<streamWindow",
    "<clearStream",
    "<compDef",
    "<endSetup",
];

static COMBAT_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?P<open><pushStream\s+id=["']combat["']\s*/>)|(?P<close><popStream\s+id=["']combat["']\s*/>)|(?P<term><prompt\b|<nav\b|<compass\b|<streamWindow\b)"#,
    )
    .expect("valid regex")
});

/// Close-marker injected by the combat balancing rule.
pub const COMBAT_CLOSE: &str = r#"<popStream id="combat"/>"#;

struct TruncationRule {
    name: &'static str,
    pattern: Regex,
    replacement: &'static str,
}

static TRUNCATION_RULES: LazyLock<Vec<TruncationRule>> = LazyLock::new(|| {
    let rule = |name, pattern: &str, replacement| TruncationRule {
        name,
        pattern: Regex::new(pattern).expect("valid regex"),
        replacement,
    };
    vec![
        rule("popStream", r"<popStream\s*$", "<popStream/>"),
        rule(
            "popStream-id",
            r#"<popStream\s+id=["']([\w ]+)["']?\s*$"#,
            r#"<popStream id="$1"/>"#,
        ),
        rule(
            "pushStream-id",
            r#"<pushStream\s+id=["']([\w ]+)["']?\s*$"#,
            r#"<pushStream id="$1"/>"#,
        ),
        rule(
            "roundTime",
            r#"<roundTime\s+value=["'](\d+)["']?\s*$"#,
            r#"<roundTime value="$1"/>"#,
        ),
        rule(
            "castTime",
            r#"<castTime\s+value=["'](\d+)["']?\s*$"#,
            r#"<castTime value="$1"/>"#,
        ),
        rule(
            "prompt",
            r#"<prompt\s+time=["'](\d+)["']>(?:&gt;)?$"#,
            r#"<prompt time="$1">&gt;</prompt>"#,
        ),
        rule("pushBold", r"<pushBold\s*$", "<pushBold/>"),
        rule("popBold", r"<popBold\s*$", "<popBold/>"),
    ]
});

/// Stateful sanitizer carrying the combat-region counter across lines.
#[derive(Debug, Default)]
pub struct Sanitizer {
    config: SanitizerConfig,
    combat_depth: i32,
}

impl Sanitizer {
    /// Create a sanitizer with the given rule switches.
    #[must_use]
    pub fn new(config: SanitizerConfig) -> Self {
        Self {
            config,
            combat_depth: 0,
        }
    }

    /// Current signed count of open combat regions.
    #[must_use]
    pub fn combat_depth(&self) -> i32 {
        self.combat_depth
    }

    /// Forget cross-line state (used when the parser resets).
    pub fn reset(&mut self) {
        self.combat_depth = 0;
    }

    /// Apply every enabled rule to one raw line.
    pub fn sanitize(&mut self, line: &str) -> String {
        let mut out = line.to_string();

        if self.config.collapse_duplicates {
            if let Some(s) = changed(collapse_duplicate_regions(&out)) {
                log::debug!("[sanitizer] collapsed duplicate region markers");
                out = s;
            }
        }

        if self.config.strip_orphan_enters {
            if let Some(s) = changed(strip_orphan_enters(&out)) {
                log::debug!("[sanitizer] stripped orphan region enter");
                out = s;
            }
        }

        if self.config.heal_truncated {
            let (healed, repairs) = heal_truncated(&out);
            let healed = changed(healed);
            if let Some(s) = healed {
                log::warn!("[sanitizer] healed truncated tag(s) {:?} in {:?}", repairs, line);
                out = s;
            }
        }

        if self.config.balance_combat {
            let (balanced, depth) = balance_combat(&out, self.combat_depth);
            self.combat_depth = depth;
            out = balanced;
        }

        if has_unterminated_tag(&out) {
            log::debug!("[sanitizer] passing through unrecognized malformed input: {:?}", out);
        }

        out
    }
}

/// `Some` with the rewritten text if a rule changed anything.
fn changed(text: Cow<'_, str>) -> Option<String> {
    match text {
        Cow::Owned(s) => Some(s),
        Cow::Borrowed(_) => None,
    }
}

/// True if the text contains a `<` with no later `>`.
#[must_use]
pub fn has_unterminated_tag(text: &str) -> bool {
    match (text.rfind('<'), text.rfind('>')) {
        (Some(open), Some(close)) => open > close,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Collapse runs of identical, directly adjacent region markers.
pub fn collapse_duplicate_regions(line: &str) -> Cow<'_, str> {
    let mut out = String::new();
    let mut last_end = 0;
    let mut previous: Option<(usize, &str, &str)> = None;
    let mut changed = false;

    for caps in REGION_MARKER.captures_iter(line) {
        let Some(whole) = caps.get(0) else { continue };
        let kind = caps.get(1).map_or("", |m| m.as_str());
        let id = caps.get(2).map_or("", |m| m.as_str());

        let duplicate = matches!(previous, Some((end, k, i)) if end == whole.start() && k == kind && i == id);
        out.push_str(&line[last_end..whole.start()]);
        if duplicate {
            changed = true;
        } else {
            out.push_str(whole.as_str());
        }
        last_end = whole.end();
        previous = Some((whole.end(), kind, id));
    }

    if !changed {
        return Cow::Borrowed(line);
    }
    out.push_str(&line[last_end..]);
    Cow::Owned(out)
}

/// Remove enter-markers that are immediately followed by an unrelated marker.
///
/// Runs to a fixpoint so the result is stable under re-application.
pub fn strip_orphan_enters(line: &str) -> Cow<'_, str> {
    let mut current = Cow::Borrowed(line);
    loop {
        let mut out = String::with_capacity(current.len());
        let mut last_end = 0;
        let mut changed = false;
        for m in PUSH_MARKER.find_iter(&current) {
            let rest = &current[m.end()..];
            out.push_str(&current[last_end..m.start()]);
            if UNRELATED_AFTER_ENTER.iter().any(|marker| rest.starts_with(marker)) {
                changed = true;
            } else {
                out.push_str(m.as_str());
            }
            last_end = m.end();
        }
        if !changed {
            return current;
        }
        out.push_str(&current[last_end..]);
        current = Cow::Owned(out);
    }
}

/// Rewrite known truncated trailing tags.
///
/// Returns the repaired text and the names of the rules that fired.
pub fn heal_truncated(line: &str) -> (Cow<'_, str>, Vec<&'static str>) {
    let mut out = Cow::Borrowed(line);
    let mut repairs = Vec::new();
    for rule in TRUNCATION_RULES.iter() {
        if rule.pattern.is_match(&out) {
            let healed = rule.pattern.replace(&out, rule.replacement).into_owned();
            repairs.push(rule.name);
            out = Cow::Owned(healed);
        }
    }
    (out, repairs)
}

/// Inject combat close-markers before terminators while the counter is positive.
///
/// `depth` is the counter carried in from previous lines; the returned depth
/// is carried into the next one. A negative counter is reset at the next
/// terminator so stray closes cannot mask later opens.
pub fn balance_combat(line: &str, mut depth: i32) -> (String, i32) {
    let mut out = String::with_capacity(line.len());
    let mut last_end = 0;

    for caps in COMBAT_TOKENS.captures_iter(line) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&line[last_end..whole.start()]);
        if caps.name("open").is_some() {
            depth += 1;
        } else if caps.name("close").is_some() {
            depth -= 1;
        } else if depth > 0 {
            log::debug!("[sanitizer] injecting combat close before {:?}", whole.as_str());
            out.push_str(COMBAT_CLOSE);
            depth -= 1;
        } else if depth < 0 {
            depth = 0;
        }
        out.push_str(whole.as_str());
        last_end = whole.end();
    }
    out.push_str(&line[last_end..]);
    (out, depth)
}
