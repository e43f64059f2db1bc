//! Timed effects ("dialogs") keyed by category.
//!
//! Each category (Buffs, Debuffs, Cooldowns, Active Spells, ...) maps an
//! effect's display name *and* its numeric id to an absolute expiry time.
//! Categories are refreshed by replacement: the server clears a category and
//! then resends every entry, so [`Dialogs::clear`] only ever touches the one
//! category it names.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// Days added to "now" for effects reported as `indefinite`.
const INDEFINITE_DAYS: i64 = 36_500;

/// Result of looking up an effect by name or id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectLookup {
    /// The effect is present and expires after the given duration.
    Active(Duration),
    /// The effect is present but its expiry has passed.
    Expired,
    /// No such category or key.
    Unknown,
}

/// Category -> (name or id -> expiry) tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dialogs {
    categories: HashMap<String, HashMap<String, DateTime<Utc>>>,
}

impl Dialogs {
    /// Empty exactly one category's table.
    pub(crate) fn clear(&mut self, category: &str) {
        if let Some(table) = self.categories.get_mut(category) {
            table.clear();
        }
    }

    /// Record an effect under both its display name and its id.
    pub(crate) fn insert(&mut self, category: &str, name: &str, id: &str, expiry: DateTime<Utc>) {
        let table = self.categories.entry(category.to_string()).or_default();
        if !name.is_empty() {
            table.insert(name.to_string(), expiry);
        }
        if !id.is_empty() {
            table.insert(id.to_string(), expiry);
        }
    }

    /// The table for one category, if the server ever sent it.
    #[must_use]
    pub fn category(&self, category: &str) -> Option<&HashMap<String, DateTime<Utc>>> {
        self.categories.get(category)
    }

    /// Names of all categories seen so far.
    #[must_use]
    pub fn category_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.categories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Expiry of one effect.
    #[must_use]
    pub fn expiry(&self, category: &str, key: &str) -> Option<DateTime<Utc>> {
        self.categories.get(category)?.get(key).copied()
    }

    /// Look an effect up relative to `now`, with an explicit unknown result.
    #[must_use]
    pub fn lookup(&self, category: &str, key: &str, now: DateTime<Utc>) -> EffectLookup {
        match self.expiry(category, key) {
            None => EffectLookup::Unknown,
            Some(expiry) if expiry > now => EffectLookup::Active(expiry - now),
            Some(_) => EffectLookup::Expired,
        }
    }
}

/// Parse a dialog duration (`H:MM:SS` or `indefinite`) into an absolute expiry.
///
/// Returns `None` for anything else.
#[must_use]
pub fn parse_expiry(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("indefinite") {
        return Some(now + Duration::days(INDEFINITE_DAYS));
    }
    let mut parts = text.split(':');
    let hours: i64 = parts.next()?.trim().parse().ok()?;
    let minutes: i64 = parts.next()?.trim().parse().ok()?;
    let seconds: i64 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() || minutes >= 60 || seconds >= 60 || hours < 0 {
        return None;
    }
    Some(now + Duration::seconds(hours * 3600 + minutes * 60 + seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_expiry_hms() {
        let now = Utc::now();
        let expiry = parse_expiry("0:01:30", now).unwrap();
        let delta = (expiry - now).num_seconds();
        assert!((89..=91).contains(&delta), "delta was {delta}");
    }

    #[test]
    fn test_parse_expiry_indefinite_is_far_future() {
        let now = Utc::now();
        let expiry = parse_expiry("indefinite", now).unwrap();
        assert!(expiry - now > Duration::days(365 * 50));
    }

    #[test]
    fn test_parse_expiry_rejects_garbage() {
        let now = Utc::now();
        assert!(parse_expiry("soon", now).is_none());
        assert!(parse_expiry("1:99:00", now).is_none());
        assert!(parse_expiry("1:00:00:00", now).is_none());
    }

    #[test]
    fn test_clear_touches_only_one_category() {
        let now = Utc::now();
        let mut d = Dialogs::default();
        d.insert("Buffs", "Spirit Shield", "202", now + Duration::seconds(60));
        d.insert("Cooldowns", "Surge", "9605", now + Duration::seconds(60));
        d.clear("Buffs");
        assert!(d.category("Buffs").unwrap().is_empty());
        assert_eq!(d.category("Cooldowns").unwrap().len(), 2);
    }

    #[test]
    fn test_lookup_distinguishes_unknown_and_expired() {
        let now = Utc::now();
        let mut d = Dialogs::default();
        d.insert("Debuffs", "Webbed", "", now - Duration::seconds(1));
        d.insert("Buffs", "Haste", "", now + Duration::seconds(10));
        assert_eq!(d.lookup("Debuffs", "Webbed", now), EffectLookup::Expired);
        assert_eq!(d.lookup("Debuffs", "Stunned", now), EffectLookup::Unknown);
        assert_eq!(d.lookup("Nope", "Webbed", now), EffectLookup::Unknown);
        assert!(matches!(d.lookup("Buffs", "Haste", now), EffectLookup::Active(_)));
    }
}
