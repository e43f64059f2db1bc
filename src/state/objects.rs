//! Game object collections.
//!
//! Objects carry a server-assigned `exist` id. Each lives in exactly one
//! collection; a collection is replaced wholesale whenever the server
//! redraws it. Status strings are kept beside the objects, keyed by id, so a
//! redraw keeps an object's status while an explicit clear forgets it.

use std::collections::HashMap;

/// A server-identified object (item, creature, player, ...).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GameObj {
    /// Server `exist` id.
    pub id: String,
    /// Short noun used in commands.
    pub noun: String,
    /// Display name.
    pub name: String,
    /// Word preceding the name ("a", "some", ...).
    pub before_name: Option<String>,
    /// Text following the name ("that appears dead", ...).
    pub after_name: Option<String>,
}

impl GameObj {
    /// Create an object with no surrounding text.
    pub fn new(id: impl Into<String>, noun: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            noun: noun.into(),
            name: name.into(),
            before_name: None,
            after_name: None,
        }
    }

    /// Full display text including the surrounding words.
    #[must_use]
    pub fn full_name(&self) -> String {
        let mut parts = Vec::with_capacity(3);
        if let Some(before) = &self.before_name {
            parts.push(before.as_str());
        }
        parts.push(self.name.as_str());
        if let Some(after) = &self.after_name {
            parts.push(after.as_str());
        }
        parts.join(" ")
    }
}

/// The disjoint collections an object can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Items lying in the room.
    Loot,
    /// Creatures in the room.
    Npcs,
    /// Other players in the room.
    Pcs,
    /// Objects linked from the room description.
    RoomDesc,
    /// Worn/carried inventory.
    Inventory,
    /// Familiar-view loot.
    FamLoot,
    /// Familiar-view creatures.
    FamNpcs,
    /// Familiar-view players.
    FamPcs,
    /// Familiar-view room description objects.
    FamRoomDesc,
}

/// Which hand an object is held in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hand {
    /// Left hand.
    Left,
    /// Right hand.
    Right,
}

/// All object collections plus the per-id status table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectRegistry {
    collections: HashMap<Collection, Vec<GameObj>>,
    containers: HashMap<String, Vec<GameObj>>,
    left: Option<GameObj>,
    right: Option<GameObj>,
    status: HashMap<String, String>,
}

impl ObjectRegistry {
    /// Objects in one collection (empty if never drawn).
    #[must_use]
    pub fn get(&self, collection: Collection) -> &[GameObj] {
        self.collections.get(&collection).map(Vec::as_slice).unwrap_or_default()
    }

    /// Replace a collection on full redraw; statuses of surviving ids persist.
    pub(crate) fn redraw(&mut self, collection: Collection, objects: Vec<GameObj>) {
        self.collections.insert(collection, objects);
    }

    /// Explicitly clear a collection, forgetting its objects' statuses.
    pub(crate) fn clear(&mut self, collection: Collection) {
        if let Some(old) = self.collections.remove(&collection) {
            for obj in old {
                self.status.remove(&obj.id);
            }
        }
    }

    /// Object held in a hand.
    #[must_use]
    pub fn hand(&self, hand: Hand) -> Option<&GameObj> {
        match hand {
            Hand::Left => self.left.as_ref(),
            Hand::Right => self.right.as_ref(),
        }
    }

    pub(crate) fn set_hand(&mut self, hand: Hand, obj: Option<GameObj>) {
        match hand {
            Hand::Left => self.left = obj,
            Hand::Right => self.right = obj,
        }
    }

    /// Contents of a container, if known.
    #[must_use]
    pub fn container(&self, id: &str) -> Option<&[GameObj]> {
        self.containers.get(id).map(Vec::as_slice)
    }

    /// Ids of all containers with known contents.
    #[must_use]
    pub fn container_ids(&self) -> Vec<&str> {
        self.containers.keys().map(String::as_str).collect()
    }

    pub(crate) fn add_to_container(&mut self, id: &str, obj: GameObj) {
        self.containers.entry(id.to_string()).or_default().push(obj);
    }

    /// Empty a container's contents but keep it known.
    pub(crate) fn clear_container(&mut self, id: &str) {
        if let Some(contents) = self.containers.get_mut(id) {
            for obj in contents.drain(..) {
                self.status.remove(&obj.id);
            }
        } else {
            self.containers.insert(id.to_string(), Vec::new());
        }
    }

    /// Forget a container entirely (it was reported closed).
    pub(crate) fn delete_container(&mut self, id: &str) {
        if let Some(contents) = self.containers.remove(id) {
            for obj in contents {
                self.status.remove(&obj.id);
            }
        }
    }

    /// Status of an object, if any.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<&str> {
        self.status.get(id).map(String::as_str)
    }

    pub(crate) fn set_status(&mut self, id: &str, status: Option<String>) {
        match status {
            Some(s) => {
                self.status.insert(id.to_string(), s);
            }
            None => {
                self.status.remove(id);
            }
        }
    }

    /// Find an object by id anywhere.
    #[must_use]
    pub fn find(&self, id: &str) -> Option<&GameObj> {
        self.collections
            .values()
            .chain(self.containers.values())
            .flat_map(|v| v.iter())
            .chain(self.left.iter())
            .chain(self.right.iter())
            .find(|o| o.id == id)
    }

    /// Find objects in a collection whose noun or name contains `needle`.
    #[must_use]
    pub fn search(&self, collection: Collection, needle: &str) -> Vec<&GameObj> {
        let needle = needle.to_lowercase();
        self.get(collection)
            .iter()
            .filter(|o| o.noun.to_lowercase() == needle || o.name.to_lowercase().contains(&needle))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redraw_keeps_status_clear_drops_it() {
        let mut reg = ObjectRegistry::default();
        reg.redraw(Collection::Npcs, vec![GameObj::new("1", "kobold", "kobold")]);
        reg.set_status("1", Some("stunned".into()));

        reg.redraw(Collection::Npcs, vec![GameObj::new("1", "kobold", "kobold")]);
        assert_eq!(reg.status("1"), Some("stunned"));

        reg.clear(Collection::Npcs);
        assert!(reg.get(Collection::Npcs).is_empty());
        assert_eq!(reg.status("1"), None);
    }

    #[test]
    fn test_containers() {
        let mut reg = ObjectRegistry::default();
        reg.add_to_container("99", GameObj::new("5", "gem", "blue gem"));
        assert_eq!(reg.container("99").unwrap().len(), 1);
        reg.clear_container("99");
        assert_eq!(reg.container("99").unwrap().len(), 0);
        reg.delete_container("99");
        assert!(reg.container("99").is_none());
    }

    #[test]
    fn test_find_and_full_name() {
        let mut reg = ObjectRegistry::default();
        let mut obj = GameObj::new("7", "sword", "steel sword");
        obj.before_name = Some("a".into());
        reg.set_hand(Hand::Right, Some(obj));
        let found = reg.find("7").unwrap();
        assert_eq!(found.full_name(), "a steel sword");
        assert_eq!(reg.search(Collection::Loot, "sword").len(), 0);
    }
}
