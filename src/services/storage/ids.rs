//! Session-stable entry ids.
//!
//! Providers identify entries by path. A UI that needs to follow an item
//! across renames keeps an `EntryIdTracker`, which hands out a UUID per path
//! and moves it (and the ids of everything below it) when the path changes.
//! Ids are not persisted and do not survive a restart.

use std::collections::HashMap;
use uuid::Uuid;

use super::types::Entry;

#[derive(Debug, Default)]
pub struct EntryIdTracker {
    ids: HashMap<String, String>,
}

impl EntryIdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `path`, allocating one on first sight.
    pub fn id_for(&mut self, path: &str) -> String {
        self.ids
            .entry(path.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone()
    }

    /// Replace each entry's id with its tracked id.
    pub fn assign(&mut self, entries: &mut [Entry]) {
        for entry in entries {
            entry.id = self.id_for(&entry.path);
        }
    }

    /// Record a rename or move. Ids under `old` move along with it.
    pub fn renamed(&mut self, old: &str, new: &str) {
        let old_dir = format!("{}/", old.trim_end_matches('/'));
        let moved: Vec<String> = self
            .ids
            .keys()
            .filter(|p| p.as_str() == old || p.starts_with(&old_dir))
            .cloned()
            .collect();

        for path in moved {
            if let Some(id) = self.ids.remove(&path) {
                let suffix = &path[old.len()..];
                self.ids.insert(format!("{}{}", new, suffix), id);
            }
        }
    }

    /// Forget `path` and everything below it.
    pub fn removed(&mut self, path: &str) {
        let dir = format!("{}/", path.trim_end_matches('/'));
        self.ids.retain(|p, _| p != path && !p.starts_with(&dir));
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_stable_for_path() {
        let mut tracker = EntryIdTracker::new();
        let a = tracker.id_for("/a.txt");
        assert_eq!(tracker.id_for("/a.txt"), a);
        assert_ne!(tracker.id_for("/b.txt"), a);
    }

    #[test]
    fn test_rename_carries_subtree_ids() {
        let mut tracker = EntryIdTracker::new();
        let dir = tracker.id_for("/docs");
        let child = tracker.id_for("/docs/report.pdf");
        let sibling = tracker.id_for("/docs-old/x");

        tracker.renamed("/docs", "/archive/docs");

        assert_eq!(tracker.id_for("/archive/docs"), dir);
        assert_eq!(tracker.id_for("/archive/docs/report.pdf"), child);
        assert_eq!(tracker.id_for("/docs-old/x"), sibling);
        assert_ne!(tracker.id_for("/docs"), dir);
    }

    #[test]
    fn test_assign_and_remove() {
        let mut tracker = EntryIdTracker::new();
        let mut entries = vec![Entry::file("/a", 1, None), Entry::directory("/d")];
        tracker.assign(&mut entries);
        assert_eq!(entries[0].id, tracker.id_for("/a"));
        tracker.removed("/d");
        assert_eq!(tracker.len(), 1);
    }
}
