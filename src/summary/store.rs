use std::collections::BTreeMap;
use std::path::Path;

use enumset::{EnumSet, EnumSetType};
use serde::{Deserialize, Serialize};

use super::{load_json, save_json};
use crate::error::Result;
use crate::types::NameAttribute;

/// Folder attributes remembered in the store summary.
#[derive(EnumSetType, Debug, Hash, Serialize, Deserialize)]
#[enumset(serialize_repr = "u32")]
pub enum FolderFlag {
    /// On the server's subscription list.
    Subscribed,
    /// Cannot be selected; exists only as a hierarchy node.
    NoSelect,
    /// Cannot have children.
    NoInferiors,
    HasChildren,
    HasNoChildren,
    Marked,
    Unmarked,
}

pub type FolderFlags = EnumSet<FolderFlag>;

impl FolderFlag {
    /// The store flag for a `LIST` attribute, if it is one we track.
    pub fn from_attribute(attr: &NameAttribute<'_>) -> Option<FolderFlag> {
        match attr {
            NameAttribute::NoSelect => Some(FolderFlag::NoSelect),
            NameAttribute::NoInferiors => Some(FolderFlag::NoInferiors),
            NameAttribute::HasChildren => Some(FolderFlag::HasChildren),
            NameAttribute::HasNoChildren => Some(FolderFlag::HasNoChildren),
            NameAttribute::Marked => Some(FolderFlag::Marked),
            NameAttribute::Unmarked => Some(FolderFlag::Unmarked),
            _ => None,
        }
    }
}

/// One folder known to the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    /// Local path, `/`-separated, without the namespace prefix.
    pub path: String,
    /// The server's name for the folder.
    pub full_name: String,
    pub flags: FolderFlags,
    /// Unseen messages when last counted.
    pub unread: u32,
    /// Messages when last counted.
    pub total: u32,
    pub uid_validity: Option<u32>,
}

impl FolderRecord {
    pub fn new(path: impl Into<String>, full_name: impl Into<String>) -> Self {
        FolderRecord {
            path: path.into(),
            full_name: full_name.into(),
            flags: FolderFlags::empty(),
            unread: 0,
            total: 0,
            uid_validity: None,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.flags.contains(FolderFlag::Subscribed)
    }

    pub fn is_selectable(&self) -> bool {
        !self.flags.contains(FolderFlag::NoSelect)
    }
}

/// The persisted folder hierarchy of a store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreSummary {
    /// The namespace prefix, ending in the separator (empty for the root namespace).
    pub namespace: Option<String>,
    /// The hierarchy separator.
    pub separator: Option<char>,
    folders: BTreeMap<String, FolderRecord>,
    #[serde(skip)]
    dirty: bool,
}

impl StoreSummary {
    pub fn load(path: &Path) -> Result<StoreSummary> {
        Ok(load_json(path)?.unwrap_or_default())
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        save_json(path, self)?;
        self.dirty = false;
        Ok(())
    }

    pub fn touch(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_namespace(&mut self, prefix: String, separator: Option<char>) {
        if self.namespace.as_deref() != Some(prefix.as_str()) || self.separator != separator {
            self.namespace = Some(prefix);
            self.separator = separator;
            self.touch();
        }
    }

    pub fn get(&self, path: &str) -> Option<&FolderRecord> {
        self.folders.get(path)
    }

    /// Insert or replace a record. Returns whether anything changed.
    pub fn insert(&mut self, record: FolderRecord) -> bool {
        if self.folders.get(&record.path) == Some(&record) {
            return false;
        }
        self.folders.insert(record.path.clone(), record);
        self.touch();
        true
    }

    /// Apply `f` to the record at `path`; touched only if it changed.
    pub fn update(&mut self, path: &str, f: impl FnOnce(&mut FolderRecord)) -> bool {
        let Some(record) = self.folders.get_mut(path) else {
            return false;
        };
        let before = record.clone();
        f(record);
        if *record != before {
            self.dirty = true;
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, path: &str) -> Option<FolderRecord> {
        let removed = self.folders.remove(path);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Every record, ordered by path.
    pub fn folders(&self) -> impl Iterator<Item = &FolderRecord> {
        self.folders.values()
    }

    /// Records at or below `top` (everything for an empty `top`).
    pub fn subtree<'a>(&'a self, top: &'a str) -> impl Iterator<Item = &'a FolderRecord> + 'a {
        self.folders.values().filter(move |r| {
            top.is_empty()
                || r.path == top
                || (r.path.starts_with(top) && r.path[top.len()..].starts_with('/'))
        })
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_reports_changes() {
        let mut s = StoreSummary::default();
        assert!(s.insert(FolderRecord::new("Work", "INBOX.Work")));
        s.save(&tempfile::tempdir().unwrap().path().join("s.json"))
            .unwrap();
        assert!(!s.is_dirty());
        assert!(!s.insert(FolderRecord::new("Work", "INBOX.Work")));
        assert!(!s.is_dirty());
        assert!(s.update("Work", |r| r.flags |= FolderFlag::Subscribed));
        assert!(s.get("Work").unwrap().is_subscribed());
    }

    #[test]
    fn subtree_respects_component_boundaries() {
        let mut s = StoreSummary::default();
        for p in ["Work", "Work/2024", "Workshop", "Home"] {
            s.insert(FolderRecord::new(p, p));
        }
        let paths: Vec<_> = s.subtree("Work").map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["Work", "Work/2024"]);
        assert_eq!(s.subtree("").count(), 4);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store-summary.json");
        let mut s = StoreSummary::default();
        s.set_namespace("INBOX.".into(), Some('.'));
        let mut rec = FolderRecord::new("Lists/rust", "INBOX.Lists.rust");
        rec.flags = FolderFlag::Subscribed | FolderFlag::HasNoChildren;
        rec.unread = 3;
        s.insert(rec.clone());
        s.save(&path).unwrap();

        let back = StoreSummary::load(&path).unwrap();
        assert_eq!(back.namespace.as_deref(), Some("INBOX."));
        assert_eq!(back.separator, Some('.'));
        assert_eq!(back.get("Lists/rust"), Some(&rec));
    }
}
