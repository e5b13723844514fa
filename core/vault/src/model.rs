//! Plaintext vault contents: entries, folders and the snapshot holding them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use zeroize::Zeroize;

use teamvault_common::{Error, Result, TeamId, UserId};

/// Longest accepted item id.
pub const MAX_ID_LEN: usize = 128;

/// Longest accepted free-text field, in bytes.
pub const MAX_FIELD_LEN: usize = 64 * 1024;

fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(Error::InvalidInput(format!("{} id length out of range", kind)));
    }
    Ok(())
}

fn validate_field(name: &str, value: &str) -> Result<()> {
    if value.len() > MAX_FIELD_LEN {
        return Err(Error::InvalidInput(format!("{} is too long", name)));
    }
    Ok(())
}

/// Generate a globally unique item id.
pub fn new_item_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A stored credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    pub title: String,
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub favorite: bool,
    pub created_by: UserId,
}

impl Entry {
    /// Create an entry with a fresh id, stamped now.
    pub fn new(
        title: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        created_by: UserId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_item_id(),
            title: title.into(),
            username: username.into(),
            password: password.into(),
            url: None,
            notes: None,
            folder_id: None,
            team_id: None,
            created_at: now,
            updated_at: now,
            favorite: false,
            created_by,
        }
    }

    pub fn with_team(mut self, team_id: TeamId) -> Self {
        self.team_id = Some(team_id);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_id("entry", &self.id)?;
        validate_field("title", &self.title)?;
        validate_field("username", &self.username)?;
        validate_field("password", &self.password)?;
        for (name, value) in [("url", &self.url), ("notes", &self.notes)] {
            if let Some(value) = value {
                validate_field(name, value)?;
            }
        }
        if let Some(folder_id) = &self.folder_id {
            validate_id("folder", folder_id)?;
        }
        Ok(())
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("team_id", &self.team_id)
            .field("password", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// A folder. Folders nest through `parent_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub favorite: bool,
    pub created_by: UserId,
}

impl Folder {
    pub fn new(title: impl Into<String>, created_by: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: new_item_id(),
            title: title.into(),
            parent_id: None,
            team_id: None,
            created_at: now,
            updated_at: now,
            favorite: false,
            created_by,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_id("folder", &self.id)?;
        validate_field("title", &self.title)?;
        if self.parent_id.as_deref() == Some(self.id.as_str()) {
            return Err(Error::InvalidInput(format!(
                "folder {} is its own parent",
                self.id
            )));
        }
        Ok(())
    }
}

/// The decrypted working set of one vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub v: u32,
    #[serde(default)]
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub folders: Vec<Folder>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            v: Self::VERSION,
            entries: Vec::new(),
            folders: Vec::new(),
        }
    }
}

impl Snapshot {
    /// Payload format version written by this build.
    pub const VERSION: u32 = 1;

    /// Check a decrypted payload before use.
    ///
    /// # Errors
    /// - `UnsupportedVersion` for any version other than the current one
    /// - `InvalidInput` for malformed items or duplicate ids
    pub fn validate(&self) -> Result<()> {
        if self.v != Self::VERSION {
            return Err(Error::UnsupportedVersion {
                found: self.v,
                supported: Self::VERSION,
            });
        }

        let mut seen = HashSet::new();
        for entry in &self.entries {
            entry.validate()?;
            if !seen.insert(entry.id.as_str()) {
                return Err(Error::InvalidInput(format!("duplicate entry id {}", entry.id)));
            }
        }
        let mut seen = HashSet::new();
        for folder in &self.folders {
            folder.validate()?;
            if !seen.insert(folder.id.as_str()) {
                return Err(Error::InvalidInput(format!("duplicate folder id {}", folder.id)));
            }
        }
        Ok(())
    }

    pub fn entry(&self, id: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Insert or replace an entry by id. Returns true if it replaced one.
    pub fn upsert_entry(&mut self, entry: Entry) -> bool {
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => {
                *existing = entry;
                true
            }
            None => {
                self.entries.push(entry);
                false
            }
        }
    }

    pub fn remove_entry(&mut self, id: &str) -> Option<Entry> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(index))
    }

    pub fn upsert_folder(&mut self, folder: Folder) -> bool {
        match self.folders.iter_mut().find(|f| f.id == folder.id) {
            Some(existing) => {
                *existing = folder;
                true
            }
            None => {
                self.folders.push(folder);
                false
            }
        }
    }

    /// Remove a folder. Entries and child folders inside it move to the root.
    pub fn remove_folder(&mut self, id: &str) -> Option<Folder> {
        let index = self.folders.iter().position(|f| f.id == id)?;
        for entry in self.entries.iter_mut() {
            if entry.folder_id.as_deref() == Some(id) {
                entry.folder_id = None;
            }
        }
        for folder in self.folders.iter_mut() {
            if folder.parent_id.as_deref() == Some(id) {
                folder.parent_id = None;
            }
        }
        Some(self.folders.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserId {
        UserId::new("alice").unwrap()
    }

    #[test]
    fn test_entry_wire_names() {
        let entry = Entry::new("Mail", "alice", "pw", alice()).with_url("https://mail");
        let json = serde_json::to_value(&entry).unwrap();

        assert!(json.get("createdAt").is_some());
        assert!(json.get("createdBy").is_some());
        assert!(json.get("folderId").is_none());
        assert_eq!(json["url"], "https://mail");
    }

    #[test]
    fn test_entry_debug_redacts_password() {
        let entry = Entry::new("Mail", "alice", "hunter2", alice());
        assert!(!format!("{:?}", entry).contains("hunter2"));
    }

    #[test]
    fn test_snapshot_rejects_duplicate_ids() {
        let entry = Entry::new("a", "u", "p", alice());
        let snapshot = Snapshot {
            entries: vec![entry.clone(), entry],
            ..Snapshot::default()
        };
        assert!(matches!(snapshot.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_snapshot_rejects_other_versions() {
        let snapshot = Snapshot {
            v: 2,
            ..Snapshot::default()
        };
        assert!(matches!(
            snapshot.validate(),
            Err(Error::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn test_empty_id_rejected() {
        let mut entry = Entry::new("a", "u", "p", alice());
        entry.id = String::new();
        assert!(entry.validate().is_err());
    }

    #[test]
    fn test_self_parent_rejected() {
        let mut folder = Folder::new("Work", alice());
        folder.parent_id = Some(folder.id.clone());
        assert!(folder.validate().is_err());
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut snapshot = Snapshot::default();
        let mut entry = Entry::new("a", "u", "p", alice());
        assert!(!snapshot.upsert_entry(entry.clone()));
        snapshot.upsert_entry(Entry::new("b", "u", "p", alice()));

        entry.title = "renamed".to_string();
        assert!(snapshot.upsert_entry(entry.clone()));
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.entries[0].title, "renamed");
    }

    #[test]
    fn test_remove_folder_reparents_children() {
        let mut snapshot = Snapshot::default();
        let folder = Folder::new("Work", alice());
        let mut child = Folder::new("Sub", alice());
        child.parent_id = Some(folder.id.clone());
        let mut entry = Entry::new("a", "u", "p", alice());
        entry.folder_id = Some(folder.id.clone());
        snapshot.upsert_folder(folder.clone());
        snapshot.upsert_folder(child);
        snapshot.upsert_entry(entry);

        assert!(snapshot.remove_folder(&folder.id).is_some());
        assert!(snapshot.entries[0].folder_id.is_none());
        assert!(snapshot.folders[0].parent_id.is_none());
    }
}
