//! Combining every accessible vault into one view, and routing writes back.
//!
//! Precedence: personal vaults first, then team vaults, each group ordered by
//! vault id. The first occurrence of an id wins, except that any later
//! team-sourced item supersedes what came before and carries its team's id.
//! So a team copy always beats a personal copy, and between two team vaults
//! the one with the greater vault id wins. The item keeps the list position
//! of its first occurrence.

use std::collections::{BTreeMap, HashMap};

use teamvault_common::{Error, Result, TeamId, VaultId, VaultKind};

use crate::model::{Entry, Folder, Snapshot};

/// A decrypted snapshot together with where it came from.
#[derive(Debug, Clone)]
pub struct SourcedSnapshot {
    pub vault_id: VaultId,
    pub kind: VaultKind,
    pub team_id: Option<TeamId>,
    pub snapshot: Snapshot,
}

/// An item in the merged view and the vault it was taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sourced<T> {
    pub item: T,
    pub source: VaultId,
    pub from_team: bool,
}

/// The combined view over all vaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedView {
    pub entries: Vec<Sourced<Entry>>,
    pub folders: Vec<Sourced<Folder>>,
}

impl MergedView {
    pub fn entry(&self, id: &str) -> Option<&Sourced<Entry>> {
        self.entries.iter().find(|e| e.item.id == id)
    }

    pub fn folder(&self, id: &str) -> Option<&Sourced<Folder>> {
        self.folders.iter().find(|f| f.item.id == id)
    }
}

trait Mergeable: Clone {
    fn id(&self) -> &str;
    fn set_team(&mut self, team_id: TeamId);
}

impl Mergeable for Entry {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_team(&mut self, team_id: TeamId) {
        self.team_id = Some(team_id);
    }
}

impl Mergeable for Folder {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_team(&mut self, team_id: TeamId) {
        self.team_id = Some(team_id);
    }
}

struct Accumulator<T> {
    items: Vec<Sourced<T>>,
    index: HashMap<String, usize>,
}

impl<T: Mergeable> Accumulator<T> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn offer(&mut self, item: &T, source: &SourcedSnapshot) {
        let mut item = item.clone();
        let from_team = source.kind == VaultKind::Team;
        if let (true, Some(team_id)) = (from_team, &source.team_id) {
            item.set_team(team_id.clone());
        }
        let sourced = Sourced {
            item,
            source: source.vault_id.clone(),
            from_team,
        };

        let key = sourced.item.id().to_string();
        match self.index.get(&key).copied() {
            None => {
                self.index.insert(key, self.items.len());
                self.items.push(sourced);
            }
            Some(position) => {
                if from_team {
                    self.items[position] = sourced;
                }
            }
        }
    }
}

/// Deterministic multi-vault merge.
pub struct MergeEngine;

impl MergeEngine {
    /// Merge snapshots into one view. The input order does not matter.
    pub fn combine(snapshots: &[SourcedSnapshot]) -> MergedView {
        let mut ordered: Vec<&SourcedSnapshot> = snapshots.iter().collect();
        // Personal before team, then by vault id.
        ordered.sort_by(|a, b| {
            (a.kind == VaultKind::Team, &a.vault_id).cmp(&(b.kind == VaultKind::Team, &b.vault_id))
        });

        let mut entries = Accumulator::new();
        let mut folders = Accumulator::new();
        for source in ordered {
            for entry in &source.snapshot.entries {
                entries.offer(entry, source);
            }
            for folder in &source.snapshot.folders {
                folders.offer(folder, source);
            }
        }

        MergedView {
            entries: entries.items,
            folders: folders.items,
        }
    }
}

/// Maps a write to the one vault that owns it.
#[derive(Debug, Clone, Default)]
pub struct WriteRouter {
    personal: Option<VaultId>,
    teams: BTreeMap<TeamId, VaultId>,
}

impl WriteRouter {
    pub fn new(personal: Option<VaultId>) -> Self {
        Self {
            personal,
            teams: BTreeMap::new(),
        }
    }

    pub fn add_team(&mut self, team_id: TeamId, vault_id: VaultId) {
        self.teams.insert(team_id, vault_id);
    }

    /// Owning vault for an item tagged with `team_id`.
    ///
    /// # Errors
    /// - `NotFound` if the team's vault (or the personal vault) is not loaded
    pub fn route(&self, team_id: Option<&TeamId>) -> Result<&VaultId> {
        match team_id {
            Some(team_id) => self
                .teams
                .get(team_id)
                .ok_or_else(|| Error::NotFound(format!("vault of team {}", team_id))),
            None => self
                .personal
                .as_ref()
                .ok_or_else(|| Error::NotFound("personal vault".to_string())),
        }
    }
}
