//! Change notifications published on every server-side mutation.
//!
//! The wire shape is `{t, type, vaultId?, teamId?, memberId?, actorUserId}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{TeamId, UserId, VaultId};
use crate::{Error, Result};

/// Kind of mutation an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    VaultCreate,
    VaultUpdate,
    ShareGrantCreate,
    TeamCreate,
    TeamMemberInvite,
    TeamMemberJoin,
    TeamMemberRemove,
    TeamKeyRotate,
    IdentityReset,
}

/// The resource an event is tagged with, used for per-subscriber filtering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Vault(VaultId),
    Team(TeamId),
    User(UserId),
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Publication time, milliseconds since the Unix epoch.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub t: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_id: Option<VaultId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<UserId>,
    pub actor_user_id: UserId,
}

impl ChangeEvent {
    /// Create an event stamped with the current time.
    pub fn new(kind: EventKind, actor: UserId) -> Self {
        Self {
            t: Utc::now(),
            kind,
            vault_id: None,
            team_id: None,
            member_id: None,
            actor_user_id: actor,
        }
    }

    /// Tag the event with a vault.
    pub fn with_vault(mut self, vault_id: VaultId) -> Self {
        self.vault_id = Some(vault_id);
        self
    }

    /// Tag the event with a team.
    pub fn with_team(mut self, team_id: TeamId) -> Self {
        self.team_id = Some(team_id);
        self
    }

    /// Tag the event with the affected member.
    pub fn with_member(mut self, member_id: UserId) -> Self {
        self.member_id = Some(member_id);
        self
    }

    /// The resource that decides who may see this event.
    ///
    /// Vault tags take precedence over team tags, which take precedence over the actor.
    pub fn resource(&self) -> Resource {
        if let Some(vault_id) = &self.vault_id {
            Resource::Vault(vault_id.clone())
        } else if let Some(team_id) = &self.team_id {
            Resource::Team(team_id.clone())
        } else {
            Resource::User(self.actor_user_id.clone())
        }
    }

    /// Check that the tags required by the event kind are present.
    pub fn validate(&self) -> Result<()> {
        let missing = |field: &str| {
            Err(Error::InvalidInput(format!(
                "{:?} event is missing {}",
                self.kind, field
            )))
        };

        match self.kind {
            EventKind::VaultCreate | EventKind::VaultUpdate | EventKind::ShareGrantCreate => {
                if self.vault_id.is_none() {
                    return missing("vaultId");
                }
            }
            EventKind::TeamCreate | EventKind::TeamKeyRotate => {
                if self.team_id.is_none() {
                    return missing("teamId");
                }
            }
            EventKind::TeamMemberInvite | EventKind::TeamMemberJoin | EventKind::TeamMemberRemove => {
                if self.team_id.is_none() {
                    return missing("teamId");
                }
                if self.member_id.is_none() {
                    return missing("memberId");
                }
            }
            EventKind::IdentityReset => {}
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode and validate an untrusted payload.
    pub fn from_json(json: &str) -> Result<Self> {
        let event: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }
}
