//! Vault engine for TeamVault.
//!
//! This module provides:
//! - Entries, folders and the versioned snapshot holding them
//! - Snapshot encryption bound to vault id and key epoch
//! - Deterministic merge of personal and team vaults, and write routing
//! - Identity creation, unlock and reset
//! - Sharing, team membership and key rotation
//! - The unlocked client with background saves and auto-lock
//!
//! # Architecture
//! The client sits between the user interface and a [`VaultBackend`](teamvault_storage::VaultBackend).
//! The backend only ever sees sealed keys and encrypted snapshots.

pub mod codec;
pub mod config;
pub mod identity;
pub mod manager;
pub mod merge;
pub mod model;
pub mod rotation;
pub mod session;
pub mod share;

pub use codec::{associated_data, SnapshotCodec, BLOB_VERSION, SNAPSHOT_KIND};
pub use config::ClientConfig;
pub use identity::{IdentityKeyStore, RESET_CONFIRMATION};
pub use manager::{LoadReport, SaveFailure, VaultClient};
pub use merge::{MergeEngine, MergedView, Sourced, SourcedSnapshot, WriteRouter};
pub use model::{Entry, Folder, Snapshot};
pub use rotation::{KeyRotation, RotatedKey, TeamVaultRef};
pub use session::{InactivityTimer, SessionState, UnlockedSession};
pub use share::ShareProtocol;
