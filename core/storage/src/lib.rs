//! Server side of TeamVault.
//!
//! This crate provides the [`VaultBackend`] interface clients talk to, and an
//! in-memory implementation of it built from three parts:
//! - [`SessionGuard`]: opaque bearer sessions checked on every call
//! - [`ServerState`]: vault, team, grant and blob records plus the access rules
//! - [`SyncEventBroker`]: change events fanned out per subscriber, filtered by
//!   the same access rules that gate direct reads
//!
//! # Design Principles
//! - Zero knowledge: blobs, bundles and wrapped keys are opaque bytes here
//! - Atomic authorization: every check runs before any mutation
//! - Append-mostly: revocation flags records instead of deleting them

pub mod access;
pub mod backend;
pub mod broker;
pub mod memory;
pub mod session;

pub use access::{AccessPolicy, ServerState, StateAccessPolicy};
pub use backend::{
    GrantRecipient, IdentityRecord, MembershipInfo, MembershipState, NewBlob, NewMembership,
    NewShareGrant, PublicKeys, ShareTarget, TeamKeyRotation, VaultBackend, VaultDescriptor,
    VaultOwner,
};
pub use broker::{BrokerConfig, StreamItem, Subscription, SyncEventBroker};
pub use memory::MemoryBackend;
pub use session::{SessionConfig, SessionGuard, SessionToken};
