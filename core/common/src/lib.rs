//! Common utilities and types shared across TeamVault modules.
//!
//! This module provides foundational types that are used throughout the codebase,
//! ensuring consistency and type safety.

pub mod error;
pub mod event;
pub mod types;

pub use error::{Error, Result};
pub use event::{ChangeEvent, EventKind, Resource};
pub use types::{
    BlobId, ContentHash, KeyEpoch, Permission, SensitiveBytes, TeamId, TeamRole, UserId,
    VaultId, VaultKind, WrappedKey,
};
