//! Domain types shared by every ferry crate.
//!
//! Zero internal dependencies: rules and their validation, transfer
//! statuses, the user-visible service status, and the hashing helper used
//! for configuration fingerprints.

pub mod error;
pub mod hashing;
pub mod rules;
pub mod status;
pub mod transfer;
pub mod types;
