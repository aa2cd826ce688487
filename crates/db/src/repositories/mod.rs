//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&SqlitePool` as the first argument.

pub mod transfer_repo;

pub use transfer_repo::TransferRepo;
