//! Reference peer for `ferry-service`.
//!
//! The monitor holds the service's session, prints what the service
//! pushes, and answers permission requests for approval-gated rules.

pub mod policy;
