//! Configuration for the `ferry-service` binary.

pub mod config;
