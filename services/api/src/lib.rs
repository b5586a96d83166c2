//! services/api/src/lib.rs
//!
//! The course engine service: configuration, adapters for the engine's ports,
//! and the REST surface. The binaries in `src/bin` assemble these.

pub mod adapters;
pub mod config;
pub mod error;
pub mod web;
