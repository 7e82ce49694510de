//! Shared types for the quay gateway workspace.
//!
//! Keep cross-crate model types here to avoid duplication between the gateway
//! and external collaborators (data store adapters, agents).

#![warn(missing_docs)]

/// Endpoint, resource-control, and principal model shared across crates.
pub mod model;
