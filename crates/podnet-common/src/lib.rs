//! # podnet-common
//!
//! Shared types for the podnet workspace.
//!
//! This crate provides functionality used across all podnet crates:
//! - The error taxonomy surfaced by attachment and flow operations
//! - Validated sandbox and tenant identifiers
//! - Standard filesystem paths

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{PodnetError, PodnetResult};
pub use id::{SandboxId, Vnid};
pub use paths::PodnetPaths;
