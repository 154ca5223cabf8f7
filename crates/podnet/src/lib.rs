//! # podnet
//!
//! Operator CLI for pod network attachment and tenant isolation.
//!
//! The binary wires [`podnet_network`] to a directory-backed runtime host so
//! set-up, teardown and flow management can be driven by hand or from node
//! scripts.

#![warn(missing_docs)]

pub mod cli;
pub mod host;

pub use host::DirectoryHost;
