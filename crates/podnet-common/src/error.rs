//! Error types for podnet.

use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`PodnetError`].
pub type PodnetResult<T> = Result<T, PodnetError>;

/// Errors surfaced by network attachment and flow isolation.
///
/// Nothing in podnet retries on these. Retry and backoff belong to the node
/// agent, which relies on every attach, detach and rule mutation being safe
/// to repeat.
#[derive(Error, Diagnostic, Debug)]
pub enum PodnetError {
    /// The network catalog is empty.
    #[error("No network available in {dir}")]
    #[diagnostic(
        code(podnet::catalog::empty),
        help("Add at least one network definition (*.conf or *.json) to the configuration directory")
    )]
    NoNetworksAvailable {
        /// Directory that was scanned.
        dir: String,
    },

    /// The runtime has no namespace handle for the sandbox.
    #[error("Sandbox not found: {id}")]
    #[diagnostic(code(podnet::runtime::sandbox_not_found))]
    SandboxNotFound {
        /// The sandbox ID that was not found.
        id: String,
    },

    /// The pod object model does not know the pod.
    #[error("Pod {name:?} in namespace {namespace:?} not found")]
    #[diagnostic(code(podnet::runtime::pod_not_found))]
    PodNotFound {
        /// Pod namespace.
        namespace: String,
        /// Pod name.
        name: String,
    },

    /// A network plugin reported a failure.
    #[error("Network plugin failed for network {network}: {cause}")]
    #[diagnostic(code(podnet::plugin::failure))]
    PluginFailure {
        /// Network whose plugin failed.
        network: String,
        /// Plugin-provided cause.
        cause: String,
    },

    /// A switch control command failed.
    #[error("Switch command {operation} failed: {cause}")]
    #[diagnostic(
        code(podnet::switch::command_failed),
        help("Check that Open vSwitch is running and the bridge exists")
    )]
    SwitchCommandFailure {
        /// The switch operation.
        operation: String,
        /// Command output or spawn error.
        cause: String,
    },

    /// An external call did not finish in time.
    #[error("{operation} did not complete within {timeout:?}")]
    #[diagnostic(code(podnet::deadline_exceeded))]
    DeadlineExceeded {
        /// The operation that timed out.
        operation: String,
        /// The deadline that was applied.
        timeout: Duration,
    },

    /// A recorded pod address could not be parsed.
    #[error("Malformed address: {value:?}")]
    #[diagnostic(code(podnet::status::malformed_address))]
    MalformedAddress {
        /// The unparsable value.
        value: String,
    },

    /// Invalid sandbox ID format.
    #[error("Invalid sandbox ID: {id}")]
    #[diagnostic(
        code(podnet::sandbox::invalid_id),
        help("Sandbox IDs must be alphanumeric with hyphens and underscores, 1-128 characters")
    )]
    InvalidSandboxId {
        /// The invalid sandbox ID.
        id: String,
    },

    /// Invalid MAC address.
    #[error("Invalid MAC address: {value}")]
    #[diagnostic(code(podnet::flow::invalid_mac))]
    InvalidMacAddress {
        /// The invalid value.
        value: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(podnet::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(podnet::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(podnet::config))]
    Config {
        /// The error message.
        message: String,
    },
}

impl PodnetError {
    /// Build a [`PodnetError::PluginFailure`].
    pub fn plugin(network: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::PluginFailure {
            network: network.into(),
            cause: cause.into(),
        }
    }

    /// Build a [`PodnetError::SwitchCommandFailure`].
    pub fn switch(operation: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::SwitchCommandFailure {
            operation: operation.into(),
            cause: cause.into(),
        }
    }

    /// Whether the error is a deadline expiry.
    #[must_use]
    pub const fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }
}

impl From<serde_json::Error> for PodnetError {
    fn from(err: serde_json::Error) -> Self {
        PodnetError::Serialization(err.to_string())
    }
}
