//! Error taxonomy for the port-forward core.
//!
//! Every failure in this crate is recoverable: validation and resolution
//! errors keep the operator's dialog open, conflicts leave the registry
//! untouched, and bind/runtime failures always end with the forwarder
//! evicted. Nothing here is allowed to take the console down.

use std::io;

use crate::forward::ForwarderKey;
use crate::port::TunnelSpec;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Malformed port text or mismatched remote/local cardinality.
    #[error("{0}")]
    Validation(String),

    /// The preferred-port annotation names a port that cannot be resolved.
    #[error("unable to resolve preferred port: {0}")]
    Resolution(String),

    /// A forwarder is already registered for this container.
    #[error("a port-forward already exists on container {0}")]
    Conflict(ForwarderKey),

    /// The local endpoint is already held by another forwarder (or repeated
    /// within the same batch).
    #[error("local port {address}:{port} is already forwarded by {owner}")]
    LocalPortConflict {
        address: String,
        port: u16,
        owner: ForwarderKey,
    },

    /// The local listener could not be bound.
    #[error("unable to bind {}:{}: {source}", spec.address, spec.local_port)]
    Bind {
        spec: TunnelSpec,
        #[source]
        source: io::Error,
    },

    /// An active tunnel died underneath us.
    #[error("port-forward {key} terminated: {reason}")]
    Runtime { key: ForwarderKey, reason: String },

    #[error("no port-forward found for {0}")]
    NotFound(ForwarderKey),

    /// The forwarder was stopped before its tunnels finished binding.
    #[error("port-forward {0} was cancelled while starting")]
    Cancelled(ForwarderKey),

    #[error("port-forward limit reached (max {0})")]
    LimitReached(usize),

    /// Workload lookup or state precondition failed.
    #[error("{0}")]
    Workload(String),

    #[error("config: {0}")]
    Config(String),
}

impl ForwardError {
    /// Short taxonomy label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Resolution(_) => "resolution",
            Self::Conflict(_) | Self::LocalPortConflict { .. } => "conflict",
            Self::Bind { .. } => "bind",
            Self::Runtime { .. } => "runtime",
            Self::NotFound(_) => "not_found",
            Self::Cancelled(_) => "cancelled",
            Self::LimitReached(_) => "limit",
            Self::Workload(_) => "workload",
            Self::Config(_) => "config",
        }
    }

    /// Errors the operator can fix in place without the dialog closing.
    pub fn is_recoverable_input(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Resolution(_))
    }
}

impl From<kube::Error> for ForwardError {
    fn from(e: kube::Error) -> Self {
        Self::Workload(e.to_string())
    }
}
