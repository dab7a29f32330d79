//! Error taxonomy for the tunnel core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    /// Missing or contradictory configuration; the caller must fix it.
    #[error("tunnel '{name}' is misconfigured: {reason}")]
    ConfigInvalid { name: String, reason: String },

    #[error("local port {port} is already in use by {holder}")]
    PortInUse { port: u16, holder: String },

    #[error("failed to launch ssh for tunnel '{name}': {source}")]
    LaunchFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel '{name}' needs a YubiKey but none was detected")]
    DeviceUnavailable { name: String },

    #[error("secret fetch for tunnel '{name}' failed: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("a tunnel named '{name}' already exists")]
    DuplicateName { name: String },

    #[error("no tunnel named '{name}'")]
    UnknownTunnel { name: String },

    #[error("cannot start tunnel '{name}': the supervisor is shutting down")]
    ShuttingDown { name: String },
}

impl TunnelError {
    pub fn config_invalid(name: &str, reason: impl Into<String>) -> Self {
        TunnelError::ConfigInvalid {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Short stable label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelError::ConfigInvalid { .. } => "config-invalid",
            TunnelError::PortInUse { .. } => "port-in-use",
            TunnelError::LaunchFailed { .. } => "launch-failed",
            TunnelError::DeviceUnavailable { .. } => "device-unavailable",
            TunnelError::FetchFailed { .. } => "fetch-failed",
            TunnelError::DuplicateName { .. } => "duplicate-name",
            TunnelError::UnknownTunnel { .. } => "unknown-tunnel",
            TunnelError::ShuttingDown { .. } => "shutting-down",
        }
    }
}
