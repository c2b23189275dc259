//! Error types for guest init.

use thiserror::Error;

/// Guest init errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum InitError {
    /// Config parse or kernel cmdline error.
    #[error("config_parse_failed: {0}")]
    ConfigParseFailed(String),

    /// Networking configuration failed.
    #[error("net_config_failed: {0}")]
    NetConfigFailed(String),

    /// Volume mount failed.
    #[error("mount_failed: volume {name}: {detail}")]
    MountFailed { name: String, detail: String },

    /// The agent HTTP/vsock server failed to bind or accept.
    #[error("agent_server_failed: {0}")]
    AgentServerFailed(String),

    /// A requested path escapes the workspace root.
    #[error("invalid_path: {0}")]
    InvalidPath(String),

    /// A requested path's base directory does not exist.
    #[error("not_found: {0}")]
    NotFound(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Vsock error.
    #[error("vsock error: {0}")]
    Vsock(String),

    /// System call error.
    #[error("syscall error: {0}")]
    Syscall(#[from] nix::Error),
}

impl InitError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            InitError::ConfigParseFailed(_) => "config_parse_failed",
            InitError::NetConfigFailed(_) => "net_config_failed",
            InitError::MountFailed { .. } => "mount_failed",
            InitError::AgentServerFailed(_) => "agent_server_failed",
            InitError::InvalidPath(_) => "invalid_path",
            InitError::NotFound(_) => "not_found",
            InitError::Io(_) => "io_error",
            InitError::Vsock(_) => "vsock_error",
            InitError::Syscall(_) => "syscall_error",
        }
    }
}
