//! Error types for platform resolution and remote management.

use thiserror::Error;

/// SSH-style exit code indicating the host itself was unreachable, as
/// opposed to the command failing on the host.
pub const RET_CODE_UNREACHABLE: i32 = 255;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform not defined: {0}")]
    Lookup(String),
    #[error("no hosts reachable on platform {0}")]
    NoHosts(String),
    #[error("no platforms left in group {0}")]
    NoPlatforms(String),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote management failed on {target}: {reason}")]
    Management { target: String, reason: String },
    #[error("host selection command failed: {0}")]
    HostSelect(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed result line: {0}")]
    BadLine(String),
    #[error("malformed poll context: {0}")]
    BadPollContext(#[from] serde_json::Error),
}
