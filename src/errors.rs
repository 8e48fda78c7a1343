//! Domain error enums for the modules with a defined failure taxonomy (§7).
//!
//! Orchestration code (`main.rs`, task bootstrapping, `config.rs`) keeps
//! using `anyhow::Result` with `.context(..)`; these `thiserror` enums exist
//! for the call sites that need a stable machine-readable tag alongside the
//! human message, matching the teacher's own `anyhow`/`thiserror` split.

use thiserror::Error;

/// Modbus connect/read/write/decode failures (`TransportUnavailable` /
/// `TransportDecode` in the error taxonomy).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("no point named {0}")]
    UnknownPoint(String),
}

impl TransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::ConnectFailed(_) => "connect_failed",
            TransportError::ReadFailed(_) => "read_error",
            TransportError::WriteFailed(_) => "write_error",
            TransportError::Decode(_) => "decode_error",
            TransportError::UnknownPoint(_) => "unknown_point",
        }
    }
}

/// Command-queue lifecycle and handler failures (`CommandRejected` /
/// `CommandFailed` in the error taxonomy).
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("queue is full")]
    QueueFull,
    #[error("precondition failed: {0}")]
    Rejected(String),
    #[error("handler failed: {0}")]
    Failed(String),
    #[error("unsupported command kind: {0}")]
    UnsupportedKind(String),
}

impl CommandError {
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::QueueFull => "queue_full",
            CommandError::Rejected(_) => "rejected",
            CommandError::Failed(_) => "failed",
            CommandError::UnsupportedKind(_) => "unsupported_command",
        }
    }
}

/// Measurement-posting failures (`PostTransient` / `PostDropped`).
#[derive(Debug, Error)]
pub enum PostError {
    #[error("transient posting failure: {0}")]
    Transient(String),
    #[error("queue capacity exceeded, oldest item dropped")]
    Dropped,
    #[error("not authenticated")]
    Unauthenticated,
}

impl PostError {
    pub fn kind(&self) -> &'static str {
        match self {
            PostError::Transient(_) => "post_transient",
            PostError::Dropped => "post_dropped",
            PostError::Unauthenticated => "unauthenticated",
        }
    }
}

/// Configuration load/validation failures (`ConfigInvalid`).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("configuration validation failed: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigError::Parse(_) => "config_parse_error",
            ConfigError::Invalid(_) => "config_invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_kinds_are_stable_tags() {
        assert_eq!(TransportError::ConnectFailed("x".into()).kind(), "connect_failed");
        assert_eq!(TransportError::Decode("x".into()).kind(), "decode_error");
    }

    #[test]
    fn command_error_kinds_are_stable_tags() {
        assert_eq!(CommandError::QueueFull.kind(), "queue_full");
        assert_eq!(CommandError::UnsupportedKind("x".into()).kind(), "unsupported_command");
    }
}
