//! Error types for the ESL connection and session engine

use crate::connection::DisconnectReason;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type EslResult<T> = Result<T, EslError>;

/// Errors produced by the connection, router and session layers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EslError {
    /// Socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing or decoding failure on the inbound stream.
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// A header line that could not be parsed.
    #[error("invalid header: {header}")]
    InvalidHeader { header: String },

    /// A command argument contained a line break and was rejected before
    /// anything was written.
    #[error("malformed command: {message}")]
    MalformedCommand { message: String },

    /// The call was destroyed before or during the operation.
    #[error("channel {uuid} closed")]
    ChannelClosed { uuid: String },

    /// The connection itself failed; terminal for every session on it.
    #[error("connection lost: {0}")]
    Disconnected(DisconnectReason),

    /// A deadline expired.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A foreground command is already outstanding on this call.
    #[error("a command is already in progress on channel {uuid}")]
    CommandInProgress { uuid: String },

    /// Server answered `-ERR ...`.
    #[error("command failed: {reply_text}")]
    CommandFailed { reply_text: String },

    /// Server answered with neither `+OK` nor `-ERR`.
    #[error("unexpected reply: {reply_text}")]
    UnexpectedReply { reply_text: String },

    /// Authentication rejected.
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// JSON event body could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EslError {
    pub(crate) fn protocol_error(message: impl Into<String>) -> Self {
        EslError::ProtocolError {
            message: message.into(),
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        EslError::MalformedCommand {
            message: message.into(),
        }
    }

    pub(crate) fn auth_failed(reason: impl Into<String>) -> Self {
        EslError::AuthFailed {
            reason: reason.into(),
        }
    }

    pub(crate) fn channel_closed(uuid: impl Into<String>) -> Self {
        EslError::ChannelClosed { uuid: uuid.into() }
    }

    /// `true` for errors that end the whole connection rather than one call.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            EslError::Disconnected(_) | EslError::Io(_) | EslError::ProtocolError { .. }
        )
    }

    /// Duplicate an error for broadcast to several waiters.
    ///
    /// Connection-level errors keep their [`DisconnectReason`]; other errors
    /// are collapsed into their display text where the source is not `Clone`.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            EslError::Io(e) => EslError::Disconnected(DisconnectReason::IoError(e.to_string())),
            EslError::ProtocolError { message } => EslError::ProtocolError {
                message: message.clone(),
            },
            EslError::InvalidHeader { header } => EslError::InvalidHeader {
                header: header.clone(),
            },
            EslError::MalformedCommand { message } => EslError::MalformedCommand {
                message: message.clone(),
            },
            EslError::ChannelClosed { uuid } => EslError::ChannelClosed { uuid: uuid.clone() },
            EslError::Disconnected(reason) => EslError::Disconnected(reason.clone()),
            EslError::Timeout { timeout_ms } => EslError::Timeout {
                timeout_ms: *timeout_ms,
            },
            EslError::CommandInProgress { uuid } => {
                EslError::CommandInProgress { uuid: uuid.clone() }
            }
            EslError::CommandFailed { reply_text } => EslError::CommandFailed {
                reply_text: reply_text.clone(),
            },
            EslError::UnexpectedReply { reply_text } => EslError::UnexpectedReply {
                reply_text: reply_text.clone(),
            },
            EslError::AuthFailed { reason } => EslError::AuthFailed {
                reason: reason.clone(),
            },
            EslError::Json(e) => EslError::protocol_error(e.to_string()),
        }
    }
}
