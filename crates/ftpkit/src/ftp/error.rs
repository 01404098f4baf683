//! FTP-specific error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised FTP error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    /// Operation the error was delivered for, if any.
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// Connection refused / reset / DNS failure / closed by the server.
    Transport,
    /// Wrong username/password (430/530) or any other login failure.
    AuthenticationFailed,
    /// An operation or command was started while another was in flight.
    SessionBusy,
    /// Server returned a 4xx/5xx for a well-formed command.
    CommandRejected,
    /// Server sent a reply that could not be parsed.
    MalformedReply,
    /// The data connection was not established within the bound.
    DataChannelTimeout,
    /// Operation cancelled by the caller.
    Cancelled,
    /// Control round trip or data read timed out.
    Timeout,
    /// A command was issued before login completed.
    NotLoggedIn,
    /// Local file I/O failure.
    Io,
    /// Argument rejected before it reached the wire.
    InvalidArgument,
    /// Configuration failed validation.
    InvalidConfig,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            operation_id: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_operation(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Transport, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthenticationFailed, msg)
    }

    pub fn session_busy(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::SessionBusy, msg)
    }

    pub fn command_rejected(code: u16, msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::CommandRejected, msg).with_code(code)
    }

    pub fn malformed_reply(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::MalformedReply, msg)
    }

    pub fn data_channel_timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannelTimeout, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Cancelled, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn not_logged_in(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::NotLoggedIn, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Io, msg)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidArgument, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    /// Classify an FTP reply code into the most appropriate error kind.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let kind = match code {
            421 => FtpErrorKind::Transport,
            430 | 530 => FtpErrorKind::AuthenticationFailed,
            _ => FtpErrorKind::CommandRejected,
        };
        Self {
            kind,
            message: text.to_string(),
            code: Some(code),
            operation_id: None,
        }
    }

    /// Errors after which the control connection can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::Transport | FtpErrorKind::Timeout | FtpErrorKind::MalformedReply
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FtpErrorKind::Cancelled
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)?,
            None => write!(f, "[FTP {:?}] {}", self.kind, self.message)?,
        }
        if let Some(ref op) = self.operation_id {
            write!(f, " (operation {})", op)?;
        }
        Ok(())
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {}", e))
        } else {
            Self::io_error(e.to_string())
        }
    }
}

impl From<url::ParseError> for FtpError {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_config(format!("Invalid FTP URL: {}", e))
    }
}

impl From<serde_json::Error> for FtpError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_config(format!("Invalid FTP configuration: {}", e))
    }
}
