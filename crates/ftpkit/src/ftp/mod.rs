//! # ftpkit: asynchronous FTP client engine
//!
//! RFC 959 client with the RFC 2428 extended data-channel commands
//! (EPSV / EPRT) and RFC 3659 SIZE.
//!
//! Architecture:
//! - `types`: configuration, entries, progress, reply codes
//! - `error`: FTP-specific error type
//! - `protocol`: command encoding and multi-line reply framing
//! - `connection`: TCP control connection and greeting
//! - `session`: control-session state machine (login, CWD, TYPE, ABOR, QUIT)
//! - `directory`: single-command operations (MKD, RMD, DELE, RNFR/RNTO, SIZE)
//! - `transfer`: data channel negotiation (PASV/EPSV/PORT/EPRT)
//! - `parser`: Unix and DOS `LIST` parsing, filtering and sorting
//! - `operation`: pending operations, callbacks, cancellation, handles
//! - `engine`: drives one operation over the session and data channel
//! - `client`: public façade with callback-based entry points

pub mod types;
pub mod error;
pub mod protocol;
pub mod connection;
pub mod session;
pub mod directory;
pub mod transfer;
pub mod parser;
pub mod operation;
pub mod engine;
pub mod client;

#[cfg(test)]
pub(crate) mod mock_server;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use client::{ErrorHook, FtpClient};
pub use operation::{OperationHandle, OperationOutput, OperationRequest};
pub use session::ControlSession;
