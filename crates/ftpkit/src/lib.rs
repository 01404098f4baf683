//! # ftpkit: FTP client engine
//!
//! Asynchronous FTP client built on tokio, providing:
//!   • Control-session state machine with login, CWD, TYPE, ABOR and QUIT
//!   • Passive (PASV / EPSV) and active (PORT / EPRT) data channels
//!   • Unix and DOS `LIST` parsing with glob filtering and sorting
//!   • Streaming upload / download with per-chunk progress callbacks
//!   • Per-operation cancellation and exactly-once completion
//!   • Lazy connect, serialized operations, optional NOOP keepalive

pub mod ftp;

pub use ftp::*;
