//! Shared types for the FTP crate.

use crate::ftp::error::{FtpError, FtpResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ─── Connection / Session ────────────────────────────────────────────

/// Transfer type (RFC 959 TYPE command).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferType {
    Ascii,
    Binary,
}

impl TransferType {
    /// Argument sent with `TYPE`.
    pub fn code(self) -> &'static str {
        match self {
            Self::Ascii => "A",
            Self::Binary => "I",
        }
    }
}

impl Default for TransferType {
    fn default() -> Self {
        Self::Binary
    }
}

/// Strategy used to establish the data channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DataChannelMode {
    Passive,
    ExtendedPassive,
    Active,
    ExtendedActive,
}

impl DataChannelMode {
    pub fn is_passive(self) -> bool {
        matches!(self, Self::Passive | Self::ExtendedPassive)
    }

    /// EPSV / EPRT rather than PASV / PORT.
    pub fn is_extended(self) -> bool {
        matches!(self, Self::ExtendedPassive | Self::ExtendedActive)
    }
}

impl Default for DataChannelMode {
    fn default() -> Self {
        Self::Passive
    }
}

/// Server address plus credentials. Fixed for the life of a session.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerEndpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
}

impl ServerEndpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

fn default_port() -> u16 {
    21
}
fn default_username() -> String {
    "anonymous".into()
}
fn default_password() -> String {
    "anonymous@".into()
}

/// Configuration for one FTP client (one control session at a time).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpConfig {
    pub endpoint: ServerEndpoint,
    /// Include entries whose name starts with '.' in listings.
    #[serde(default)]
    pub show_hidden_files: bool,
    #[serde(default)]
    pub data_channel_mode: DataChannelMode,
    /// Local address to bind for active-mode data connections.
    #[serde(default)]
    pub active_bind_address: Option<String>,
    /// Remote directory to CWD into after login.
    #[serde(default)]
    pub initial_directory: Option<String>,
    /// TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
    /// Timeout for each command/reply round trip, in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_sec: u64,
    /// Data-channel establishment and idle timeout in seconds.
    #[serde(default = "default_data_timeout")]
    pub data_timeout_sec: u64,
    /// NOOP interval on an idle session (0 = disabled).
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_sec: u64,
    /// Chunk size for streamed transfers (bytes).
    #[serde(default = "default_chunk")]
    pub chunk_size: usize,
    /// Friendly label used in log lines.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_connect_timeout() -> u64 {
    15
}
fn default_command_timeout() -> u64 {
    30
}
fn default_data_timeout() -> u64 {
    30
}
fn default_keepalive() -> u64 {
    60
}
fn default_chunk() -> usize {
    65_536
}

impl FtpConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: ServerEndpoint::new(host, default_port(), username, password),
            show_hidden_files: false,
            data_channel_mode: DataChannelMode::Passive,
            active_bind_address: None,
            initial_directory: None,
            connect_timeout_sec: default_connect_timeout(),
            command_timeout_sec: default_command_timeout(),
            data_timeout_sec: default_data_timeout(),
            keepalive_interval_sec: default_keepalive(),
            chunk_size: default_chunk(),
            label: None,
        }
    }

    /// Build a config from `ftp://[user[:pass]@]host[:port][/initial/dir]`.
    pub fn from_url(raw: &str) -> FtpResult<Self> {
        let url = url::Url::parse(raw)?;
        if url.scheme() != "ftp" {
            return Err(FtpError::invalid_config(format!(
                "Unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| FtpError::invalid_config("FTP URL has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let username = match url.username() {
            "" => default_username(),
            u => decode_component(u)?,
        };
        let password = match url.password() {
            Some(p) => decode_component(p)?,
            None => default_password(),
        };

        let mut config = Self::new(host, username, password);
        config.endpoint.port = url.port_or_known_default().unwrap_or(default_port());
        let path = decode_component(url.path())?;
        if !path.is_empty() && path != "/" {
            config.initial_directory = Some(path);
        }
        Ok(config)
    }

    /// Parse a JSON document (camelCase keys) and validate it.
    pub fn from_json(raw: &str) -> FtpResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FtpResult<()> {
        if self.endpoint.host.trim().is_empty() {
            return Err(FtpError::invalid_config("Host must not be empty"));
        }
        if self.endpoint.port == 0 {
            return Err(FtpError::invalid_config("Port must not be 0"));
        }
        if self.chunk_size == 0 {
            return Err(FtpError::invalid_config("Chunk size must be positive"));
        }
        if self.connect_timeout_sec == 0 || self.command_timeout_sec == 0 || self.data_timeout_sec == 0 {
            return Err(FtpError::invalid_config("Timeouts must be positive"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_sec)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_sec)
    }

    /// Name used in log lines.
    pub fn display_name(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("{}@{}", self.endpoint.username, self.endpoint.address()))
    }
}

fn decode_component(raw: &str) -> FtpResult<String> {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| FtpError::invalid_config(format!("Invalid UTF-8 in FTP URL: {}", e)))
}

/// Control-session lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Idle,
    AwaitingReply,
    Closed,
}

/// Snapshot of a control session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub state: SessionState,
    pub current_directory: Option<String>,
    pub server_banner: Option<String>,
    pub transfer_type: Option<TransferType>,
    pub last_reply_code: Option<u16>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

// ─── Directory Listing ───────────────────────────────────────────────

/// Type of a remote filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    Unknown,
}

/// One entry from a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Permission string as listed, e.g. `rwxr-xr-x`.
    pub permissions: Option<String>,
    /// Permission bits decoded from `permissions`.
    pub mode: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub link_target: Option<String>,
    pub hidden: bool,
    /// Raw line from the server.
    pub raw: String,
}

/// Sorting field for directory listings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    Name,
    Size,
    Modified,
    Kind,
}

/// Sort order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Post-processing applied to a parsed listing.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    /// Glob pattern on the entry name (e.g. "*.txt").
    pub filter: Option<String>,
    pub sort_by: Option<SortField>,
    pub sort_order: Option<SortOrder>,
    /// Overrides `FtpConfig::show_hidden_files` when set.
    pub show_hidden: Option<bool>,
}

// ─── Operations / Transfer ───────────────────────────────────────────

/// Kind of a caller-visible operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    List,
    NameList,
    MakeDirectory,
    RemoveDirectory,
    Delete,
    Rename,
    ChangeDirectory,
    Size,
    Upload,
    Download,
}

/// Progress snapshot delivered to a progress callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub operation_id: String,
    pub kind: OperationKind,
    pub remote_path: String,
    /// Cumulative bytes moved over the data channel.
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    /// Present only when `total_bytes` is known and non-zero.
    pub percent: Option<f32>,
    pub speed_bps: u64,
}

// ─── FTP Reply ───────────────────────────────────────────────────────

/// Reply category from the first digit of the code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReplyClass {
    PositivePreliminary,
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

/// A single FTP reply (may be multi-line).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyCode {
    pub code: u16,
    pub lines: Vec<String>,
}

impl ReplyCode {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![format!("{} {}", code, message.into())],
        }
    }

    pub fn class(&self) -> ReplyClass {
        match self.code / 100 {
            1 => ReplyClass::PositivePreliminary,
            2 => ReplyClass::PositiveCompletion,
            3 => ReplyClass::PositiveIntermediate,
            4 => ReplyClass::TransientNegative,
            _ => ReplyClass::PermanentNegative,
        }
    }

    /// Full reply text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Text of the last line without the code prefix.
    pub fn message(&self) -> &str {
        self.lines
            .last()
            .map(|l| l.get(4..).unwrap_or("").trim())
            .unwrap_or("")
    }

    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// 4xx or 5xx.
    pub fn is_failure(&self) -> bool {
        self.code >= 400
    }

    /// Convert a failure reply into an error, pass anything else through.
    pub fn into_result(self) -> FtpResult<Self> {
        if self.is_failure() {
            Err(FtpError::from_reply(self.code, &self.text()))
        } else {
            Ok(self)
        }
    }
}
