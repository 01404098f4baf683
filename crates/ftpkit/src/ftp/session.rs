//! Control session: owns the control connection and its state machine.
//!
//! Lifecycle: `Disconnected` → `connect()` → `Authenticating` → `login()`
//! → `Idle`. Each command moves the session to `AwaitingReply` until a
//! final (non-1xx) reply arrives; a 1xx reply leaves it there until
//! `read_final_reply()` or `abort()`. Transport failures, timeouts,
//! malformed replies and 421 all end in `Closed`, which is terminal.
//!
//! Directory helpers built on top of this live in `directory.rs`.

use crate::ftp::connection;
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::protocol::{Command, FtpCodec};
use crate::ftp::types::*;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// Replies read while draining after ABOR before giving up.
const MAX_ABORT_REPLIES: usize = 8;
/// How long to wait for a possible second reply after ABOR.
const ABORT_GRACE: Duration = Duration::from_millis(750);

/// One authenticated (or authenticating) FTP control connection.
pub struct ControlSession {
    id: String,
    endpoint: ServerEndpoint,
    connect_timeout: Duration,
    command_timeout: Duration,
    codec: Option<FtpCodec>,
    state: SessionState,
    current_directory: Option<String>,
    transfer_type: Option<TransferType>,
    banner: Option<String>,
    last_reply_code: Option<u16>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    connected_at: Option<DateTime<Utc>>,
    last_activity: DateTime<Utc>,
    pub(crate) bytes_uploaded: u64,
    pub(crate) bytes_downloaded: u64,
}

impl ControlSession {
    pub fn new(endpoint: ServerEndpoint, connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            endpoint,
            connect_timeout,
            command_timeout,
            codec: None,
            state: SessionState::Disconnected,
            current_directory: None,
            transfer_type: None,
            banner: None,
            last_reply_code: None,
            local_addr: None,
            peer_addr: None,
            connected_at: None,
            last_activity: Utc::now(),
            bytes_uploaded: 0,
            bytes_downloaded: 0,
        }
    }

    pub fn from_config(config: &FtpConfig) -> Self {
        Self::new(config.endpoint.clone(), config.connect_timeout(), config.command_timeout())
    }

    /// Connect, log in and enter the configured initial directory.
    pub async fn open(config: &FtpConfig) -> FtpResult<Self> {
        config.validate()?;
        let mut session = Self::from_config(config);
        session.connect().await?;
        let (user, pass) = (config.endpoint.username.clone(), config.endpoint.password.clone());
        session.login(&user, &pass).await?;

        match config.initial_directory.as_deref() {
            Some(dir) => {
                session.change_directory(dir).await?;
            }
            None => {
                if let Ok(cwd) = session.pwd().await {
                    session.current_directory = Some(cwd);
                }
            }
        }
        Ok(session)
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub fn current_directory(&self) -> Option<&str> {
        self.current_directory.as_deref()
    }

    pub fn transfer_type(&self) -> Option<TransferType> {
        self.transfer_type
    }

    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Diagnostics snapshot.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            username: self.endpoint.username.clone(),
            state: self.state,
            current_directory: self.current_directory.clone(),
            server_banner: self.banner.clone(),
            transfer_type: self.transfer_type,
            last_reply_code: self.last_reply_code,
            connected_at: self.connected_at,
            last_activity: self.last_activity,
            bytes_uploaded: self.bytes_uploaded,
            bytes_downloaded: self.bytes_downloaded,
        }
    }

    // ─── Connect / login ─────────────────────────────────────────

    /// Open the control connection and read the greeting.
    pub async fn connect(&mut self) -> FtpResult<ReplyCode> {
        match self.state {
            SessionState::Disconnected => {}
            SessionState::Closed => return Err(FtpError::transport("Session is closed")),
            other => {
                return Err(FtpError::invalid_argument(format!(
                    "connect() called while {:?}",
                    other
                )))
            }
        }

        self.transition(SessionState::Connecting);
        match connection::connect(&self.endpoint, self.connect_timeout, self.command_timeout).await {
            Ok(conn) => {
                self.codec = Some(conn.codec);
                self.local_addr = Some(conn.local_addr);
                self.peer_addr = Some(conn.peer_addr);
                self.banner = Some(conn.banner.text());
                self.last_reply_code = Some(conn.banner.code);
                self.connected_at = Some(Utc::now());
                self.touch();
                self.transition(SessionState::Authenticating);
                Ok(conn.banner)
            }
            Err(e) => {
                warn!("FTP connect to {} failed: {}", self.endpoint.address(), e);
                self.close();
                Err(e)
            }
        }
    }

    /// USER/PASS exchange. Any failure closes the session.
    pub async fn login(&mut self, username: &str, password: &str) -> FtpResult<()> {
        match self.state {
            SessionState::Authenticating => {}
            SessionState::Closed => return Err(FtpError::transport("Session is closed")),
            SessionState::Idle | SessionState::AwaitingReply => {
                return Err(FtpError::invalid_argument("Session is already logged in"))
            }
            _ => return Err(FtpError::not_logged_in("connect() must complete before login()")),
        }

        match self.login_exchange(username, password).await {
            Ok(()) => {
                self.transition(SessionState::Idle);
                info!("FTP session {} logged in to {} as {}", self.id, self.endpoint.address(), username);
                Ok(())
            }
            Err(e) => {
                self.close();
                let code = e.code;
                let mut err = FtpError::auth_failed(e.message);
                err.code = code;
                Err(err)
            }
        }
    }

    async fn login_exchange(&mut self, username: &str, password: &str) -> FtpResult<()> {
        let mut reply = self.exchange(&Command::User(username.to_string())).await?;
        if reply.code == 331 {
            reply = self.exchange(&Command::Pass(password.to_string())).await?;
        }
        if reply.is_completion() {
            Ok(())
        } else {
            Err(FtpError::auth_failed(format!("Login failed: {}", reply.text())).with_code(reply.code))
        }
    }

    // ─── Commands ────────────────────────────────────────────────

    /// Send one command and return the first reply.
    ///
    /// A 1xx reply leaves the session in `AwaitingReply`; the caller must
    /// follow up with `read_final_reply()` or `abort()`.
    pub async fn send_command(&mut self, command: &Command) -> FtpResult<ReplyCode> {
        self.ensure_idle()?;
        self.transition(SessionState::AwaitingReply);
        let result = self.exchange(command).await;
        match &result {
            Ok(reply) if reply.is_preliminary() => {}
            _ if self.is_closed() => {}
            _ => self.transition(SessionState::Idle),
        }
        result
    }

    /// Read the final reply of a command that answered with 1xx.
    pub async fn read_final_reply(&mut self) -> FtpResult<ReplyCode> {
        match self.state {
            SessionState::AwaitingReply => {}
            SessionState::Closed => return Err(FtpError::transport("Session is closed")),
            other => {
                return Err(FtpError::invalid_argument(format!(
                    "No reply is pending (session is {:?})",
                    other
                )))
            }
        }
        loop {
            let result = match self.codec.as_mut() {
                Some(codec) => codec.read_reply().await,
                None => Err(FtpError::transport("Control connection is closed")),
            };
            let reply = self.absorb(result)?;
            if !reply.is_preliminary() {
                self.transition(SessionState::Idle);
                return Ok(reply);
            }
        }
    }

    /// Send a command, follow any 1xx through to the final reply.
    pub async fn execute(&mut self, command: &Command) -> FtpResult<ReplyCode> {
        let reply = self.send_command(command).await?;
        if reply.is_preliminary() {
            self.read_final_reply().await
        } else {
            Ok(reply)
        }
    }

    /// Execute and require a 2xx reply.
    pub async fn expect_ok(&mut self, command: &Command) -> FtpResult<ReplyCode> {
        let reply = self.execute(command).await?;
        if reply.is_completion() {
            Ok(reply)
        } else {
            Err(FtpError::from_reply(reply.code, &reply.text()))
        }
    }

    pub async fn noop(&mut self) -> FtpResult<()> {
        self.expect_ok(&Command::Noop).await?;
        Ok(())
    }

    /// Switch TYPE, skipping the round trip when already set.
    pub async fn set_transfer_type(&mut self, transfer_type: TransferType) -> FtpResult<()> {
        if self.transfer_type == Some(transfer_type) {
            return Ok(());
        }
        self.expect_ok(&Command::Type(transfer_type)).await?;
        self.transfer_type = Some(transfer_type);
        Ok(())
    }

    /// CWD into `path` and refresh the current directory.
    pub async fn change_directory(&mut self, path: &str) -> FtpResult<String> {
        self.expect_ok(&Command::Cwd(path.to_string())).await?;
        let cwd = match self.pwd().await {
            Ok(cwd) => cwd,
            Err(e) if e.is_fatal() => return Err(e),
            Err(_) => path.to_string(),
        };
        self.current_directory = Some(cwd.clone());
        Ok(cwd)
    }

    // ─── ABOR / QUIT ─────────────────────────────────────────────

    /// Send ABOR and drain the replies of the interrupted exchange.
    ///
    /// Allowed while a reply is pending. Unparseable lines left over from
    /// an interrupted read are skipped. Failure closes the session.
    pub async fn abort(&mut self) -> FtpResult<()> {
        let was_pending = match self.state {
            SessionState::AwaitingReply => true,
            SessionState::Idle => false,
            SessionState::Closed => return Err(FtpError::transport("Session is closed")),
            _ => return Err(FtpError::not_logged_in("Nothing to abort before login")),
        };
        self.transition(SessionState::AwaitingReply);

        let command_timeout = self.command_timeout;
        let result = match self.codec.as_mut() {
            Some(codec) => {
                let r = drain_abort(codec, was_pending, command_timeout).await;
                codec.set_reply_timeout(command_timeout);
                r
            }
            None => Err(FtpError::transport("Control connection is closed")),
        };

        match result {
            Ok(code) => {
                self.last_reply_code = Some(code);
                self.touch();
                self.transition(SessionState::Idle);
                debug!("FTP session {} aborted pending exchange", self.id);
                Ok(())
            }
            Err(e) => {
                warn!("FTP session {}: ABOR failed: {}", self.id, e);
                self.close();
                Err(e)
            }
        }
    }

    /// Send QUIT when possible and close.
    pub async fn quit(&mut self) -> FtpResult<()> {
        if matches!(self.state, SessionState::Idle | SessionState::Authenticating) {
            if let Some(codec) = self.codec.as_mut() {
                let _ = codec.execute(&Command::Quit).await;
            }
        }
        self.close();
        Ok(())
    }

    /// Drop the control connection. Terminal.
    pub fn close(&mut self) {
        self.codec = None;
        self.transition(SessionState::Closed);
    }

    // ─── Internals ───────────────────────────────────────────────

    fn ensure_idle(&self) -> FtpResult<()> {
        match self.state {
            SessionState::Idle => Ok(()),
            SessionState::AwaitingReply => {
                Err(FtpError::session_busy("A command is already awaiting its reply"))
            }
            SessionState::Closed => Err(FtpError::transport("Session is closed")),
            SessionState::Disconnected | SessionState::Connecting | SessionState::Authenticating => {
                Err(FtpError::not_logged_in("Session is not logged in"))
            }
        }
    }

    /// Write a command and read one reply, applying the close rules.
    async fn exchange(&mut self, command: &Command) -> FtpResult<ReplyCode> {
        let result = match self.codec.as_mut() {
            Some(codec) => codec.execute(command).await,
            None => Err(FtpError::transport("Control connection is closed")),
        };
        self.absorb(result)
    }

    fn absorb(&mut self, result: FtpResult<ReplyCode>) -> FtpResult<ReplyCode> {
        match result {
            Ok(reply) => {
                self.last_reply_code = Some(reply.code);
                self.touch();
                if reply.code == 421 {
                    warn!("FTP session {}: server closing: {}", self.id, reply.message());
                    self.close();
                    return Err(FtpError::from_reply(reply.code, &reply.text()));
                }
                Ok(reply)
            }
            Err(e) => {
                if e.is_fatal() {
                    warn!("FTP session {}: {}", self.id, e);
                    self.close();
                }
                Err(e)
            }
        }
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            debug!("FTP session {}: {:?} -> {:?}", self.id, self.state, to);
            self.state = to;
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub(crate) fn set_current_directory(&mut self, cwd: String) {
        self.current_directory = Some(cwd);
    }
}

/// Send ABOR and consume replies until the exchange is settled.
///
/// With a transfer pending the server answers twice (the transfer's own
/// final reply, then ABOR's), though some send only one; the second read
/// uses a short grace period.
async fn drain_abort(codec: &mut FtpCodec, was_pending: bool, command_timeout: Duration) -> FtpResult<u16> {
    codec.send(&Command::Abor).await?;
    let expected = if was_pending { 2 } else { 1 };
    let mut finals = 0;
    let mut last = 0;

    for _ in 0..MAX_ABORT_REPLIES {
        match codec.read_reply().await {
            Ok(reply) if reply.is_preliminary() => continue,
            Ok(reply) if reply.code == 421 => {
                return Err(FtpError::from_reply(reply.code, &reply.text()));
            }
            Ok(reply) => {
                finals += 1;
                last = reply.code;
                if finals >= expected {
                    return Ok(last);
                }
                codec.set_reply_timeout(ABORT_GRACE);
            }
            Err(e) if e.kind == FtpErrorKind::MalformedReply => {
                debug!("Skipping unparseable line after ABOR: {}", e.message);
                continue;
            }
            Err(e) if e.kind == FtpErrorKind::Timeout && finals > 0 => {
                return Ok(last);
            }
            Err(e) => return Err(e),
        }
    }

    if finals > 0 {
        Ok(last)
    } else {
        Err(FtpError::malformed_reply(format!(
            "No reply to ABOR within {:?}",
            command_timeout
        )))
    }
}

/// Parse `257 "/some/path"` into the path string. Doubled quotes inside
/// the path stand for a literal quote.
pub fn parse_quoted_path(text: &str) -> Option<String> {
    let start = text.find('"')?;
    let mut out = String::new();
    let mut chars = text[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
            } else {
                return Some(out);
            }
        } else {
            out.push(c);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::mock_server::{MockServer, MockState};

    async fn logged_in(server: &MockServer) -> ControlSession {
        ControlSession::open(&server.config()).await.unwrap()
    }

    #[tokio::test]
    async fn login_reaches_idle() {
        let server = MockServer::start(MockState::default()).await;
        let mut session = ControlSession::from_config(&server.config());
        assert_eq!(session.state(), SessionState::Disconnected);

        let banner = session.connect().await.unwrap();
        assert_eq!(banner.code, 220);
        assert_eq!(session.state(), SessionState::Authenticating);

        session.login("user", "secret").await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.info().server_banner.as_deref(), Some("220 Ready"));
    }

    #[tokio::test]
    async fn bad_credentials_close_session() {
        let server = MockServer::start(MockState::default()).await;
        let mut session = ControlSession::from_config(&server.config());
        session.connect().await.unwrap();

        let err = session.login("user", "wrong").await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::AuthenticationFailed);
        assert_eq!(err.code, Some(530));
        assert_eq!(session.state(), SessionState::Closed);

        let err = session.noop().await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Transport);
    }

    #[tokio::test]
    async fn commands_before_login_are_refused() {
        let server = MockServer::start(MockState::default()).await;
        let mut session = ControlSession::from_config(&server.config());
        let err = session.send_command(&Command::Pwd).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::NotLoggedIn);

        session.connect().await.unwrap();
        let err = session.send_command(&Command::Pwd).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::NotLoggedIn);
        assert_eq!(server.count("PWD"), 0);
    }

    #[tokio::test]
    async fn open_records_working_directory() {
        let server = MockServer::start(MockState {
            dirs: vec!["/".into(), "/pub".into()],
            ..Default::default()
        })
        .await;
        let mut config = server.config();
        config.initial_directory = Some("/pub".into());
        let session = ControlSession::open(&config).await.unwrap();
        assert_eq!(session.current_directory(), Some("/pub"));
    }

    #[tokio::test]
    async fn interrupted_exchange_blocks_until_abort() {
        let server = MockServer::start(MockState {
            silent_verbs: vec!["SITE".into()],
            ..Default::default()
        })
        .await;
        let mut session = logged_in(&server).await;

        let silent = Command::Raw { verb: "SITE".into(), args: Some("IDLE".into()) };
        let r = tokio::time::timeout(Duration::from_millis(200), session.send_command(&silent)).await;
        assert!(r.is_err());
        assert_eq!(session.state(), SessionState::AwaitingReply);

        let err = session.send_command(&Command::Noop).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::SessionBusy);

        session.abort().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        session.noop().await.unwrap();
        assert_eq!(server.count("ABOR"), 1);
    }

    #[tokio::test]
    async fn abort_when_idle_reads_single_reply() {
        let server = MockServer::start(MockState::default()).await;
        let mut session = logged_in(&server).await;
        session.abort().await.unwrap();
        assert_eq!(session.info().last_reply_code, Some(225));
        session.noop().await.unwrap();
    }

    #[tokio::test]
    async fn service_closing_reply_closes_session() {
        let server = MockServer::start(MockState {
            noop_reply: Some("421 Service closing control connection".into()),
            ..Default::default()
        })
        .await;
        let mut session = logged_in(&server).await;
        let err = session.noop().await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Transport);
        assert_eq!(err.code, Some(421));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn command_timeout_closes_session() {
        let server = MockServer::start(MockState {
            silent_verbs: vec!["NOOP".into()],
            ..Default::default()
        })
        .await;
        let mut config = server.config();
        config.command_timeout_sec = 1;
        let mut session = ControlSession::open(&config).await.unwrap();
        let err = session.noop().await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Timeout);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn rejected_command_keeps_session_idle() {
        let server = MockServer::start(MockState::default()).await;
        let mut session = logged_in(&server).await;
        let err = session.change_directory("/missing").await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::CommandRejected);
        assert_eq!(err.code, Some(550));
        assert!(session.is_idle());
    }

    #[tokio::test]
    async fn transfer_type_is_cached() {
        let server = MockServer::start(MockState::default()).await;
        let mut session = logged_in(&server).await;
        session.set_transfer_type(TransferType::Binary).await.unwrap();
        session.set_transfer_type(TransferType::Binary).await.unwrap();
        session.set_transfer_type(TransferType::Ascii).await.unwrap();
        assert_eq!(server.count("TYPE"), 2);
        assert_eq!(session.transfer_type(), Some(TransferType::Ascii));
    }

    #[tokio::test]
    async fn quit_is_terminal() {
        let server = MockServer::start(MockState::default()).await;
        let mut session = logged_in(&server).await;
        session.quit().await.unwrap();
        assert!(session.is_closed());
        assert_eq!(session.connect().await.unwrap_err().kind, FtpErrorKind::Transport);
        assert_eq!(server.count("QUIT"), 1);
    }

    #[test]
    fn quoted_path_parsing() {
        assert_eq!(parse_quoted_path("257 \"/home/user\" is cwd").as_deref(), Some("/home/user"));
        assert_eq!(parse_quoted_path("257 \"/a \"\"b\"\"\" created").as_deref(), Some("/a \"b\""));
        assert_eq!(parse_quoted_path("257 no quotes"), None);
    }
}
