//! Low-level FTP command/response codec (RFC 959 §4).
//!
//! Handles:
//! - Encoding typed commands terminated with `\r\n`
//! - Reading single-line and multi-line replies with bounded buffers
//! - Parsing the 3-digit reply code

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{ReplyCode, TransferType};
use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

/// Longest accepted reply line, CRLF included.
pub const MAX_REPLY_LINE: usize = 8 * 1024;
/// Most lines accepted in one multi-line reply.
pub const MAX_REPLY_LINES: usize = 1024;

// ─── Commands ────────────────────────────────────────────────────────

/// A control-channel command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass(String),
    Cwd(String),
    Cdup,
    Pwd,
    Type(TransferType),
    Pasv,
    Epsv,
    Port(SocketAddrV4),
    Eprt(SocketAddr),
    List(Option<String>),
    Nlst(Option<String>),
    Stor(String),
    Retr(String),
    Mkd(String),
    Rmd(String),
    Dele(String),
    Rnfr(String),
    Rnto(String),
    Size(String),
    Syst,
    Noop,
    Abor,
    Quit,
    /// Any other verb, sent verbatim.
    Raw { verb: String, args: Option<String> },
}

impl Command {
    pub fn verb(&self) -> &str {
        match self {
            Self::User(_) => "USER",
            Self::Pass(_) => "PASS",
            Self::Cwd(_) => "CWD",
            Self::Cdup => "CDUP",
            Self::Pwd => "PWD",
            Self::Type(_) => "TYPE",
            Self::Pasv => "PASV",
            Self::Epsv => "EPSV",
            Self::Port(_) => "PORT",
            Self::Eprt(_) => "EPRT",
            Self::List(_) => "LIST",
            Self::Nlst(_) => "NLST",
            Self::Stor(_) => "STOR",
            Self::Retr(_) => "RETR",
            Self::Mkd(_) => "MKD",
            Self::Rmd(_) => "RMD",
            Self::Dele(_) => "DELE",
            Self::Rnfr(_) => "RNFR",
            Self::Rnto(_) => "RNTO",
            Self::Size(_) => "SIZE",
            Self::Syst => "SYST",
            Self::Noop => "NOOP",
            Self::Abor => "ABOR",
            Self::Quit => "QUIT",
            Self::Raw { verb, .. } => verb,
        }
    }

    pub fn args(&self) -> Option<String> {
        match self {
            Self::User(a)
            | Self::Pass(a)
            | Self::Cwd(a)
            | Self::Stor(a)
            | Self::Retr(a)
            | Self::Mkd(a)
            | Self::Rmd(a)
            | Self::Dele(a)
            | Self::Rnfr(a)
            | Self::Rnto(a)
            | Self::Size(a) => Some(a.clone()),
            Self::List(a) | Self::Nlst(a) => a.clone(),
            Self::Raw { args, .. } => args.clone(),
            Self::Type(t) => Some(t.code().to_string()),
            Self::Port(addr) => {
                let o = addr.ip().octets();
                let port = addr.port();
                Some(format!(
                    "{},{},{},{},{},{}",
                    o[0],
                    o[1],
                    o[2],
                    o[3],
                    port >> 8,
                    port & 0xff
                ))
            }
            Self::Eprt(addr) => {
                let af = match addr.ip() {
                    IpAddr::V4(_) => 1,
                    IpAddr::V6(_) => 2,
                };
                Some(format!("|{}|{}|{}|", af, addr.ip(), addr.port()))
            }
            Self::Cdup | Self::Pwd | Self::Pasv | Self::Epsv | Self::Syst | Self::Noop | Self::Abor | Self::Quit => None,
        }
    }
}

/// Log-safe rendering: the PASS argument is masked.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, self.args()) {
            (Self::Pass(_), _) => write!(f, "PASS ****"),
            (_, Some(args)) => write!(f, "{} {}", self.verb(), args),
            (_, None) => write!(f, "{}", self.verb()),
        }
    }
}

/// Serialise a command to its wire form, CRLF-terminated.
///
/// Arguments containing CR or LF are rejected so a path cannot smuggle a
/// second command onto the control channel.
pub fn encode(command: &Command) -> FtpResult<Vec<u8>> {
    let verb = command.verb();
    if verb.is_empty() || !verb.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(FtpError::invalid_argument(format!("Invalid FTP verb '{}'", verb)));
    }
    let mut line = verb.to_string();
    if let Some(args) = command.args() {
        if args.contains('\r') || args.contains('\n') {
            return Err(FtpError::invalid_argument(format!(
                "{} argument contains a line break",
                verb
            )));
        }
        line.push(' ');
        line.push_str(&args);
    }
    line.push_str("\r\n");
    Ok(line.into_bytes())
}

// ─── Reply parsing ───────────────────────────────────────────────────

/// Incrementally assembles one reply from individual lines.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    code: Option<u16>,
    lines: Vec<String>,
}

impl ReplyAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a reply has begun but is not yet terminated.
    pub fn in_progress(&self) -> bool {
        self.code.is_some()
    }

    /// Feed one line (without CRLF). Returns the reply once it is complete.
    pub fn push_line(&mut self, line: &str) -> FtpResult<Option<ReplyCode>> {
        let code = match self.code {
            None => {
                let code = parse_code(line)?;
                self.lines.push(line.to_string());
                // "NNN-" opens a multi-line reply, anything else is single-line.
                if line.as_bytes().get(3) == Some(&b'-') {
                    self.code = Some(code);
                    return Ok(None);
                }
                return Ok(Some(self.finish(code)));
            }
            Some(code) => code,
        };

        if self.lines.len() >= MAX_REPLY_LINES {
            return Err(FtpError::malformed_reply(format!(
                "Reply {} exceeds {} lines",
                code, MAX_REPLY_LINES
            )));
        }
        self.lines.push(line.to_string());
        if is_terminator(line, code) {
            Ok(Some(self.finish(code)))
        } else {
            Ok(None)
        }
    }

    fn finish(&mut self, code: u16) -> ReplyCode {
        self.code = None;
        ReplyCode {
            code,
            lines: std::mem::take(&mut self.lines),
        }
    }
}

/// Parse a complete, buffered reply (lines separated by LF or CRLF).
pub fn parse_reply_text(text: &str) -> FtpResult<ReplyCode> {
    let mut assembler = ReplyAssembler::new();
    for line in text.lines() {
        if let Some(reply) = assembler.push_line(line.trim_end_matches('\r'))? {
            return Ok(reply);
        }
    }
    Err(FtpError::malformed_reply(format!(
        "Reply is not terminated: '{}'",
        text.trim_end()
    )))
}

/// Parse the 3-digit reply code from the start of a line.
fn parse_code(line: &str) -> FtpResult<u16> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(FtpError::malformed_reply(format!("Invalid reply code in: '{}'", line)));
    }
    if let Some(sep) = bytes.get(3) {
        if *sep != b' ' && *sep != b'-' {
            return Err(FtpError::malformed_reply(format!("Invalid reply separator in: '{}'", line)));
        }
    }
    let code: u16 = line[..3]
        .parse()
        .map_err(|_| FtpError::malformed_reply(format!("Invalid reply code in: '{}'", line)))?;
    if !(100..600).contains(&code) {
        return Err(FtpError::malformed_reply(format!("Reply code {} out of range", code)));
    }
    Ok(code)
}

fn is_terminator(line: &str, code: u16) -> bool {
    let prefix = code.to_string();
    line.starts_with(&prefix) && (line.len() == 3 || line.as_bytes()[3] == b' ')
}

// ─── Codec ───────────────────────────────────────────────────────────

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The FTP command/response codec operating on split halves.
pub struct FtpCodec {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    reply_timeout: Duration,
}

impl FtpCodec {
    pub fn new<R, W>(reader: R, writer: W, reply_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: BufReader::new(Box::new(reader)),
            writer: Box::new(writer),
            reply_timeout,
        }
    }

    /// Create a codec from a plain TCP stream.
    pub fn from_tcp(stream: TcpStream, reply_timeout: Duration) -> Self {
        let (rd, wr) = stream.into_split();
        Self::new(rd, wr, reply_timeout)
    }

    pub fn set_reply_timeout(&mut self, reply_timeout: Duration) {
        self.reply_timeout = reply_timeout;
    }

    /// Send a command.
    pub async fn send(&mut self, command: &Command) -> FtpResult<()> {
        let bytes = encode(command)?;
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| FtpError::transport(format!("Control write failed: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| FtpError::transport(format!("Control flush failed: {}", e)))?;
        log::trace!(">>> {}", command);
        Ok(())
    }

    /// Read a single line (CRLF stripped), bounded by `MAX_REPLY_LINE`.
    async fn read_line(&mut self) -> FtpResult<String> {
        let mut buf = Vec::new();
        let n = (&mut self.reader)
            .take(MAX_REPLY_LINE as u64)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| FtpError::transport(format!("Control read failed: {}", e)))?;
        if n == 0 {
            return Err(FtpError::transport("Server closed control connection"));
        }
        if buf.last() != Some(&b'\n') {
            if buf.len() >= MAX_REPLY_LINE {
                return Err(FtpError::malformed_reply(format!(
                    "Reply line exceeds {} bytes",
                    MAX_REPLY_LINE
                )));
            }
            return Err(FtpError::transport("Control connection closed mid-reply"));
        }
        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Read a complete FTP reply (possibly multi-line).
    ///
    /// Multi-line replies look like:
    /// ```text
    /// 220-Welcome to my FTP server
    /// 220-This is line 2
    /// 220 End of greeting
    /// ```
    pub async fn read_reply(&mut self) -> FtpResult<ReplyCode> {
        let deadline = Instant::now() + self.reply_timeout;
        let mut assembler = ReplyAssembler::new();
        loop {
            let line = match timeout_at(deadline, self.read_line()).await {
                Ok(line) => line?,
                Err(_) if assembler.in_progress() => {
                    return Err(FtpError::malformed_reply(format!(
                        "Reply terminator not received within {:?}",
                        self.reply_timeout
                    )))
                }
                Err(_) => {
                    return Err(FtpError::timeout(format!(
                        "No reply within {:?}",
                        self.reply_timeout
                    )))
                }
            };
            if let Some(reply) = assembler.push_line(&line)? {
                log::trace!("<<< {}", reply.lines.last().map(String::as_str).unwrap_or(""));
                return Ok(reply);
            }
        }
    }

    /// Send a command and return the reply.
    pub async fn execute(&mut self, command: &Command) -> FtpResult<ReplyCode> {
        self.send(command).await?;
        self.read_reply().await
    }
}
