//! Data-channel management for FTP transfers.
//!
//! Supports four modes (RFC 959 + RFC 2428):
//! - **PASV**: server opens a port, client connects
//! - **EPSV**: extended passive (IPv6-ready)
//! - **PORT**: client opens a port, tells server
//! - **EPRT**: extended active (IPv6-ready)
//!
//! Passive handles are connected before the transfer command is sent.
//! Active handles hold the listener; the server dials in only after the
//! transfer command, so the accept happens in `DataChannelHandle::establish`.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::Command;
use crate::ftp::session::ControlSession;
use crate::ftp::types::{DataChannelMode, FtpConfig};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

lazy_static! {
    static ref PASV_RE: Regex = Regex::new(r"(\d+),\s*(\d+),\s*(\d+),\s*(\d+),\s*(\d+),\s*(\d+)").unwrap();
    static ref EPSV_RE: Regex = Regex::new(r"\(([^\d\s])([^\d\s])([^\d\s])(\d+)([^\d\s])\)").unwrap();
}

/// The data connection of exactly one operation.
pub enum DataChannelHandle {
    /// Passive: already connected to the server.
    Connected(TcpStream),
    /// Active: waiting for the server to dial in.
    Listening(TcpListener),
}

impl DataChannelHandle {
    /// Yield the connected stream, accepting the server's connection
    /// first in active mode.
    pub async fn establish(self, data_timeout: Duration) -> FtpResult<TcpStream> {
        match self {
            Self::Connected(stream) => Ok(stream),
            Self::Listening(listener) => {
                let (stream, peer) = timeout(data_timeout, listener.accept())
                    .await
                    .map_err(|_| {
                        FtpError::data_channel_timeout(format!(
                            "Server did not connect within {:?}",
                            data_timeout
                        ))
                    })?
                    .map_err(|e| FtpError::transport(format!("Data accept: {}", e)))?;
                debug!("Data connection accepted from {}", peer);
                Ok(stream)
            }
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Listening(_))
    }
}

/// How to open data channels for one session.
#[derive(Debug, Clone)]
pub struct DataChannelSettings {
    pub mode: DataChannelMode,
    /// Local address advertised in PORT/EPRT; defaults to the control
    /// connection's local address.
    pub active_ip: Option<IpAddr>,
    pub data_timeout: Duration,
}

impl DataChannelSettings {
    pub fn from_config(config: &FtpConfig) -> FtpResult<Self> {
        let active_ip = match config.active_bind_address.as_deref() {
            Some(raw) => Some(raw.parse::<IpAddr>().map_err(|_| {
                FtpError::invalid_config(format!("Invalid active bind address '{}'", raw))
            })?),
            None => None,
        };
        Ok(Self {
            mode: config.data_channel_mode,
            active_ip,
            data_timeout: config.data_timeout(),
        })
    }
}

/// Open a data channel according to the configured mode.
pub async fn negotiate(
    session: &mut ControlSession,
    settings: &DataChannelSettings,
) -> FtpResult<DataChannelHandle> {
    let extended = settings.mode.is_extended();
    if settings.mode.is_passive() {
        let (handle, _) = open_passive(session, extended, settings.data_timeout).await?;
        Ok(handle)
    } else {
        open_active(session, settings.active_ip, 0, extended).await
    }
}

// ─── PASV / EPSV ─────────────────────────────────────────────────────

/// Issue `PASV` (or `EPSV`), connect to the advertised address.
///
/// EPSV rejected as unknown (500/502) falls back to PASV.
pub async fn open_passive(
    session: &mut ControlSession,
    extended: bool,
    data_timeout: Duration,
) -> FtpResult<(DataChannelHandle, SocketAddr)> {
    let peer_ip = session
        .peer_addr()
        .map(|a| a.ip())
        .ok_or_else(|| FtpError::transport("Control connection has no peer address"))?;

    let addr = if extended {
        let reply = session.execute(&Command::Epsv).await?;
        match reply.code {
            229 => Some(SocketAddr::new(peer_ip, parse_epsv_response(&reply.text())?)),
            500 | 501 | 502 => {
                debug!("EPSV not supported ({}), falling back to PASV", reply.code);
                None
            }
            code => return Err(FtpError::from_reply(code, &reply.text())),
        }
    } else {
        None
    };

    let addr = match addr {
        Some(addr) => addr,
        None => {
            let reply = session.expect_ok(&Command::Pasv).await?;
            let addr = parse_pasv_response(&reply.text())?;
            if addr.ip().is_unspecified() {
                SocketAddr::new(peer_ip, addr.port())
            } else {
                addr
            }
        }
    };

    let stream = timeout(data_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            FtpError::data_channel_timeout(format!("Data connect to {} timed out", addr))
        })?
        .map_err(|e| FtpError::transport(format!("Data connect to {}: {}", addr, e)))?;
    stream.set_nodelay(true).ok();
    debug!("Data connection open to {}", addr);
    Ok((DataChannelHandle::Connected(stream), addr))
}

/// Parse `(h1,h2,h3,h4,p1,p2)` from a 227 reply.
pub fn parse_pasv_response(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_RE
        .captures(text)
        .ok_or_else(|| FtpError::malformed_reply(format!("Cannot parse PASV: {}", text)))?;

    let mut nums = [0u8; 6];
    for (i, n) in nums.iter_mut().enumerate() {
        *n = caps[i + 1]
            .parse::<u8>()
            .map_err(|_| FtpError::malformed_reply(format!("PASV number out of range: {}", text)))?;
    }

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = (nums[4] as u16) << 8 | nums[5] as u16;
    Ok(SocketAddr::new(ip, port))
}

/// Parse the port from `229 Entering Extended Passive Mode (|||port|)`.
pub fn parse_epsv_response(text: &str) -> FtpResult<u16> {
    let caps = EPSV_RE
        .captures(text)
        .ok_or_else(|| FtpError::malformed_reply(format!("Cannot parse EPSV: {}", text)))?;
    // All four delimiters must be the same character.
    let delim = &caps[1];
    if [&caps[2], &caps[3], &caps[5]].iter().any(|d| *d != delim) {
        return Err(FtpError::malformed_reply(format!("Mismatched EPSV delimiters: {}", text)));
    }
    match caps[4].parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(FtpError::malformed_reply(format!("EPSV port out of range: {}", text))),
    }
}

// ─── PORT / EPRT ─────────────────────────────────────────────────────

/// Bind a local listener and announce it with `PORT` (or `EPRT`).
///
/// Port 0 binds an ephemeral port. Without `local_ip` the control
/// connection's local address is used.
pub async fn open_active(
    session: &mut ControlSession,
    local_ip: Option<IpAddr>,
    local_port: u16,
    extended: bool,
) -> FtpResult<DataChannelHandle> {
    let ip = match local_ip.or_else(|| session.local_addr().map(|a| a.ip())) {
        Some(ip) => ip,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };

    let listener = TcpListener::bind(SocketAddr::new(ip, local_port))
        .await
        .map_err(|e| FtpError::transport(format!("Data listener bind on {}: {}", ip, e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| FtpError::transport(format!("Data listener address: {}", e)))?;

    let command = match (extended, local) {
        (true, addr) => Command::Eprt(addr),
        (false, SocketAddr::V4(v4)) => Command::Port(SocketAddrV4::new(*v4.ip(), v4.port())),
        (false, SocketAddr::V6(_)) => {
            return Err(FtpError::invalid_argument(
                "PORT requires an IPv4 address, use extended active mode for IPv6",
            ))
        }
    };
    session.expect_ok(&command).await?;
    debug!("Listening for data connection on {}", local);
    Ok(DataChannelHandle::Listening(listener))
}
