//! TCP transport: establishes the FTP control connection.
//!
//! Handles the connect timeout and the server greeting, including the
//! "120 service ready in nnn minutes" preamble some servers send first.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::FtpCodec;
use crate::ftp::types::{ReplyCode, ServerEndpoint};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A freshly opened control connection.
pub struct ControlConnection {
    pub codec: FtpCodec,
    pub banner: ReplyCode,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// Open the control connection and return a ready-to-use codec **plus**
/// the server's 220 greeting.
pub async fn connect(
    endpoint: &ServerEndpoint,
    connect_timeout: Duration,
    reply_timeout: Duration,
) -> FtpResult<ControlConnection> {
    let addr = endpoint.address();

    let tcp = timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::timeout(format!("TCP connect to {} timed out", addr)))?
        .map_err(|e| FtpError::transport(format!("TCP connect to {}: {}", addr, e)))?;

    tcp.set_nodelay(true).ok();
    let local_addr = tcp
        .local_addr()
        .map_err(|e| FtpError::transport(format!("local_addr: {}", e)))?;
    let peer_addr = tcp
        .peer_addr()
        .map_err(|e| FtpError::transport(format!("peer_addr: {}", e)))?;

    let mut codec = FtpCodec::from_tcp(tcp, reply_timeout);
    let banner = read_banner(&mut codec).await?;
    log::debug!("Connected to {} ({}): {}", addr, peer_addr, banner.message());

    Ok(ControlConnection {
        codec,
        banner,
        local_addr,
        peer_addr,
    })
}

/// Wait for the 220 greeting, skipping any 120 preamble.
pub async fn read_banner(codec: &mut FtpCodec) -> FtpResult<ReplyCode> {
    loop {
        let reply = codec.read_reply().await?;
        match reply.code {
            220 => return Ok(reply),
            120 => {
                log::debug!("Server not ready yet: {}", reply.message());
                continue;
            }
            code if reply.is_failure() => return Err(FtpError::from_reply(code, &reply.text())),
            code => {
                return Err(FtpError::malformed_reply(format!(
                    "Unexpected greeting {}: {}",
                    code,
                    reply.text()
                )))
            }
        }
    }
}
