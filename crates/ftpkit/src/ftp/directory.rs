//! Single-command remote operations: PWD, CDUP, MKD, RMD, DELE,
//! RNFR/RNTO, SIZE and SYST.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::Command;
use crate::ftp::session::{parse_quoted_path, ControlSession};

impl ControlSession {
    // ─── PWD / CDUP ─────────────────────────────────────────────

    /// Ask the server for its working directory.
    pub async fn pwd(&mut self) -> FtpResult<String> {
        let reply = self.expect_ok(&Command::Pwd).await?;
        parse_quoted_path(&reply.text())
            .ok_or_else(|| FtpError::malformed_reply(format!("Cannot parse PWD: {}", reply.text())))
    }

    /// Move to the parent directory.
    pub async fn cdup(&mut self) -> FtpResult<String> {
        self.expect_ok(&Command::Cdup).await?;
        let cwd = self.pwd().await?;
        self.set_current_directory(cwd.clone());
        Ok(cwd)
    }

    // ─── MKD / RMD ──────────────────────────────────────────────

    /// Create a directory; returns the path the server reports.
    pub async fn mkdir(&mut self, path: &str) -> FtpResult<String> {
        let reply = self.expect_ok(&Command::Mkd(path.to_string())).await?;
        // "257 \"/new/dir\" created", though some servers omit the path.
        Ok(parse_quoted_path(&reply.text()).unwrap_or_else(|| path.to_string()))
    }

    /// Remove an empty directory.
    pub async fn rmdir(&mut self, path: &str) -> FtpResult<()> {
        self.expect_ok(&Command::Rmd(path.to_string())).await?;
        Ok(())
    }

    // ─── DELE / RNFR+RNTO ───────────────────────────────────────

    /// Delete a remote file.
    pub async fn delete(&mut self, path: &str) -> FtpResult<()> {
        self.expect_ok(&Command::Dele(path.to_string())).await?;
        Ok(())
    }

    /// Rename (or move) a file or directory.
    pub async fn rename(&mut self, from: &str, to: &str) -> FtpResult<()> {
        let rnfr = self.execute(&Command::Rnfr(from.to_string())).await?;
        if !rnfr.is_intermediate() {
            return Err(FtpError::from_reply(rnfr.code, &rnfr.text()));
        }
        self.expect_ok(&Command::Rnto(to.to_string())).await?;
        Ok(())
    }

    // ─── SIZE / SYST ────────────────────────────────────────────

    /// Size of a remote file in bytes (RFC 3659 SIZE).
    pub async fn size(&mut self, path: &str) -> FtpResult<u64> {
        let reply = self.expect_ok(&Command::Size(path.to_string())).await?;
        // "213 12345"
        reply
            .message()
            .split_whitespace()
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| FtpError::malformed_reply(format!("Cannot parse SIZE: {}", reply.text())))
    }

    /// The server's SYST string, e.g. "UNIX Type: L8".
    pub async fn system_type(&mut self) -> FtpResult<String> {
        let reply = self.expect_ok(&Command::Syst).await?;
        Ok(reply.message().to_string())
    }
}
