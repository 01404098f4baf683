//! Transfer engine: drives one `PendingOperation` to its terminal result.
//!
//! Every await on the control or data channel is raced against the
//! operation's cancel signal. After a failure `settle()` puts the control
//! session back into a usable state (ABOR) or closes it.

use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::operation::{CancelSignal, OperationOutput, OperationRequest, PendingOperation};
use crate::ftp::parser;
use crate::ftp::protocol::Command;
use crate::ftp::session::ControlSession;
use crate::ftp::transfer::{self, DataChannelHandle, DataChannelSettings};
use crate::ftp::types::*;
use log::{debug, warn};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Race `fut` against cancellation.
async fn guarded<T>(cancel: &CancelSignal, fut: impl Future<Output = FtpResult<T>>) -> FtpResult<T> {
    let mut signal = cancel.clone();
    tokio::select! {
        biased;
        _ = signal.cancelled() => Err(FtpError::cancelled("Operation cancelled")),
        result = fut => result,
    }
}

async fn read_chunk(stream: &mut TcpStream, buf: &mut [u8], idle: Duration) -> FtpResult<usize> {
    match timeout(idle, stream.read(buf)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(FtpError::transport(format!("Data read failed: {}", e))),
        Err(_) => Err(FtpError::data_channel_timeout(format!("No data received for {:?}", idle))),
    }
}

async fn write_chunk(stream: &mut TcpStream, data: &[u8], idle: Duration) -> FtpResult<()> {
    match timeout(idle, stream.write_all(data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(FtpError::transport(format!("Data write failed: {}", e))),
        Err(_) => Err(FtpError::data_channel_timeout(format!("Data write stalled for {:?}", idle))),
    }
}

/// `dir/.name.1a2b3c4d.part` next to the download target.
fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let tag = Uuid::new_v4().simple().to_string();
    target.with_file_name(format!(".{}.{}.part", name, &tag[..8]))
}

async fn create_partial(partial: &Path) -> FtpResult<fs::File> {
    if let Some(parent) = partial.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| FtpError::io_error(format!("Cannot create {}: {}", parent.display(), e)))?;
    }
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(partial)
        .await
        .map_err(|e| FtpError::io_error(format!("Cannot create {}: {}", partial.display(), e)))
}

pub struct TransferEngine<'a> {
    session: &'a mut ControlSession,
    settings: &'a DataChannelSettings,
    chunk_size: usize,
    show_hidden: bool,
    cancel: CancelSignal,
}

impl<'a> TransferEngine<'a> {
    pub fn new(
        session: &'a mut ControlSession,
        settings: &'a DataChannelSettings,
        chunk_size: usize,
        show_hidden: bool,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            session,
            settings,
            chunk_size: chunk_size.max(1),
            show_hidden,
            cancel,
        }
    }

    pub fn from_config(
        session: &'a mut ControlSession,
        settings: &'a DataChannelSettings,
        config: &FtpConfig,
        cancel: CancelSignal,
    ) -> Self {
        Self::new(session, settings, config.chunk_size, config.show_hidden_files, cancel)
    }

    /// Run the operation's request. Does not deliver the completion; the
    /// caller passes the result to `PendingOperation::finish`.
    pub async fn execute(&mut self, op: &mut PendingOperation) -> FtpResult<OperationOutput> {
        if self.cancel.is_cancelled() {
            return Err(FtpError::cancelled("Operation cancelled before it started"));
        }
        debug!("Operation {} starting: {:?}", op.id, op.request);

        let result = match op.request.clone() {
            OperationRequest::List { path, options } => {
                self.list(path.as_deref(), &options).await.map(OperationOutput::Entries)
            }
            OperationRequest::NameList { path } => {
                self.name_list(path.as_deref()).await.map(OperationOutput::Names)
            }
            OperationRequest::MakeDirectory { path } => {
                guarded(&self.cancel, self.session.mkdir(&path)).await.map(OperationOutput::Path)
            }
            OperationRequest::RemoveDirectory { path } => {
                guarded(&self.cancel, self.session.rmdir(&path)).await.map(|_| OperationOutput::Done)
            }
            OperationRequest::Delete { path } => {
                guarded(&self.cancel, self.session.delete(&path)).await.map(|_| OperationOutput::Done)
            }
            OperationRequest::Rename { from, to } => {
                guarded(&self.cancel, self.session.rename(&from, &to)).await.map(|_| OperationOutput::Done)
            }
            OperationRequest::ChangeDirectory { path } => {
                guarded(&self.cancel, self.session.change_directory(&path)).await.map(OperationOutput::Path)
            }
            OperationRequest::Size { path } => {
                guarded(&self.cancel, self.session.size(&path)).await.map(OperationOutput::Size)
            }
            OperationRequest::Upload { local_path, remote_path } => {
                self.upload(op, &local_path, &remote_path).await.map(OperationOutput::Bytes)
            }
            OperationRequest::Download { remote_path, local_path, expected_size } => self
                .download(op, &remote_path, &local_path, expected_size)
                .await
                .map(OperationOutput::Bytes),
        };

        if let Err(ref e) = result {
            self.settle(e).await;
        }
        result
    }

    /// Leave the session Idle or Closed after a failure.
    async fn settle(&mut self, error: &FtpError) {
        if self.session.is_closed() {
            return;
        }
        if error.kind == FtpErrorKind::Transport {
            warn!("Closing FTP session {} after transport error", self.session.id());
            self.session.close();
            return;
        }
        if self.session.state() == SessionState::AwaitingReply {
            if let Err(e) = self.session.abort().await {
                warn!("ABOR after failed operation did not settle the session: {}", e);
            }
        }
    }

    // ─── Listing ─────────────────────────────────────────────────

    async fn list(&mut self, path: Option<&str>, options: &ListOptions) -> FtpResult<Vec<DirectoryEntry>> {
        let show_hidden = options.show_hidden.unwrap_or(self.show_hidden);
        let body = self.retrieve_text(Command::List(path.map(str::to_string))).await?;
        let entries = parser::parse_listing(&body, show_hidden);
        debug!("LIST {} returned {} entries", path.unwrap_or("."), entries.len());
        parser::apply_options(entries, options)
    }

    async fn name_list(&mut self, path: Option<&str>) -> FtpResult<Vec<String>> {
        let body = self.retrieve_text(Command::Nlst(path.map(str::to_string))).await?;
        Ok(parser::parse_name_list(&body))
    }

    /// TYPE A, data channel, command, read to EOF, final reply.
    async fn retrieve_text(&mut self, command: Command) -> FtpResult<String> {
        guarded(&self.cancel, self.session.set_transfer_type(TransferType::Ascii)).await?;
        let handle = guarded(&self.cancel, transfer::negotiate(self.session, self.settings)).await?;
        let mut stream = self.start_transfer(handle, &command).await?;

        let idle = self.settings.data_timeout;
        let mut body = Vec::new();
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = guarded(&self.cancel, read_chunk(&mut stream, &mut buf, idle)).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        }
        drop(stream);

        self.finish_transfer().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    // ─── Download (RETR) ─────────────────────────────────────────

    async fn download(
        &mut self,
        op: &mut PendingOperation,
        remote_path: &str,
        local_path: &Path,
        expected_size: u64,
    ) -> FtpResult<u64> {
        guarded(&self.cancel, self.session.set_transfer_type(TransferType::Binary)).await?;

        // The caller's size wins; SIZE only fills in when none was given.
        let total = if expected_size > 0 {
            Some(expected_size)
        } else {
            match guarded(&self.cancel, self.session.size(remote_path)).await {
                Ok(size) => Some(size),
                Err(e) if e.is_cancelled() || e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!("SIZE {} unavailable: {}", remote_path, e);
                    None
                }
            }
        };

        let handle = guarded(&self.cancel, transfer::negotiate(self.session, self.settings)).await?;
        let stream = self.start_transfer(handle, &Command::Retr(remote_path.to_string())).await?;

        // Nothing local is touched until RETR is accepted; bytes land in a
        // sibling partial file that replaces the target only on success.
        let partial = partial_path(local_path);
        let mut file = create_partial(&partial).await?;
        let result = self.receive_into(op, stream, &mut file, total).await;
        drop(file);

        let result = match result {
            Ok(n) => fs::rename(&partial, local_path).await.map(|_| n).map_err(|e| {
                FtpError::io_error(format!("Cannot move download into {}: {}", local_path.display(), e))
            }),
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Err(e) = fs::remove_file(&partial).await {
                warn!("Could not remove partial download {}: {}", partial.display(), e);
            }
        }
        result
    }

    async fn receive_into(
        &mut self,
        op: &mut PendingOperation,
        mut stream: TcpStream,
        file: &mut fs::File,
        total: Option<u64>,
    ) -> FtpResult<u64> {
        let idle = self.settings.data_timeout;
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = guarded(&self.cancel, read_chunk(&mut stream, &mut buf, idle)).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .await
                .map_err(|e| FtpError::io_error(format!("Local write failed: {}", e)))?;
            self.session.bytes_downloaded += n as u64;
            op.record_bytes(n as u64, total);
        }
        file.flush()
            .await
            .map_err(|e| FtpError::io_error(format!("Local flush failed: {}", e)))?;
        drop(stream);

        self.finish_transfer().await?;
        Ok(op.bytes_transferred)
    }

    // ─── Upload (STOR) ───────────────────────────────────────────

    async fn upload(&mut self, op: &mut PendingOperation, local_path: &Path, remote_path: &str) -> FtpResult<u64> {
        let mut file = fs::File::open(local_path)
            .await
            .map_err(|e| FtpError::io_error(format!("Cannot open {}: {}", local_path.display(), e)))?;
        let total = file.metadata().await.ok().map(|m| m.len());

        guarded(&self.cancel, self.session.set_transfer_type(TransferType::Binary)).await?;
        let handle = guarded(&self.cancel, transfer::negotiate(self.session, self.settings)).await?;
        let mut stream = self.start_transfer(handle, &Command::Stor(remote_path.to_string())).await?;

        let idle = self.settings.data_timeout;
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = guarded(&self.cancel, async {
                file.read(&mut buf)
                    .await
                    .map_err(|e| FtpError::io_error(format!("Local read failed: {}", e)))
            })
            .await?;
            if n == 0 {
                break;
            }
            if let Err(e) = guarded(&self.cancel, write_chunk(&mut stream, &buf[..n], idle)).await {
                if e.kind == FtpErrorKind::Transport {
                    drop(stream);
                    return Err(self.reply_after_write_failure(e).await);
                }
                return Err(e);
            }
            self.session.bytes_uploaded += n as u64;
            op.record_bytes(n as u64, total);
        }

        if let Err(e) = stream.shutdown().await {
            drop(stream);
            let e = FtpError::transport(format!("Data shutdown failed: {}", e));
            return Err(self.reply_after_write_failure(e).await);
        }
        drop(stream);

        self.finish_transfer().await?;
        Ok(op.bytes_transferred)
    }

    /// The server usually closes the data connection because it rejected
    /// the upload; prefer its reply over the socket error.
    async fn reply_after_write_failure(&mut self, write_error: FtpError) -> FtpError {
        match guarded(&self.cancel, self.session.read_final_reply()).await {
            Ok(reply) if reply.is_failure() => FtpError::from_reply(reply.code, &reply.text()),
            Ok(_) => write_error,
            Err(e) if e.is_cancelled() => e,
            Err(e) => {
                debug!("No final reply after data write failure: {}", e);
                write_error
            }
        }
    }

    // ─── Shared transfer steps ───────────────────────────────────

    /// Send the transfer command and bring up the data connection.
    async fn start_transfer(&mut self, handle: DataChannelHandle, command: &Command) -> FtpResult<TcpStream> {
        let reply = guarded(&self.cancel, self.session.send_command(command)).await?.into_result()?;
        if !reply.is_preliminary() {
            return Err(FtpError::command_rejected(
                reply.code,
                format!("Unexpected reply to {}: {}", command.verb(), reply.text()),
            ));
        }
        guarded(&self.cancel, handle.establish(self.settings.data_timeout)).await
    }

    /// Read the reply that closes a transfer; anything but 2xx fails.
    async fn finish_transfer(&mut self) -> FtpResult<ReplyCode> {
        let reply = guarded(&self.cancel, self.session.read_final_reply()).await?;
        if reply.is_completion() {
            Ok(reply)
        } else {
            Err(FtpError::from_reply(reply.code, &reply.text()))
        }
    }
}
