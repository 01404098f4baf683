//! Client façade: the public entry points.
//!
//! One `FtpClient` owns at most one control session, opened lazily on the
//! first operation and reused until it is closed. Every entry point spawns a
//! worker task and returns an `OperationHandle` straight away; results arrive
//! through the caller's completion callback, exactly once. Only one operation
//! runs at a time; a start while another is active is rejected with
//! `SessionBusy` through its own callback.

use crate::ftp::engine::TransferEngine;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::operation::{
    CancelSignal, CompletionCallback, OperationHandle, OperationOutput, OperationRequest, PendingOperation,
    ProgressCallback, SlotGuard,
};
use crate::ftp::session::ControlSession;
use crate::ftp::transfer::DataChannelSettings;
use crate::ftp::types::*;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tokio::sync::{oneshot, Mutex};
use tokio::task::{self, JoinHandle};
use tokio::time;

/// Receives errors that belong to no operation (keepalive failures).
pub type ErrorHook = Arc<dyn Fn(&FtpError) + Send + Sync>;

struct ClientInner {
    config: FtpConfig,
    settings: DataChannelSettings,
    session: Mutex<Option<ControlSession>>,
    slot: Arc<AtomicBool>,
    error_hook: StdMutex<Option<ErrorHook>>,
}

pub struct FtpClient {
    inner: Arc<ClientInner>,
    handle: Handle,
    owned_runtime: Option<Runtime>,
    keepalive: Option<JoinHandle<()>>,
}

impl FtpClient {
    /// Validate `config` and build a client. Nothing is sent until the first
    /// operation starts.
    ///
    /// Workers run on the current tokio runtime; outside one, the client
    /// starts a small runtime of its own.
    pub fn new(config: FtpConfig) -> FtpResult<Self> {
        config.validate()?;
        let settings = DataChannelSettings::from_config(&config)?;

        let (handle, owned_runtime) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("ftpkit-worker")
                    .enable_all()
                    .build()?;
                (runtime.handle().clone(), Some(runtime))
            }
        };

        let keepalive_interval = config.keepalive_interval_sec;
        let inner = Arc::new(ClientInner {
            config,
            settings,
            session: Mutex::new(None),
            slot: Arc::new(AtomicBool::new(false)),
            error_hook: StdMutex::new(None),
        });

        let keepalive = (keepalive_interval > 0).then(|| {
            spawn_keepalive(&handle, Arc::downgrade(&inner), Duration::from_secs(keepalive_interval))
        });

        info!("FTP client created for {}", inner.config.display_name());
        Ok(Self {
            inner,
            handle,
            owned_runtime,
            keepalive,
        })
    }

    /// Install a hook for out-of-band errors.
    pub fn with_error_hook(self, hook: impl Fn(&FtpError) + Send + Sync + 'static) -> Self {
        if let Ok(mut slot) = self.inner.error_hook.lock() {
            *slot = Some(Arc::new(hook));
        }
        self
    }

    pub fn config(&self) -> &FtpConfig {
        &self.inner.config
    }

    // ─── Listing ─────────────────────────────────────────────────

    /// List `path` (or the working directory) with the configured defaults.
    pub fn list_directory(
        &self,
        path: Option<&str>,
        on_complete: impl FnOnce(FtpResult<Vec<DirectoryEntry>>) + Send + 'static,
    ) -> OperationHandle {
        self.list_directory_with(path, ListOptions::default(), on_complete)
    }

    /// List with a glob filter, sorting or a hidden-file override.
    pub fn list_directory_with(
        &self,
        path: Option<&str>,
        options: ListOptions,
        on_complete: impl FnOnce(FtpResult<Vec<DirectoryEntry>>) + Send + 'static,
    ) -> OperationHandle {
        let request = OperationRequest::List {
            path: non_empty(path),
            options,
        };
        self.start(request, None, typed(on_complete, |out| match out {
            OperationOutput::Entries(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }))
    }

    /// Blocking listing. Must not be called from a current-thread runtime,
    /// whose only thread would be the one waiting.
    pub fn list_directory_sync(&self, path: Option<&str>) -> FtpResult<Vec<DirectoryEntry>> {
        let in_runtime = match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                return Err(FtpError::invalid_argument(
                    "list_directory_sync cannot block a current-thread runtime",
                ));
            }
            Ok(_) => true,
            Err(_) => false,
        };
        let (tx, rx) = oneshot::channel();
        let _handle = self.list_directory(path, move |result| {
            let _ = tx.send(result);
        });
        let received = if in_runtime {
            task::block_in_place(|| rx.blocking_recv())
        } else {
            rx.blocking_recv()
        };
        received.unwrap_or_else(|_| Err(FtpError::cancelled("Listing worker stopped before completing")))
    }

    /// Bare file names (NLST).
    pub fn name_list(
        &self,
        path: Option<&str>,
        on_complete: impl FnOnce(FtpResult<Vec<String>>) + Send + 'static,
    ) -> OperationHandle {
        let request = OperationRequest::NameList { path: non_empty(path) };
        self.start(request, None, typed(on_complete, |out| match out {
            OperationOutput::Names(names) => Ok(names),
            other => Err(unexpected(other)),
        }))
    }

    // ─── Single-command operations ───────────────────────────────

    /// Create a directory; completes with the path the server created.
    pub fn make_directory(
        &self,
        path: &str,
        on_complete: impl FnOnce(FtpResult<String>) + Send + 'static,
    ) -> OperationHandle {
        let request = OperationRequest::MakeDirectory { path: path.to_string() };
        self.start(request, None, typed(on_complete, into_path))
    }

    pub fn remove_directory(
        &self,
        path: &str,
        on_complete: impl FnOnce(FtpResult<()>) + Send + 'static,
    ) -> OperationHandle {
        let request = OperationRequest::RemoveDirectory { path: path.to_string() };
        self.start(request, None, typed(on_complete, into_unit))
    }

    pub fn delete_file(&self, path: &str, on_complete: impl FnOnce(FtpResult<()>) + Send + 'static) -> OperationHandle {
        let request = OperationRequest::Delete { path: path.to_string() };
        self.start(request, None, typed(on_complete, into_unit))
    }

    pub fn rename(
        &self,
        from: &str,
        to: &str,
        on_complete: impl FnOnce(FtpResult<()>) + Send + 'static,
    ) -> OperationHandle {
        let request = OperationRequest::Rename {
            from: from.to_string(),
            to: to.to_string(),
        };
        self.start(request, None, typed(on_complete, into_unit))
    }

    /// CWD; completes with the new working directory.
    pub fn change_directory(
        &self,
        path: &str,
        on_complete: impl FnOnce(FtpResult<String>) + Send + 'static,
    ) -> OperationHandle {
        let request = OperationRequest::ChangeDirectory { path: path.to_string() };
        self.start(request, None, typed(on_complete, into_path))
    }

    pub fn file_size(&self, path: &str, on_complete: impl FnOnce(FtpResult<u64>) + Send + 'static) -> OperationHandle {
        let request = OperationRequest::Size { path: path.to_string() };
        self.start(request, None, typed(on_complete, |out| match out {
            OperationOutput::Size(size) => Ok(size),
            other => Err(unexpected(other)),
        }))
    }

    // ─── Transfers ───────────────────────────────────────────────

    /// Upload a local file; completes with the number of bytes sent.
    pub fn upload_file(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
        on_progress: impl FnMut(&TransferProgress) + Send + 'static,
        on_complete: impl FnOnce(FtpResult<u64>) + Send + 'static,
    ) -> OperationHandle {
        let request = OperationRequest::Upload {
            local_path: local_path.as_ref().to_path_buf(),
            remote_path: remote_path.to_string(),
        };
        self.start(request, Some(Box::new(on_progress)), typed(on_complete, into_bytes))
    }

    /// Download into `local_path`. A non-zero `expected_size` is used as the
    /// progress total; with 0 the server is asked via SIZE.
    pub fn download_file(
        &self,
        remote_path: &str,
        expected_size: u64,
        local_path: impl AsRef<Path>,
        on_progress: impl FnMut(&TransferProgress) + Send + 'static,
        on_complete: impl FnOnce(FtpResult<u64>) + Send + 'static,
    ) -> OperationHandle {
        let request = OperationRequest::Download {
            remote_path: remote_path.to_string(),
            local_path: local_path.as_ref().to_path_buf(),
            expected_size,
        };
        self.start(request, Some(Box::new(on_progress)), typed(on_complete, into_bytes))
    }

    // ─── Session lifecycle ───────────────────────────────────────

    /// Send QUIT and drop the session. The next operation reconnects.
    pub async fn disconnect(&self) -> FtpResult<()> {
        let session = self.inner.session.lock().await.take();
        match session {
            Some(mut session) => {
                let result = session.quit().await;
                info!("FTP session {} disconnected", session.id());
                result
            }
            None => Ok(()),
        }
    }

    pub async fn session_state(&self) -> SessionState {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(SessionState::Disconnected)
    }

    pub async fn session_info(&self) -> Option<SessionInfo> {
        self.inner.session.lock().await.as_ref().map(|s| s.info())
    }

    pub async fn current_directory(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.current_directory().map(str::to_string))
    }

    /// True while an operation holds the session.
    pub fn is_busy(&self) -> bool {
        self.inner.slot.load(Ordering::SeqCst)
    }

    // ─── Dispatch ────────────────────────────────────────────────

    fn start(
        &self,
        request: OperationRequest,
        progress: Option<ProgressCallback>,
        completion: CompletionCallback,
    ) -> OperationHandle {
        let kind = request.kind();
        let (cancel_tx, cancel) = CancelSignal::new();
        let op = PendingOperation::new(request, progress, completion);
        let id = op.id.clone();

        let join = if let Err(e) = validate_request(&op.request) {
            self.handle.spawn(async move { op.finish(Err(e)) })
        } else {
            match SlotGuard::try_acquire(&self.inner.slot) {
                Some(slot) => {
                    debug!("Operation {} ({:?}) accepted", id, kind);
                    let inner = self.inner.clone();
                    self.handle.spawn(run_operation(inner, op.with_slot(slot), cancel))
                }
                None => {
                    warn!("Operation {} ({:?}) rejected: session busy", id, kind);
                    self.handle.spawn(async move {
                        op.finish(Err(FtpError::session_busy("Another operation is in progress")))
                    })
                }
            }
        };
        OperationHandle::new(id, kind, cancel_tx, join)
    }
}

impl Drop for FtpClient {
    fn drop(&mut self) {
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
        if let Some(runtime) = self.owned_runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// ─── Worker ──────────────────────────────────────────────────────────

async fn run_operation(inner: Arc<ClientInner>, mut op: PendingOperation, cancel: CancelSignal) {
    let result = inner.perform(&mut op, cancel).await;
    match &result {
        Ok(_) => debug!("Operation {} completed", op.id),
        Err(e) => warn!("Operation {} failed: {}", op.id, e),
    }
    op.finish(result);
}

impl ClientInner {
    async fn perform(&self, op: &mut PendingOperation, cancel: CancelSignal) -> FtpResult<OperationOutput> {
        let mut guard = self.session.lock().await;
        let session = self.ensure_session(&mut guard, &cancel).await?;
        let result = TransferEngine::from_config(session, &self.settings, &self.config, cancel)
            .execute(op)
            .await;

        if guard.as_ref().map_or(false, |s| s.is_closed()) {
            info!("FTP session to {} closed; reconnecting on next operation", self.config.display_name());
            *guard = None;
        }
        result
    }

    /// The live session, opened (connect + login) if there is none.
    async fn ensure_session<'s>(
        &self,
        slot: &'s mut Option<ControlSession>,
        cancel: &CancelSignal,
    ) -> FtpResult<&'s mut ControlSession> {
        if slot.as_ref().map_or(true, |s| s.is_closed()) {
            *slot = None;
            let mut signal = cancel.clone();
            let session = tokio::select! {
                biased;
                _ = signal.cancelled() => return Err(FtpError::cancelled("Operation cancelled while connecting")),
                opened = ControlSession::open(&self.config) => opened?,
            };
            *slot = Some(session);
        }
        slot.as_mut()
            .ok_or_else(|| FtpError::transport("No control session available"))
    }

    /// NOOP on an idle live session; a failure drops the session.
    async fn keepalive(&self) {
        if self.slot.load(Ordering::SeqCst) {
            return;
        }
        let Ok(mut guard) = self.session.try_lock() else {
            return;
        };
        let Some(session) = guard.as_mut().filter(|s| s.is_idle()) else {
            return;
        };
        if let Err(e) = session.noop().await {
            warn!("Keepalive to {} failed: {}", self.config.display_name(), e);
            *guard = None;
            drop(guard);
            self.report(&e);
        }
    }

    fn report(&self, error: &FtpError) {
        let hook = self.error_hook.lock().ok().and_then(|h| h.clone());
        if let Some(hook) = hook {
            hook(error);
        }
    }
}

fn spawn_keepalive(handle: &Handle, inner: Weak<ClientInner>, interval: Duration) -> JoinHandle<()> {
    handle.spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.keepalive().await;
        }
    })
}

// ─── Helpers ─────────────────────────────────────────────────────────

fn validate_request(request: &OperationRequest) -> FtpResult<()> {
    let needs_remote = !matches!(
        request,
        OperationRequest::List { .. } | OperationRequest::NameList { .. }
    );
    if needs_remote && request.remote_path().trim().is_empty() {
        return Err(FtpError::invalid_argument("Remote path must not be empty"));
    }
    if let OperationRequest::Rename { to, .. } = request {
        if to.trim().is_empty() {
            return Err(FtpError::invalid_argument("Rename target must not be empty"));
        }
    }
    if request.local_path().map_or(false, |p| p.as_os_str().is_empty()) {
        return Err(FtpError::invalid_argument("Local path must not be empty"));
    }
    Ok(())
}

fn non_empty(path: Option<&str>) -> Option<String> {
    path.filter(|p| !p.trim().is_empty()).map(str::to_string)
}

/// Adapt a typed callback to the engine's `OperationOutput`.
fn typed<T>(
    on_complete: impl FnOnce(FtpResult<T>) + Send + 'static,
    extract: fn(OperationOutput) -> FtpResult<T>,
) -> CompletionCallback
where
    T: 'static,
{
    Box::new(move |result: FtpResult<OperationOutput>| on_complete(result.and_then(extract)))
}

fn unexpected(output: OperationOutput) -> FtpError {
    FtpError::malformed_reply(format!("Unexpected operation output: {:?}", output))
}

fn into_path(out: OperationOutput) -> FtpResult<String> {
    match out {
        OperationOutput::Path(path) => Ok(path),
        other => Err(unexpected(other)),
    }
}

fn into_unit(out: OperationOutput) -> FtpResult<()> {
    match out {
        OperationOutput::Done => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn into_bytes(out: OperationOutput) -> FtpResult<u64> {
    match out {
        OperationOutput::Bytes(n) => Ok(n),
        other => Err(unexpected(other)),
    }
}
