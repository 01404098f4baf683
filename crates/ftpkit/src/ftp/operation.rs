//! In-flight operations: requests, callbacks, cancellation and the
//! single-operation slot.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{DirectoryEntry, ListOptions, OperationKind, TransferProgress};
use log::debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub type CompletionCallback = Box<dyn FnOnce(FtpResult<OperationOutput>) + Send>;
pub type ProgressCallback = Box<dyn FnMut(&TransferProgress) + Send>;

/// What an operation should do.
#[derive(Debug, Clone)]
pub enum OperationRequest {
    List { path: Option<String>, options: ListOptions },
    NameList { path: Option<String> },
    MakeDirectory { path: String },
    RemoveDirectory { path: String },
    Delete { path: String },
    Rename { from: String, to: String },
    ChangeDirectory { path: String },
    Size { path: String },
    Upload { local_path: PathBuf, remote_path: String },
    Download { remote_path: String, local_path: PathBuf, expected_size: u64 },
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::List { .. } => OperationKind::List,
            Self::NameList { .. } => OperationKind::NameList,
            Self::MakeDirectory { .. } => OperationKind::MakeDirectory,
            Self::RemoveDirectory { .. } => OperationKind::RemoveDirectory,
            Self::Delete { .. } => OperationKind::Delete,
            Self::Rename { .. } => OperationKind::Rename,
            Self::ChangeDirectory { .. } => OperationKind::ChangeDirectory,
            Self::Size { .. } => OperationKind::Size,
            Self::Upload { .. } => OperationKind::Upload,
            Self::Download { .. } => OperationKind::Download,
        }
    }

    /// Remote path the operation targets ("" for the working directory).
    pub fn remote_path(&self) -> &str {
        match self {
            Self::List { path, .. } | Self::NameList { path } => path.as_deref().unwrap_or(""),
            Self::MakeDirectory { path }
            | Self::RemoveDirectory { path }
            | Self::Delete { path }
            | Self::ChangeDirectory { path }
            | Self::Size { path } => path,
            Self::Rename { from, .. } => from,
            Self::Upload { remote_path, .. } | Self::Download { remote_path, .. } => remote_path,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Self::Upload { local_path, .. } | Self::Download { local_path, .. } => Some(local_path),
            _ => None,
        }
    }
}

/// Result payload of a successful operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutput {
    Entries(Vec<DirectoryEntry>),
    Names(Vec<String>),
    /// Created directory or new working directory.
    Path(String),
    /// Bytes moved by an upload or download.
    Bytes(u64),
    Size(u64),
    Done,
}

// ─── Cancellation ────────────────────────────────────────────────────

/// Receiving side of an operation's cancel signal.
#[derive(Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self(rx))
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. A dropped sender means the
    /// caller gave up the handle, not that it cancelled: wait forever.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ─── Operation slot ──────────────────────────────────────────────────

/// Holds the façade's single operation slot until dropped.
pub struct SlotGuard(Arc<AtomicBool>);

impl SlotGuard {
    pub fn try_acquire(slot: &Arc<AtomicBool>) -> Option<Self> {
        slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(slot.clone()))
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ─── PendingOperation ────────────────────────────────────────────────

/// One in-flight request and its callbacks.
///
/// The completion callback runs exactly once: through `finish()`, or with
/// `Cancelled` if the operation is dropped unfinished.
pub struct PendingOperation {
    pub id: String,
    pub request: OperationRequest,
    pub bytes_transferred: u64,
    started: Instant,
    progress: Option<ProgressCallback>,
    completion: Option<CompletionCallback>,
    slot: Option<SlotGuard>,
}

impl PendingOperation {
    pub fn new(
        request: OperationRequest,
        progress: Option<ProgressCallback>,
        completion: CompletionCallback,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request,
            bytes_transferred: 0,
            started: Instant::now(),
            progress,
            completion: Some(completion),
            slot: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_slot(mut self, slot: SlotGuard) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.request.kind()
    }

    /// Count `n` more bytes and notify the progress callback.
    pub fn record_bytes(&mut self, n: u64, total: Option<u64>) {
        self.bytes_transferred += n;
        let Some(progress) = self.progress.as_mut() else {
            return;
        };
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed_bps = if elapsed > 0.0 {
            (self.bytes_transferred as f64 / elapsed) as u64
        } else {
            0
        };
        let percent = match total {
            Some(t) if t > 0 => Some(((self.bytes_transferred as f64 / t as f64) * 100.0).min(100.0) as f32),
            _ => None,
        };
        let snapshot = TransferProgress {
            operation_id: self.id.clone(),
            kind: self.request.kind(),
            remote_path: self.request.remote_path().to_string(),
            bytes_transferred: self.bytes_transferred,
            total_bytes: total,
            percent,
            speed_bps,
        };
        progress(&snapshot);
    }

    /// Deliver the terminal result.
    pub fn finish(mut self, result: FtpResult<OperationOutput>) {
        self.deliver(result);
    }

    fn deliver(&mut self, result: FtpResult<OperationOutput>) {
        // Free the slot first so the callback may start the next operation.
        self.slot.take();
        self.progress.take();
        if let Some(completion) = self.completion.take() {
            let id = self.id.clone();
            match &result {
                Ok(_) => debug!("Operation {} ({:?}) completed", id, self.request.kind()),
                Err(e) => debug!("Operation {} ({:?}) failed: {}", id, self.request.kind(), e),
            }
            completion(result.map_err(|e| e.with_operation(id)));
        }
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        if self.completion.is_some() {
            self.deliver(Err(FtpError::cancelled("Operation dropped before completion")));
        }
    }
}

// ─── Handle ──────────────────────────────────────────────────────────

/// Caller-side handle of a started operation.
pub struct OperationHandle {
    id: String,
    kind: OperationKind,
    cancel_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl OperationHandle {
    pub(crate) fn new(id: String, kind: OperationKind, cancel_tx: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        Self { id, kind, cancel_tx, join }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Request cancellation; the completion callback reports `Cancelled`
    /// unless the operation already finished.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait until the worker task (and so the completion callback) is done.
    pub async fn wait(self) {
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::FtpErrorKind;
    use std::sync::Mutex;

    fn capture() -> (Arc<Mutex<Vec<FtpResult<OperationOutput>>>>, CompletionCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |r: FtpResult<OperationOutput>| sink.lock().unwrap().push(r)))
    }

    fn delete_request() -> OperationRequest {
        OperationRequest::Delete { path: "/a".into() }
    }

    #[test]
    fn finish_delivers_once_with_operation_id() {
        let (seen, cb) = capture();
        let op = PendingOperation::new(delete_request(), None, cb).with_id("op-1");
        op.finish(Err(FtpError::command_rejected(550, "nope")));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let err = seen[0].as_ref().unwrap_err();
        assert_eq!(err.operation_id.as_deref(), Some("op-1"));
    }

    #[test]
    fn drop_without_finish_reports_cancelled() {
        let (seen, cb) = capture();
        drop(PendingOperation::new(delete_request(), None, cb));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_ref().unwrap_err().kind, FtpErrorKind::Cancelled);
    }

    #[test]
    fn slot_is_released_before_completion() {
        let slot = Arc::new(AtomicBool::new(false));
        let guard = SlotGuard::try_acquire(&slot).unwrap();
        assert!(SlotGuard::try_acquire(&slot).is_none());

        let observed = Arc::new(AtomicBool::new(false));
        let (flag, seen) = (slot.clone(), observed.clone());
        let op = PendingOperation::new(
            delete_request(),
            None,
            Box::new(move |_: FtpResult<OperationOutput>| seen.store(SlotGuard::try_acquire(&flag).is_some(), Ordering::SeqCst)),
        )
        .with_slot(guard);
        op.finish(Ok(OperationOutput::Done));
        assert!(observed.load(Ordering::SeqCst));
        assert!(!slot.load(Ordering::SeqCst));
    }

    #[test]
    fn progress_reports_cumulative_bytes_and_percent() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let request = OperationRequest::Download {
            remote_path: "/f".into(),
            local_path: "/tmp/f".into(),
            expected_size: 200,
        };
        let mut op = PendingOperation::new(
            request,
            Some(Box::new(move |p: &TransferProgress| sink.lock().unwrap().push(p.clone()))),
            Box::new(|_: FtpResult<OperationOutput>| {}),
        );
        op.record_bytes(50, Some(200));
        op.record_bytes(150, Some(200));
        op.record_bytes(10, None);
        let reports = reports.lock().unwrap();
        assert_eq!(reports.iter().map(|p| p.bytes_transferred).collect::<Vec<_>>(), vec![50, 200, 210]);
        assert_eq!(reports[0].percent, Some(25.0));
        assert_eq!(reports[1].percent, Some(100.0));
        assert_eq!(reports[2].percent, None);
        assert_eq!(reports[0].remote_path, "/f");
        assert_eq!(reports[0].kind, OperationKind::Download);
    }

    #[tokio::test]
    async fn cancel_signal_ignores_dropped_sender() {
        let (tx, mut signal) = CancelSignal::new();
        drop(tx);
        let r = tokio::time::timeout(std::time::Duration::from_millis(50), signal.cancelled()).await;
        assert!(r.is_err());
        assert!(!signal.is_cancelled());

        let (tx, mut signal) = CancelSignal::new();
        tx.send_replace(true);
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }
}
