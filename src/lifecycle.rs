//! Stream lifecycle, notifications and the state shared by both stream kinds

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::close::{CloseOutcome, ClosePolicy};
use crate::error::{ErrorCategory, ErrorKind, Result, StreamError};
use crate::options::OpenFlags;
use crate::provider::{Fd, HandleProvider};

/// Phase of a stream.
#[derive(Debug, Clone)]
pub enum Lifecycle {
    /// Open requested, not yet completed.
    Pending,
    /// Handle acquired; reads and writes are accepted.
    Open,
    /// Close requested, possibly waiting for in-flight I/O.
    Closing,
    /// Ended gracefully.
    Closed,
    /// Torn down, with the error reported at teardown if any.
    Destroyed(Option<StreamError>),
}

impl Lifecycle {
    pub fn is_open(&self) -> bool {
        matches!(self, Lifecycle::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Lifecycle::Closed | Lifecycle::Destroyed(_))
    }
}

/// Receives the documented stream notifications. All methods default to no-ops.
pub trait StreamObserver: Send + Sync {
    /// The handle was acquired.
    fn on_open(&self, _fd: Fd) {}
    /// The stream accepts I/O. Always follows `on_open`.
    fn on_ready(&self) {}
    /// The stream finished tearing down.
    fn on_close(&self) {}
    /// The terminal error of the stream.
    fn on_error(&self, _err: &StreamError) {}
}

/// Tracks the single outstanding read or write of a stream.
///
/// Destroy requests that arrive while the flag is set park a waiter here;
/// [`ActivityFlag::finish`] hands them the completion's error.
#[derive(Debug, Default)]
pub struct ActivityFlag {
    active: bool,
    waiters: Vec<oneshot::Sender<Option<StreamError>>>,
}

impl ActivityFlag {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Marks an operation as issued.
    pub fn begin(&mut self) -> Result<()> {
        if self.active {
            return Err(StreamError::new(
                ErrorCategory::Internal,
                "stream already has an operation in flight",
            ));
        }
        self.active = true;
        Ok(())
    }

    /// Clears the flag and wakes every parked waiter with `err`.
    pub fn finish(&mut self, err: Option<&StreamError>) {
        self.active = false;
        for waiter in self.waiters.drain(..) {
            // A dropped receiver means the destroy was abandoned.
            let _ = waiter.send(err.cloned());
        }
    }

    /// Returns a receiver that fires when the in-flight operation completes.
    pub fn wait_idle(&mut self) -> oneshot::Receiver<Option<StreamError>> {
        let (tx, rx) = oneshot::channel();
        if self.active {
            self.waiters.push(tx);
        } else {
            let _ = tx.send(None);
        }
        rx
    }
}

pub(crate) type OpenFuture = Shared<BoxFuture<'static, Result<Fd>>>;

pub(crate) struct CoreState {
    pub lifecycle: Lifecycle,
    pub fd: Option<Fd>,
    /// Set once a completed open has been claimed, by the stream or for release.
    pub handle_seen: bool,
    pub opening: Option<OpenFuture>,
    pub activity: ActivityFlag,
    /// Next file position. Writes advance it before completion is known.
    pub pos: u64,
    /// Bytes reported as transferred by completed operations.
    pub transferred: u64,
    /// End of file seen (readable only).
    pub eof: bool,
    pub pending_error: Option<StreamError>,
    pub suppressed: Vec<StreamError>,
    pub close: Option<CloseOutcome>,
}

impl CoreState {
    /// Keeps the first error as the terminal one and the rest as suppressed.
    pub fn record_error(&mut self, err: StreamError) {
        if self.pending_error.is_none() {
            self.pending_error = Some(err);
        } else {
            self.suppressed.push(err);
        }
    }
}

/// State and collaborators shared by a stream and its in-flight futures.
pub(crate) struct StreamCore {
    pub path: PathBuf,
    pub provider: Arc<dyn HandleProvider>,
    pub observer: Option<Arc<dyn StreamObserver>>,
    pub policy: ClosePolicy,
    pub state: Mutex<CoreState>,
    /// Serializes reads and writes: at most one in flight.
    pub io_gate: futures::lock::Mutex<()>,
}

impl StreamCore {
    /// Requests the open immediately; the result is applied by [`StreamCore::ready`].
    pub fn open(
        path: PathBuf,
        flags: OpenFlags,
        mode: u32,
        provider: Arc<dyn HandleProvider>,
        observer: Option<Arc<dyn StreamObserver>>,
        policy: ClosePolicy,
    ) -> Arc<Self> {
        let display = path.display().to_string();
        let opening = provider
            .open(&path, flags, mode)
            .map(move |res| {
                res.map_err(|e| {
                    StreamError::io(
                        ErrorKind::OpenFailed,
                        format!("failed to open {}", display),
                        e,
                    )
                })
            })
            .boxed()
            .shared();
        debug!(path = %path.display(), ?flags, mode = %format!("{:o}", mode), "open requested");

        Arc::new(Self {
            path,
            provider,
            observer,
            policy,
            state: Mutex::new(CoreState {
                lifecycle: Lifecycle::Pending,
                fd: None,
                handle_seen: false,
                opening: Some(opening),
                activity: ActivityFlag::default(),
                pos: 0,
                transferred: 0,
                eof: false,
                pending_error: None,
                suppressed: Vec::new(),
                close: None,
            }),
            io_gate: futures::lock::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn destroyed_error(&self) -> StreamError {
        StreamError::with_kind(
            ErrorCategory::User,
            ErrorKind::Destroyed,
            format!("stream for {} has been destroyed", self.path.display()),
        )
    }

    /// Drives the open to completion and returns the handle.
    ///
    /// The first caller to observe the completion moves the stream out of
    /// `Pending` and emits `open` then `ready`.
    pub async fn ready(&self) -> Result<Fd> {
        let opening = {
            let state = self.state.lock();
            match (&state.lifecycle, &state.opening) {
                (Lifecycle::Pending, Some(opening)) => opening.clone(),
                (Lifecycle::Open, _) => {
                    return state.fd.ok_or_else(|| self.destroyed_error());
                }
                _ => return Err(self.destroyed_error()),
            }
        };

        let result = opening.await;
        let mut state = self.state.lock();
        match result {
            Ok(fd) => {
                if matches!(state.lifecycle, Lifecycle::Pending) {
                    state.fd = Some(fd);
                    state.handle_seen = true;
                    state.lifecycle = Lifecycle::Open;
                    state.opening = None;
                    drop(state);
                    debug!(path = %self.path.display(), %fd, "stream open");
                    if let Some(observer) = &self.observer {
                        observer.on_open(fd);
                        observer.on_ready();
                    }
                    Ok(fd)
                } else if state.lifecycle.is_open() {
                    state.fd.ok_or_else(|| self.destroyed_error())
                } else {
                    // Destroyed while another caller was still driving the
                    // open: nobody owns this handle, so release it here.
                    let adopt = !state.handle_seen;
                    state.handle_seen = true;
                    drop(state);
                    if adopt {
                        if let Err(e) = self.provider.close(fd).await {
                            warn!(%fd, error = %e, "failed to release handle opened after destroy");
                        }
                    }
                    Err(self.destroyed_error())
                }
            }
            Err(err) => {
                if matches!(state.lifecycle, Lifecycle::Pending) {
                    state.lifecycle = Lifecycle::Destroyed(Some(err.clone()));
                    state.opening = None;
                    state.record_error(err.clone());
                    drop(state);
                    debug!(path = %self.path.display(), error = %err, "open failed");
                    if let Some(observer) = &self.observer {
                        observer.on_error(&err);
                    }
                    Err(err)
                } else {
                    Err(self.destroyed_error())
                }
            }
        }
    }

    pub fn notify_close(&self, result: &Result<()>) {
        if let Some(observer) = &self.observer {
            if let Err(err) = result {
                observer.on_error(err);
            }
            observer.on_close();
        }
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        // A handle still held here was never closed: the stream was dropped
        // without finish or destroy. Providers release it when close is called.
        let Some(fd) = self.state.get_mut().fd.take() else {
            return;
        };
        debug!(path = %self.path.display(), %fd, "releasing handle of dropped stream");
        if let Some(Err(e)) = self.provider.close(fd).now_or_never() {
            warn!(
                path = %self.path.display(),
                %fd,
                error = %e,
                "failed to release handle of dropped stream"
            );
        }
    }
}
