//! Close coordination
//!
//! Both stream kinds tear down through [`StreamCore::destroy`]. The first
//! request builds a single close future and stores it; every later request
//! gets a clone of that same future, so the provider's close runs at most
//! once per stream. A request that lands while a read or write is in flight
//! parks on the [`crate::lifecycle::ActivityFlag`] and only closes after the
//! operation's completion has cleared it.

use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use tracing::{debug, warn};

use crate::error::{ErrorKind, Result, StreamError};
use crate::lifecycle::{Lifecycle, StreamCore};

/// Outcome of the one close of a stream, shareable between destroy callers.
pub type CloseOutcome = Shared<BoxFuture<'static, Result<()>>>;

/// How a close failure combines with the error that triggered the close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// The close error wins over the triggering error; an I/O error that
    /// completes under a pending destroy counts as a trigger.
    Strict,
    /// Close errors are logged and dropped; the destroy reason is reported as given.
    BestEffort,
}

/// Combines the triggering error with the close result.
///
/// The close error, if any, takes precedence over the trigger.
pub fn resolve(trigger: Option<StreamError>, closed: Result<()>) -> Result<()> {
    match (closed, trigger) {
        (Err(close_err), _) => Err(close_err),
        (Ok(()), Some(err)) => Err(err),
        (Ok(()), None) => Ok(()),
    }
}

impl StreamCore {
    /// Requests teardown and returns the shared close outcome.
    ///
    /// `graceful` ends the stream as [`Lifecycle::Closed`] instead of
    /// [`Lifecycle::Destroyed`] when nothing failed.
    pub(crate) fn destroy(self: &Arc<Self>, reason: Option<StreamError>, graceful: bool) -> CloseOutcome {
        self.begin_close(reason, graceful, true)
    }

    /// Like [`StreamCore::destroy`], for a `reason` the caller has already
    /// recorded as a stream error.
    pub(crate) fn destroy_recorded(self: &Arc<Self>, reason: StreamError) -> CloseOutcome {
        self.begin_close(Some(reason), false, false)
    }

    fn begin_close(
        self: &Arc<Self>,
        reason: Option<StreamError>,
        graceful: bool,
        record: bool,
    ) -> CloseOutcome {
        let mut state = self.state.lock();
        if let Some(outcome) = &state.close {
            debug!(path = %self.path.display(), "destroy joins close already in progress");
            return outcome.clone();
        }
        if let (true, Some(err)) = (record, &reason) {
            state.record_error(err.clone());
        }

        let mut settled = None;
        let fut: BoxFuture<'static, Result<()>> = if matches!(state.lifecycle, Lifecycle::Pending) {
            // No handle yet and no I/O possible: abandon the open.
            state.opening = None;
            state.lifecycle = Lifecycle::Destroyed(reason.clone());
            debug!(path = %self.path.display(), "destroyed before open completed");
            let result = resolve(reason, Ok(()));
            settled = Some(result.clone());
            future::ready(result).boxed()
        } else {
            if state.lifecycle.is_open() {
                state.lifecycle = Lifecycle::Closing;
            }
            let waiter = if state.activity.is_active() {
                debug!(path = %self.path.display(), "close deferred until in-flight I/O completes");
                Some(state.activity.wait_idle())
            } else {
                None
            };
            let core = Arc::clone(self);
            async move {
                let io_err = match waiter {
                    // A dropped sender still means the operation is over.
                    Some(rx) => rx.await.unwrap_or(None),
                    None => None,
                };
                let trigger = match core.policy {
                    ClosePolicy::Strict => reason.or(io_err),
                    ClosePolicy::BestEffort => reason,
                };
                core.close_handle(trigger, graceful).await
            }
            .boxed()
        };

        let outcome = fut.shared();
        state.close = Some(outcome.clone());
        drop(state);
        if let Some(result) = settled {
            self.notify_close(&result);
        }
        outcome
    }

    /// Issues the provider close at most once and settles the lifecycle.
    async fn close_handle(&self, trigger: Option<StreamError>, graceful: bool) -> Result<()> {
        // Cleared before the call so no later path can reach this handle,
        // whatever the close reports.
        let fd = self.state.lock().fd.take();

        let result = match fd {
            None => resolve(trigger, Ok(())),
            Some(fd) => {
                let closed = self.provider.close(fd).await.map_err(|e| {
                    StreamError::io(
                        ErrorKind::CloseFailed,
                        format!("failed to close {}", self.path.display()),
                        e,
                    )
                });
                match (self.policy, closed) {
                    (ClosePolicy::BestEffort, Err(err)) => {
                        warn!(path = %self.path.display(), %fd, error = %err, "ignoring close failure");
                        resolve(trigger, Ok(()))
                    }
                    (_, closed) => {
                        if let Err(err) = &closed {
                            self.state.lock().record_error(err.clone());
                        }
                        resolve(trigger, closed)
                    }
                }
            }
        };

        {
            let mut state = self.state.lock();
            // A failed open already settled the lifecycle with its error.
            if !state.lifecycle.is_terminal() {
                state.lifecycle = match &result {
                    Ok(()) if graceful => Lifecycle::Closed,
                    Ok(()) => Lifecycle::Destroyed(None),
                    Err(err) => Lifecycle::Destroyed(Some(err.clone())),
                };
            }
            debug!(
                path = %self.path.display(),
                transferred = state.transferred,
                ok = result.is_ok(),
                "stream closed"
            );
        }
        self.notify_close(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    fn err(msg: &str) -> StreamError {
        StreamError::new(ErrorCategory::Internal, msg)
    }

    #[test]
    fn test_close_error_takes_precedence() {
        let result = resolve(Some(err("write")), Err(err("close")));
        assert_eq!(result.unwrap_err().message(), "close");
    }

    #[test]
    fn test_trigger_reported_when_close_succeeds() {
        let result = resolve(Some(err("write")), Ok(()));
        assert_eq!(result.unwrap_err().message(), "write");
    }

    #[test]
    fn test_clean_close() {
        assert!(resolve(None, Ok(())).is_ok());
    }
}
