//! Writable file stream
//!
//! The open is requested as soon as the stream is constructed. Writes go to
//! the handle one at a time, each at the stream's running file position.
//! The position is advanced by the full buffer length when the write is
//! issued, while `bytes_written` only grows by what the provider reports
//! after the write completes; a failed or partial write leaves the two apart.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::trace;

use crate::close::ClosePolicy;
use crate::error::{ErrorKind, Result, StreamError};
use crate::lifecycle::{Lifecycle, StreamCore};
use crate::options::{Encoding, OpenFlags, WriteStreamOptions};
use crate::path;
use crate::provider::{self, Fd};

/// Writes byte buffers to a file through a [`crate::HandleProvider`].
///
/// Cloning yields another handle to the same stream, so one task can
/// `destroy` while another is writing.
#[derive(Clone)]
pub struct WriteStream {
    core: Arc<StreamCore>,
    flags: OpenFlags,
    mode: u32,
    encoding: Encoding,
    auto_destroy: bool,
}

impl WriteStream {
    /// Validates `opts` and requests the open of `path`.
    ///
    /// `path` may be a `file://` URL. Nothing blocks here; the stream stays
    /// pending until the first operation (or [`WriteStream::ready`]) drives
    /// the open.
    pub fn new(path: impl AsRef<Path>, opts: WriteStreamOptions) -> Result<Self> {
        opts.validate()?;
        let path = path::to_path_if_file_url(path.as_ref())?;
        let provider = match opts.provider {
            Some(provider) => provider,
            None => provider::default_provider()?,
        };
        let core = StreamCore::open(
            path,
            opts.flags,
            opts.mode,
            provider,
            opts.observer,
            ClosePolicy::Strict,
        );
        Ok(Self {
            core,
            flags: opts.flags,
            mode: opts.mode,
            encoding: opts.encoding.unwrap_or_default(),
            auto_destroy: opts.auto_destroy,
        })
    }

    /// Waits for the open to complete.
    pub async fn ready(&self) -> Result<Fd> {
        self.core.ready().await
    }

    /// Writes the whole buffer at the current position.
    ///
    /// Resolves to the number of bytes the provider reports as written,
    /// which may be less than the buffer length. Writes issued concurrently
    /// on one stream are serialized.
    pub async fn write(&self, data: impl Into<Vec<u8>>) -> Result<usize> {
        let data = data.into();
        let _gate = self.core.io_gate.lock().await;
        let fd = self.core.ready().await?;

        let len = data.len();
        let position = {
            let mut state = self.core.state.lock();
            if !state.lifecycle.is_open() {
                return Err(self.core.destroyed_error());
            }
            state.activity.begin()?;
            let position = state.pos;
            state.pos += len as u64;
            position
        };
        trace!(%fd, position, len, "write issued");

        let result = self
            .core
            .provider
            .write(fd, data, 0, len, position)
            .await
            .map_err(|e| {
                StreamError::io(
                    ErrorKind::WriteFailed,
                    format!("failed to write to {}", self.core.path().display()),
                    e,
                )
            });

        let destroying = {
            let mut state = self.core.state.lock();
            match &result {
                Ok(n) => state.transferred += *n as u64,
                Err(err) => state.record_error(err.clone()),
            }
            state.activity.finish(result.as_ref().err());
            state.close.is_some()
        };
        trace!(%fd, ok = result.is_ok(), "write completed");

        if let Err(err) = &result {
            if !destroying && self.auto_destroy {
                // The write's own error goes to the caller; the teardown
                // outcome is kept for whoever calls destroy next.
                let _ = self.core.destroy_recorded(err.clone()).await;
            }
        }
        result
    }

    /// Ends the stream: waits for pending writes, then closes the handle.
    pub async fn finish(&self) -> Result<()> {
        {
            let _gate = self.core.io_gate.lock().await;
            if self.core.state.lock().close.is_none() {
                self.core.ready().await?;
            }
        }
        self.core.destroy(None, true).await
    }

    /// Tears the stream down, optionally with an error.
    ///
    /// An in-flight write is not cancelled; the close waits until its
    /// completion. Resolves to the error reported for the teardown: the close
    /// failure if there was one, otherwise `reason`, otherwise the error of a
    /// write that completed while the destroy was waiting. Repeated calls
    /// share the outcome of the first.
    pub async fn destroy(&self, reason: Option<StreamError>) -> Result<()> {
        self.core.destroy(reason, false).await
    }

    pub fn path(&self) -> &Path {
        self.core.path()
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// The handle, once open and until closed.
    pub fn fd(&self) -> Option<Fd> {
        self.core.state.lock().fd
    }

    /// True until the open has completed.
    pub fn pending(&self) -> bool {
        matches!(self.core.state.lock().lifecycle, Lifecycle::Pending)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.core.state.lock().lifecycle.clone()
    }

    /// File position of the next write.
    pub fn pos(&self) -> u64 {
        self.core.state.lock().pos
    }

    /// Bytes confirmed written by completed writes.
    pub fn bytes_written(&self) -> u64 {
        self.core.state.lock().transferred
    }

    pub fn is_io_active(&self) -> bool {
        self.core.state.lock().activity.is_active()
    }

    /// The first error the stream encountered.
    pub fn error(&self) -> Option<StreamError> {
        self.core.state.lock().pending_error.clone()
    }

    /// Errors that arrived after the first one.
    pub fn suppressed_errors(&self) -> Vec<StreamError> {
        self.core.state.lock().suppressed.clone()
    }
}

impl fmt::Debug for WriteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("WriteStream")
            .field("path", &self.core.path)
            .field("fd", &state.fd)
            .field("lifecycle", &state.lifecycle)
            .field("pos", &state.pos)
            .field("bytes_written", &state.transferred)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::lifecycle::StreamObserver;
    use crate::provider::{MemoryProvider, Op};
    use futures::executor::block_on;
    use parking_lot::Mutex;
    use std::io;

    fn memory_stream(provider: &Arc<MemoryProvider>, opts: WriteStreamOptions) -> WriteStream {
        WriteStream::new("/out.txt", opts.with_provider(provider.clone())).unwrap()
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl StreamObserver for Events {
        fn on_open(&self, fd: Fd) {
            self.0.lock().push(format!("open {}", fd.as_raw()));
        }
        fn on_ready(&self) {
            self.0.lock().push("ready".into());
        }
        fn on_close(&self) {
            self.0.lock().push("close".into());
        }
        fn on_error(&self, err: &StreamError) {
            self.0.lock().push(format!("error {}", err));
        }
    }

    #[test]
    fn test_sequential_writes() {
        let provider = Arc::new(MemoryProvider::new());
        let stream = memory_stream(&provider, WriteStreamOptions::default());
        assert!(stream.pending());

        block_on(async {
            assert_eq!(stream.write("abc").await.unwrap(), 3);
            assert_eq!(stream.write("def").await.unwrap(), 3);
            stream.destroy(None).await.unwrap();
        });

        assert_eq!(provider.contents("/out.txt").unwrap(), b"abcdef");
        assert_eq!(stream.bytes_written(), 6);
        assert_eq!(stream.pos(), 6);
        assert_eq!(provider.calls().open, 1);
        assert_eq!(provider.calls().close, 1);
        assert!(stream.fd().is_none());
    }

    #[test]
    fn test_notifications_in_order() {
        let provider = Arc::new(MemoryProvider::new());
        let events = Arc::new(Events::default());
        let stream = memory_stream(
            &provider,
            WriteStreamOptions::default().with_observer(events.clone()),
        );

        block_on(async {
            let fd = stream.ready().await.unwrap();
            assert_eq!(stream.fd(), Some(fd));
            stream.finish().await.unwrap();
        });

        let events = events.0.lock().clone();
        assert_eq!(events.len(), 3);
        assert!(events[0].starts_with("open "));
        assert_eq!(events[1], "ready");
        assert_eq!(events[2], "close");
        assert!(matches!(stream.lifecycle(), Lifecycle::Closed));
    }

    #[test]
    fn test_open_failure_never_emits_ready() {
        let provider = Arc::new(MemoryProvider::new());
        provider.fail_next(Op::Open, io::ErrorKind::PermissionDenied);
        let events = Arc::new(Events::default());
        let stream = memory_stream(
            &provider,
            WriteStreamOptions::default().with_observer(events.clone()),
        );

        let err = block_on(stream.write("abc")).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::OpenFailed));
        assert_eq!(err.category, ErrorCategory::User);

        // No handle was acquired, so no close happens.
        block_on(stream.destroy(None)).unwrap();
        assert_eq!(provider.calls().close, 0);
        assert_eq!(provider.calls().write, 0);

        let events = events.0.lock().clone();
        assert!(!events.iter().any(|e| e == "ready"));
        assert!(events[0].starts_with("error failed to open"));
    }

    #[test]
    fn test_partial_write_diverges_from_position() {
        let provider = Arc::new(MemoryProvider::new());
        provider.set_partial_write_limit(Some(2));
        let stream = memory_stream(&provider, WriteStreamOptions::default());

        let n = block_on(stream.write("abcde")).unwrap();
        assert_eq!(n, 2);
        assert_eq!(stream.bytes_written(), 2);
        assert_eq!(stream.pos(), 5);
    }

    #[test]
    fn test_failed_write_still_advances_position() {
        let provider = Arc::new(MemoryProvider::new());
        let stream = memory_stream(
            &provider,
            WriteStreamOptions::default().with_auto_destroy(false),
        );

        block_on(async {
            stream.write("abc").await.unwrap();
            provider.fail_next(Op::Write, io::ErrorKind::Other);
            let err = stream.write("def").await.unwrap_err();
            assert_eq!(err.kind, Some(ErrorKind::WriteFailed));
        });

        assert_eq!(stream.pos(), 6);
        assert_eq!(stream.bytes_written(), 3);
        assert!(stream.lifecycle().is_open());
        assert!(!stream.is_io_active());
        assert_eq!(stream.error().unwrap().kind, Some(ErrorKind::WriteFailed));
    }

    #[test]
    fn test_write_error_auto_destroys() {
        let provider = Arc::new(MemoryProvider::new());
        let stream = memory_stream(&provider, WriteStreamOptions::default());
        provider.fail_next(Op::Write, io::ErrorKind::Other);

        let err = block_on(stream.write("abc")).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::WriteFailed));
        assert_eq!(provider.calls().close, 1);
        assert!(matches!(stream.lifecycle(), Lifecycle::Destroyed(Some(_))));
        assert_eq!(stream.error().unwrap().kind, Some(ErrorKind::WriteFailed));
        assert!(stream.suppressed_errors().is_empty());

        // Later destroy calls see the same teardown and do not close again.
        let again = block_on(stream.destroy(None)).unwrap_err();
        assert_eq!(again.kind, Some(ErrorKind::WriteFailed));
        assert_eq!(provider.calls().close, 1);
    }

    #[test]
    fn test_destroy_before_open_completes() {
        let provider = Arc::new(MemoryProvider::new());
        let stream = memory_stream(&provider, WriteStreamOptions::default());

        let reason = StreamError::new(ErrorCategory::User, "caller gave up");
        let err = block_on(stream.destroy(Some(reason))).unwrap_err();
        assert_eq!(err.message(), "caller gave up");
        assert_eq!(provider.calls().close, 0);
        assert!(stream.fd().is_none());

        let err = block_on(stream.write("late")).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::Destroyed));
        assert_eq!(provider.calls().write, 0);
    }

    #[test]
    fn test_destroy_twice_closes_once() {
        let provider = Arc::new(MemoryProvider::new());
        let stream = memory_stream(&provider, WriteStreamOptions::default());

        block_on(async {
            stream.ready().await.unwrap();
            let (a, b) = futures::join!(stream.destroy(None), stream.destroy(None));
            a.unwrap();
            b.unwrap();
            stream.destroy(None).await.unwrap();
        });
        assert_eq!(provider.calls().close, 1);
        assert_eq!(provider.open_count(), 0);
    }

    #[test]
    fn test_close_failure_reported_once() {
        let provider = Arc::new(MemoryProvider::new());
        let stream = memory_stream(&provider, WriteStreamOptions::default());
        provider.fail_next(Op::Close, io::ErrorKind::Other);

        block_on(async {
            stream.write("x").await.unwrap();
            let err = stream.destroy(None).await.unwrap_err();
            assert_eq!(err.kind, Some(ErrorKind::CloseFailed));
            // The handle is gone even though close failed.
            assert!(stream.fd().is_none());
            let err = stream.destroy(None).await.unwrap_err();
            assert_eq!(err.kind, Some(ErrorKind::CloseFailed));
        });
        assert_eq!(provider.calls().close, 1);
    }

    #[test]
    fn test_invalid_options_rejected_synchronously() {
        let opts = WriteStreamOptions::default().with_mode(0o100000);
        let err = WriteStream::new("/x", opts).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::InvalidArgument));

        assert!(WriteStreamOptions::default().with_encoding("utf-9").is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_file_url_path() {
        let provider = Arc::new(MemoryProvider::new());
        let stream = WriteStream::new(
            "file:///tmp/with%20space.txt",
            WriteStreamOptions::default().with_provider(provider.clone()),
        )
        .unwrap();
        block_on(async {
            stream.write("hi").await.unwrap();
            stream.finish().await.unwrap();
        });
        assert_eq!(stream.path(), Path::new("/tmp/with space.txt"));
        assert_eq!(provider.contents("/tmp/with space.txt").unwrap(), b"hi");
    }
}
