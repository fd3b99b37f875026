//! Readable file stream
//!
//! Opens read-only on construction and hands out one bounded chunk per
//! pull. Teardown is best effort: a failing close is logged, never reported.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, Stream};
use tracing::trace;

use crate::close::ClosePolicy;
use crate::error::{ErrorKind, Result, StreamError};
use crate::lifecycle::{Lifecycle, StreamCore};
use crate::options::{Encoding, OpenFlags, ReadStreamOptions};
use crate::path;
use crate::provider::{self, Fd, HandleProvider};

/// Pulls chunks from a file through a [`HandleProvider`].
#[derive(Clone)]
pub struct ReadStream {
    core: Arc<StreamCore>,
    encoding: Encoding,
    chunk_size: usize,
}

impl ReadStream {
    /// Validates `opts` and requests a read-only open of `path`.
    ///
    /// `fd`, `start`, `end` and `provider` are rejected as not implemented.
    pub fn new(path: impl AsRef<Path>, opts: ReadStreamOptions) -> Result<Self> {
        let encoding = opts.validate()?;
        let provider = provider::default_provider()?;
        Self::build(path.as_ref(), opts, encoding, provider)
    }

    /// Like [`ReadStream::new`], reading through `provider`.
    pub fn with_provider(
        path: impl AsRef<Path>,
        opts: ReadStreamOptions,
        provider: Arc<dyn HandleProvider>,
    ) -> Result<Self> {
        let encoding = opts.validate()?;
        Self::build(path.as_ref(), opts, encoding, provider)
    }

    fn build(
        path: &Path,
        opts: ReadStreamOptions,
        encoding: Encoding,
        provider: Arc<dyn HandleProvider>,
    ) -> Result<Self> {
        let path = path::to_path_if_file_url(path)?;
        let core = StreamCore::open(
            path,
            OpenFlags::READ,
            0,
            provider,
            opts.observer,
            ClosePolicy::BestEffort,
        );
        Ok(Self {
            core,
            encoding,
            chunk_size: opts.chunk_size,
        })
    }

    /// Waits for the open to complete.
    pub async fn ready(&self) -> Result<Fd> {
        self.core.ready().await
    }

    /// Pulls the next chunk.
    ///
    /// `Ok(None)` is end of stream, and every pull after it returns the same
    /// without touching the file. On a regular file a chunk shorter than the
    /// chunk size is the last one; anything else ends on a zero-byte read.
    /// A read error tears the stream down and is returned once; pulls on a
    /// stream torn down before its end fail with [`ErrorKind::Destroyed`].
    pub async fn read_chunk(&self) -> Result<Option<Vec<u8>>> {
        let _gate = self.core.io_gate.lock().await;
        {
            let state = self.core.state.lock();
            if state.eof {
                drop(state);
                // Auto-close on end of stream; later pulls reuse the outcome.
                let _ = self.core.destroy(None, true).await;
                return Ok(None);
            }
            if state.close.is_some() || state.lifecycle.is_terminal() {
                return Err(self.core.destroyed_error());
            }
        }
        let fd = self.core.ready().await?;
        let regular = self.core.provider.is_regular_file(fd);

        {
            let mut state = self.core.state.lock();
            if !state.lifecycle.is_open() {
                return Err(self.core.destroyed_error());
            }
            state.activity.begin()?;
        }
        let result = self
            .core
            .provider
            .read(fd, vec![0; self.chunk_size])
            .await
            .map_err(|e| {
                StreamError::io(
                    ErrorKind::ReadFailed,
                    format!("failed to read from {}", self.core.path().display()),
                    e,
                )
            });

        let chunk = {
            let mut state = self.core.state.lock();
            state.activity.finish(result.as_ref().err());
            match result {
                Ok((mut buf, n)) => {
                    state.transferred += n as u64;
                    state.pos += n as u64;
                    if n == 0 || (regular && n < self.chunk_size) {
                        state.eof = true;
                    }
                    buf.truncate(n);
                    Ok(buf)
                }
                Err(err) => Err(err),
            }
        };
        trace!(%fd, ok = chunk.is_ok(), "read completed");

        match chunk {
            Ok(buf) if buf.is_empty() => {
                let _ = self.core.destroy(None, true).await;
                Ok(None)
            }
            Ok(buf) => Ok(Some(buf)),
            Err(err) => {
                // Best-effort teardown hands the reason straight back.
                let _ = self.core.destroy(Some(err.clone()), false).await;
                Err(err)
            }
        }
    }

    /// Reads every remaining chunk into one buffer.
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Adapts the pulls into a [`Stream`] of chunks that ends at end of file
    /// or after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>>> {
        stream::unfold(Some(self), |rs| async move {
            let rs = rs?;
            match rs.read_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(rs))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Tears the stream down.
    ///
    /// Closes the handle if there is one, ignoring any close failure, and
    /// resolves to `reason`.
    pub async fn destroy(&self, reason: Option<StreamError>) -> Result<()> {
        self.core.destroy(reason, false).await
    }

    pub fn path(&self) -> &Path {
        self.core.path()
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn fd(&self) -> Option<Fd> {
        self.core.state.lock().fd
    }

    pub fn pending(&self) -> bool {
        matches!(self.core.state.lock().lifecycle, Lifecycle::Pending)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.core.state.lock().lifecycle.clone()
    }

    pub fn bytes_read(&self) -> u64 {
        self.core.state.lock().transferred
    }

    pub fn is_io_active(&self) -> bool {
        self.core.state.lock().activity.is_active()
    }

    /// True once the last chunk has been handed out.
    pub fn ended(&self) -> bool {
        self.core.state.lock().eof
    }
}

impl fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("ReadStream")
            .field("path", &self.core.path)
            .field("fd", &state.fd)
            .field("lifecycle", &state.lifecycle)
            .field("bytes_read", &state.transferred)
            .field("eof", &state.eof)
            .finish()
    }
}
