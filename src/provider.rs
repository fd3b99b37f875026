//! Handle providers
//!
//! A [`HandleProvider`] is the capability set the streams use to reach a
//! file: open, positioned write, sequential read and close, each completing
//! through a future. Handles are plain [`Fd`] identities; the provider owns
//! whatever sits behind them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use futures::executor::ThreadPool;
use futures::future::{self, BoxFuture, FutureExt};
use futures::task::SpawnExt;
use parking_lot::Mutex;

use crate::error::{ErrorCategory, ErrorKind, Result, StreamError};
use crate::options::OpenFlags;

/// Future returned by every provider operation.
pub type IoFuture<T> = BoxFuture<'static, io::Result<T>>;

/// Opaque identity of an open file inside a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fd(u32);

impl Fd {
    pub const fn from_raw(raw: u32) -> Self {
        Fd(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// Asynchronous file operations consumed by the streams.
pub trait HandleProvider: Send + Sync {
    /// Opens `path` with the given flags, creating it with `mode` if needed.
    fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> IoFuture<Fd>;

    /// Writes `data[offset..offset + length]` at file position `position`.
    ///
    /// Resolves to the number of bytes actually written, which may be less
    /// than `length`.
    fn write(
        &self,
        fd: Fd,
        data: Vec<u8>,
        offset: usize,
        length: usize,
        position: u64,
    ) -> IoFuture<usize>;

    /// Reads into `buf` from the current file position, handing the buffer
    /// back along with the number of bytes read. Zero means end of file.
    fn read(&self, fd: Fd, buf: Vec<u8>) -> IoFuture<(Vec<u8>, usize)>;

    /// Whether `fd` is a regular file, on which a read shorter than the
    /// buffer means the end of the file has been reached. Pipes, FIFOs and
    /// terminals return short reads while more data is still to come.
    fn is_regular_file(&self, fd: Fd) -> bool;

    /// Releases the handle.
    ///
    /// The handle is released by the call itself, before the returned future
    /// is polled, and is gone afterwards even on error.
    fn close(&self, fd: Fd) -> IoFuture<()>;
}

fn bad_fd(fd: Fd) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("bad file descriptor ({})", fd))
}

fn slice_bounds(data: &[u8], offset: usize, length: usize) -> io::Result<std::ops::Range<usize>> {
    let end = offset
        .checked_add(length)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write range {}+{} exceeds buffer of {} bytes",
                    offset,
                    length,
                    data.len()
                ),
            )
        })?;
    Ok(offset..end)
}

struct OpenFile {
    file: File,
    append: bool,
    sync: bool,
    regular: bool,
}

#[derive(Default)]
struct FdTable {
    next: u32,
    files: HashMap<Fd, Arc<OpenFile>>,
}

impl FdTable {
    fn insert(&mut self, file: OpenFile) -> Fd {
        // 0-2 mirror the standard streams and are never handed out.
        self.next = self.next.max(2) + 1;
        let fd = Fd(self.next);
        self.files.insert(fd, Arc::new(file));
        fd
    }
}

/// Real files, with every blocking call offloaded to a thread pool.
pub struct StdFsProvider {
    table: Arc<Mutex<FdTable>>,
    pool: ThreadPool,
}

impl StdFsProvider {
    pub fn new() -> io::Result<Self> {
        let pool = ThreadPool::builder()
            .name_prefix("fsstream-io-")
            .create()?;
        Ok(Self {
            table: Arc::new(Mutex::new(FdTable::default())),
            pool,
        })
    }

    /// Number of handles currently open.
    pub fn open_count(&self) -> usize {
        self.table.lock().files.len()
    }

    fn offload<T, F>(&self, op: F) -> IoFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        match self.pool.spawn_with_handle(async move { op() }) {
            Ok(handle) => handle.boxed(),
            Err(e) => future::ready(Err(io::Error::other(e))).boxed(),
        }
    }

    fn lookup(&self, fd: Fd) -> io::Result<Arc<OpenFile>> {
        self.table.lock().files.get(&fd).cloned().ok_or_else(|| bad_fd(fd))
    }
}

impl fmt::Debug for StdFsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdFsProvider")
            .field("open", &self.open_count())
            .finish()
    }
}

impl HandleProvider for StdFsProvider {
    fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> IoFuture<Fd> {
        let path = path.to_path_buf();
        let table = Arc::clone(&self.table);
        // The table entry is only created when the result is polled, so an
        // abandoned open drops the `File` instead of leaking an fd.
        self.offload(move || {
            let file = flags.to_open_options(mode).open(&path)?;
            let regular = file.metadata()?.is_file();
            Ok((file, regular))
        })
        .map(move |res| {
            res.map(|(file, regular)| {
                table.lock().insert(OpenFile {
                    file,
                    append: flags.append,
                    sync: flags.sync,
                    regular,
                })
            })
        })
        .boxed()
    }

    fn write(
        &self,
        fd: Fd,
        data: Vec<u8>,
        offset: usize,
        length: usize,
        position: u64,
    ) -> IoFuture<usize> {
        let entry = match self.lookup(fd) {
            Ok(entry) => entry,
            Err(e) => return future::ready(Err(e)).boxed(),
        };
        self.offload(move || {
            let range = slice_bounds(&data, offset, length)?;
            let chunk = &data[range];
            let n = if entry.append {
                (&entry.file).write(chunk)?
            } else {
                write_at(&entry.file, chunk, position)?
            };
            if entry.sync {
                entry.file.sync_data()?;
            }
            Ok(n)
        })
    }

    fn read(&self, fd: Fd, mut buf: Vec<u8>) -> IoFuture<(Vec<u8>, usize)> {
        let entry = match self.lookup(fd) {
            Ok(entry) => entry,
            Err(e) => return future::ready(Err(e)).boxed(),
        };
        self.offload(move || {
            let n = (&entry.file).read(&mut buf)?;
            Ok((buf, n))
        })
    }

    fn is_regular_file(&self, fd: Fd) -> bool {
        self.table.lock().files.get(&fd).is_some_and(|entry| entry.regular)
    }

    /// Dropping a `File` reports no error, so closing a known handle always
    /// succeeds; only an unknown or already closed handle fails. Data is made
    /// durable per write when the stream was opened with a sync flag.
    fn close(&self, fd: Fd) -> IoFuture<()> {
        let entry = self.table.lock().files.remove(&fd);
        match entry {
            Some(entry) => self.offload(move || {
                drop(entry);
                Ok(())
            }),
            None => future::ready(Err(bad_fd(fd))).boxed(),
        }
    }
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], position: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, position)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], position: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, position)
}

static DEFAULT_PROVIDER: OnceLock<Arc<StdFsProvider>> = OnceLock::new();

/// The process-wide [`StdFsProvider`] used when no provider is configured.
pub fn default_provider() -> Result<Arc<dyn HandleProvider>> {
    if let Some(provider) = DEFAULT_PROVIDER.get() {
        return Ok(provider.clone());
    }
    let provider = StdFsProvider::new().map_err(|e| {
        StreamError::with_source(
            ErrorCategory::Internal,
            "failed to start the file I/O thread pool",
            e,
        )
    })?;
    // A racing initializer may win; its pool is the one everybody shares.
    let _ = DEFAULT_PROVIDER.set(Arc::new(provider));
    match DEFAULT_PROVIDER.get() {
        Some(provider) => Ok(provider.clone()),
        None => Err(StreamError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::OpenFailed,
            "default file provider unavailable",
        )),
    }
}

/// Provider operations, for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Open,
    Write,
    Read,
    Close,
}

/// Number of calls made against a [`MemoryProvider`], per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub open: usize,
    pub write: usize,
    pub read: usize,
    pub close: usize,
}

struct MemoryHandle {
    path: PathBuf,
    read_pos: usize,
    append: bool,
    regular: bool,
}

#[derive(Default)]
struct MemoryState {
    files: HashMap<PathBuf, Vec<u8>>,
    /// Paths that behave like pipes rather than regular files.
    streams: HashSet<PathBuf>,
    handles: HashMap<Fd, MemoryHandle>,
    next_fd: u32,
    calls: CallCounts,
    faults: HashMap<Op, io::ErrorKind>,
    partial_write_limit: Option<usize>,
}

/// In-memory file table (for testing)
///
/// Calls are counted when they are made, and a close releases its handle
/// right away; the operation itself runs when the returned future is first
/// polled and completes without suspending. Can
/// cap the size of each write to simulate partial writes, and can fail the
/// next call of a given operation.
#[derive(Default)]
pub struct MemoryProvider {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a file.
    pub fn with_file(self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.state.lock().files.insert(path.into(), contents.into());
        self
    }

    /// Seeds a pipe-like file: reads return what is buffered, short reads
    /// included, and only a zero-byte read marks the end.
    pub fn with_stream(self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        let path = path.into();
        {
            let mut state = self.state.lock();
            state.streams.insert(path.clone());
            state.files.insert(path, contents.into());
        }
        self
    }

    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.state.lock().files.get(path.as_ref()).cloned()
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    /// Number of handles opened and not yet closed.
    pub fn open_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Makes the next call of `op` fail with `kind`.
    pub fn fail_next(&self, op: Op, kind: io::ErrorKind) {
        self.state.lock().faults.insert(op, kind);
    }

    /// Caps the number of bytes each write reports as written.
    pub fn set_partial_write_limit(&self, limit: Option<usize>) {
        self.state.lock().partial_write_limit = limit;
    }

    fn count(&self, op: Op) {
        let mut state = self.state.lock();
        let calls = &mut state.calls;
        match op {
            Op::Open => calls.open += 1,
            Op::Write => calls.write += 1,
            Op::Read => calls.read += 1,
            Op::Close => calls.close += 1,
        }
    }
}

impl MemoryState {
    fn injected(&mut self, op: Op) -> io::Result<()> {
        match self.faults.remove(&op) {
            Some(kind) => Err(io::Error::new(kind, format!("injected {:?} failure", op))),
            None => Ok(()),
        }
    }

    fn open(&mut self, path: &Path, flags: OpenFlags) -> io::Result<Fd> {
        self.injected(Op::Open)?;
        let state = self;
        let exists = state.files.contains_key(path);
        if exists && flags.exclusive {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            ));
        }
        if !exists && !flags.create {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            ));
        }
        let file = state.files.entry(path.to_path_buf()).or_default();
        if flags.truncate {
            file.clear();
        }
        state.next_fd = state.next_fd.max(2) + 1;
        let fd = Fd(state.next_fd);
        state.handles.insert(
            fd,
            MemoryHandle {
                path: path.to_path_buf(),
                read_pos: 0,
                append: flags.append,
                regular: !state.streams.contains(path),
            },
        );
        Ok(fd)
    }

    fn write(
        &mut self,
        fd: Fd,
        data: &[u8],
        offset: usize,
        length: usize,
        position: u64,
    ) -> io::Result<usize> {
        self.injected(Op::Write)?;
        let state = self;
        let range = slice_bounds(data, offset, length)?;
        let n = match state.partial_write_limit {
            Some(limit) => range.len().min(limit),
            None => range.len(),
        };
        let chunk = &data[range.start..range.start + n];
        let handle = state.handles.get(&fd).ok_or_else(|| bad_fd(fd))?;
        let (path, append) = (handle.path.clone(), handle.append);
        let file = state.files.entry(path).or_default();
        let start = if append {
            file.len()
        } else {
            usize::try_from(position).map_err(io::Error::other)?
        };
        if file.len() < start + n {
            file.resize(start + n, 0);
        }
        file[start..start + n].copy_from_slice(chunk);
        Ok(n)
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
        self.injected(Op::Read)?;
        let state = self;
        let handle = state.handles.get_mut(&fd).ok_or_else(|| bad_fd(fd))?;
        let file = state
            .files
            .get(&handle.path)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let available = file.len().saturating_sub(handle.read_pos);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&file[handle.read_pos..handle.read_pos + n]);
        handle.read_pos += n;
        Ok(n)
    }

    fn close(&mut self, fd: Fd, released: bool) -> io::Result<()> {
        self.injected(Op::Close)?;
        if released { Ok(()) } else { Err(bad_fd(fd)) }
    }
}

impl HandleProvider for MemoryProvider {
    fn open(&self, path: &Path, flags: OpenFlags, _mode: u32) -> IoFuture<Fd> {
        self.count(Op::Open);
        let state = Arc::clone(&self.state);
        let path = path.to_path_buf();
        async move { state.lock().open(&path, flags) }.boxed()
    }

    fn write(
        &self,
        fd: Fd,
        data: Vec<u8>,
        offset: usize,
        length: usize,
        position: u64,
    ) -> IoFuture<usize> {
        self.count(Op::Write);
        let state = Arc::clone(&self.state);
        async move { state.lock().write(fd, &data, offset, length, position) }.boxed()
    }

    fn read(&self, fd: Fd, mut buf: Vec<u8>) -> IoFuture<(Vec<u8>, usize)> {
        self.count(Op::Read);
        let state = Arc::clone(&self.state);
        async move {
            let n = state.lock().read(fd, &mut buf)?;
            Ok((buf, n))
        }
        .boxed()
    }

    fn is_regular_file(&self, fd: Fd) -> bool {
        self.state
            .lock()
            .handles
            .get(&fd)
            .is_some_and(|handle| handle.regular)
    }

    fn close(&self, fd: Fd) -> IoFuture<()> {
        self.count(Op::Close);
        let released = self.state.lock().handles.remove(&fd).is_some();
        let state = Arc::clone(&self.state);
        async move { state.lock().close(fd, released) }.boxed()
    }
}
