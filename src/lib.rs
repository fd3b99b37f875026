//! Asynchronous file streams
//!
//! [`WriteStream`] and [`ReadStream`] open a file on construction, move data
//! through a pluggable [`HandleProvider`] one operation at a time, and close
//! the handle exactly once, however many times and from wherever teardown is
//! requested.

#![forbid(unsafe_code)]

pub mod close;
pub mod error;
pub mod lifecycle;
pub mod options;
pub mod path;
pub mod provider;
pub mod read_stream;
pub mod write_stream;

pub use close::ClosePolicy;
pub use error::{ErrorCategory, ErrorKind, Result, StreamError};
pub use lifecycle::{Lifecycle, StreamObserver};
pub use options::{Encoding, OpenFlags, ReadStreamOptions, WriteStreamOptions};
pub use provider::{Fd, HandleProvider, MemoryProvider, Op, StdFsProvider};
pub use read_stream::ReadStream;
pub use write_stream::WriteStream;
