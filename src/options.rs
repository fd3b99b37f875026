//! Stream configuration
//!
//! Every recognized option is an explicit field with a default; values are
//! validated when a stream is constructed, never later.

use std::fmt;
use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{ErrorCategory, ErrorKind, Result, StreamError};
use crate::lifecycle::StreamObserver;
use crate::provider::{Fd, HandleProvider};

/// Default creation mode: read/write for owner, group and other.
pub const DEFAULT_MODE: u32 = 0o666;

/// Default readable chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Recognized text encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Utf16Le,
    Latin1,
    Ascii,
    Base64,
    Base64Url,
    Hex,
}

impl Encoding {
    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Utf16Le => "utf16le",
            Encoding::Latin1 => "latin1",
            Encoding::Ascii => "ascii",
            Encoding::Base64 => "base64",
            Encoding::Base64Url => "base64url",
            Encoding::Hex => "hex",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = StreamError;

    fn from_str(name: &str) -> Result<Self> {
        let encoding = match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Encoding::Utf8,
            "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => Encoding::Utf16Le,
            "latin1" | "binary" => Encoding::Latin1,
            "ascii" => Encoding::Ascii,
            "base64" => Encoding::Base64,
            "base64url" => Encoding::Base64Url,
            "hex" => Encoding::Hex,
            _ => {
                return Err(StreamError::invalid_argument(format!(
                    "unknown encoding: {:?}",
                    name
                )));
            }
        };
        Ok(encoding)
    }
}

/// Open flags, parsed from the conventional flag strings (`"w"`, `"a+"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
    pub sync: bool,
}

impl OpenFlags {
    /// Read-only access to an existing file (`"r"`).
    pub const READ: OpenFlags = OpenFlags {
        read: true,
        write: false,
        append: false,
        create: false,
        truncate: false,
        exclusive: false,
        sync: false,
    };

    /// Create-or-truncate for writing (`"w"`).
    pub const WRITE: OpenFlags = OpenFlags {
        read: false,
        write: true,
        append: false,
        create: true,
        truncate: true,
        exclusive: false,
        sync: false,
    };

    /// Translates the flags into `std::fs::OpenOptions`, applying `mode` on Unix.
    ///
    /// `sync` has no `OpenOptions` counterpart; providers honor it per write.
    pub fn to_open_options(self, mode: u32) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(self.read)
            .write(self.write || self.append)
            .append(self.append)
            .truncate(self.truncate);
        if self.exclusive {
            opts.create_new(true);
        } else {
            opts.create(self.create);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        opts
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags::WRITE
    }
}

impl FromStr for OpenFlags {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        let base = OpenFlags {
            read: false,
            write: false,
            append: false,
            create: false,
            truncate: false,
            exclusive: false,
            sync: false,
        };
        let flags = match s {
            "r" => OpenFlags { read: true, ..base },
            "rs" | "sr" => OpenFlags {
                read: true,
                sync: true,
                ..base
            },
            "r+" => OpenFlags {
                read: true,
                write: true,
                ..base
            },
            "rs+" | "sr+" => OpenFlags {
                read: true,
                write: true,
                sync: true,
                ..base
            },
            "w" => OpenFlags::WRITE,
            "wx" | "xw" => OpenFlags {
                exclusive: true,
                ..OpenFlags::WRITE
            },
            "w+" => OpenFlags {
                read: true,
                ..OpenFlags::WRITE
            },
            "wx+" | "xw+" => OpenFlags {
                read: true,
                exclusive: true,
                ..OpenFlags::WRITE
            },
            "a" => OpenFlags {
                append: true,
                create: true,
                ..base
            },
            "ax" | "xa" => OpenFlags {
                append: true,
                create: true,
                exclusive: true,
                ..base
            },
            "as" | "sa" => OpenFlags {
                append: true,
                create: true,
                sync: true,
                ..base
            },
            "a+" => OpenFlags {
                read: true,
                append: true,
                create: true,
                ..base
            },
            "ax+" | "xa+" => OpenFlags {
                read: true,
                append: true,
                create: true,
                exclusive: true,
                ..base
            },
            "as+" | "sa+" => OpenFlags {
                read: true,
                append: true,
                create: true,
                sync: true,
                ..base
            },
            _ => {
                return Err(StreamError::invalid_argument(format!(
                    "invalid open flags: {:?}",
                    s
                )));
            }
        };
        Ok(flags)
    }
}

/// Validates a creation mode: permission and special bits only.
pub fn validate_mode(mode: u32) -> Result<u32> {
    if mode > 0o7777 {
        return Err(StreamError::invalid_argument(format!(
            "invalid file mode: {:o}",
            mode
        )));
    }
    Ok(mode)
}

/// Options for [`crate::WriteStream`].
#[derive(Clone)]
pub struct WriteStreamOptions {
    pub flags: OpenFlags,
    pub mode: u32,
    /// Default encoding for text writes. Validated, then retained as metadata.
    pub encoding: Option<Encoding>,
    /// Handle provider; the shared [`crate::provider::StdFsProvider`] when absent.
    pub provider: Option<Arc<dyn HandleProvider>>,
    pub observer: Option<Arc<dyn StreamObserver>>,
    /// Tear the stream down when a write fails outside of a destroy.
    pub auto_destroy: bool,
}

impl Default for WriteStreamOptions {
    fn default() -> Self {
        Self {
            flags: OpenFlags::WRITE,
            mode: DEFAULT_MODE,
            encoding: None,
            provider: None,
            observer: None,
            auto_destroy: true,
        }
    }
}

impl fmt::Debug for WriteStreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteStreamOptions")
            .field("flags", &self.flags)
            .field("mode", &format_args!("{:o}", self.mode))
            .field("encoding", &self.encoding)
            .field("provider", &self.provider.is_some())
            .field("observer", &self.observer.is_some())
            .field("auto_destroy", &self.auto_destroy)
            .finish()
    }
}

impl WriteStreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and sets the flag string.
    pub fn with_flags(mut self, flags: &str) -> Result<Self> {
        self.flags = flags.parse()?;
        Ok(self)
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Parses and sets the default encoding.
    pub fn with_encoding(mut self, encoding: &str) -> Result<Self> {
        self.encoding = Some(encoding.parse()?);
        Ok(self)
    }

    pub fn with_provider(mut self, provider: Arc<dyn HandleProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_auto_destroy(mut self, auto_destroy: bool) -> Self {
        self.auto_destroy = auto_destroy;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_mode(self.mode)?;
        if !self.flags.write && !self.flags.append {
            return Err(StreamError::invalid_argument(
                "write stream requires writable open flags",
            ));
        }
        Ok(())
    }
}

/// Options for [`crate::ReadStream`].
///
/// `fd`, `start`, `end` and `provider` exist so that callers get an explicit
/// "not implemented" rather than having them silently ignored.
#[derive(Clone)]
pub struct ReadStreamOptions {
    pub encoding: Option<Encoding>,
    pub fd: Option<Fd>,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub provider: Option<Arc<dyn HandleProvider>>,
    pub observer: Option<Arc<dyn StreamObserver>>,
    pub chunk_size: usize,
}

impl Default for ReadStreamOptions {
    fn default() -> Self {
        Self {
            encoding: None,
            fd: None,
            start: None,
            end: None,
            provider: None,
            observer: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl fmt::Debug for ReadStreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadStreamOptions")
            .field("encoding", &self.encoding)
            .field("fd", &self.fd)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("provider", &self.provider.is_some())
            .field("observer", &self.observer.is_some())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl ReadStreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and sets the encoding.
    pub fn with_encoding(mut self, encoding: &str) -> Result<Self> {
        self.encoding = Some(encoding.parse()?);
        Ok(self)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Rejects the unsupported option set and normalizes the encoding.
    ///
    /// Returns the effective encoding.
    pub(crate) fn validate(&self) -> Result<Encoding> {
        let mut unsupported = Vec::new();
        if self.fd.is_some() {
            unsupported.push("fd");
        }
        if self.start.is_some() {
            unsupported.push("start");
        }
        if self.end.is_some() {
            unsupported.push("end");
        }
        if self.provider.is_some() {
            unsupported.push("provider");
        }
        if !unsupported.is_empty() {
            return Err(StreamError::with_kind(
                ErrorCategory::User,
                ErrorKind::NotImplemented,
                format!(
                    "read stream with unsupported options ({}) is not implemented",
                    unsupported.join(", ")
                ),
            ));
        }
        if self.chunk_size == 0 {
            return Err(StreamError::invalid_argument("chunk size must be non-zero"));
        }
        Ok(self.encoding.unwrap_or_default())
    }
}
