//! `file://` URL to filesystem path conversion

use std::path::{Path, PathBuf};

use crate::error::{Result, StreamError};

const FILE_SCHEME: &str = "file://";

/// Returns the filesystem path for `path`, converting it first if it is a
/// `file://` URL. Anything else comes back unchanged.
pub fn to_path_if_file_url(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(s) if has_file_scheme(s) => file_url_to_path(s),
        _ => Ok(path.to_path_buf()),
    }
}

fn has_file_scheme(s: &str) -> bool {
    s.get(..FILE_SCHEME.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(FILE_SCHEME))
}

/// Converts a `file://` URL to a path.
///
/// The host must be empty or `localhost`. Query and fragment are dropped,
/// percent escapes are decoded, and an escaped `/` is rejected.
pub fn file_url_to_path(url: &str) -> Result<PathBuf> {
    if !has_file_scheme(url) {
        return Err(StreamError::invalid_argument(format!(
            "URL must be of scheme file: {}",
            url
        )));
    }
    let rest = &url[FILE_SCHEME.len()..];
    let rest = rest.split(['?', '#']).next().unwrap_or_default();

    let (host, raw_path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if !host.is_empty() && !host.eq_ignore_ascii_case("localhost") {
        return Err(StreamError::invalid_argument(format!(
            "file URL host must be \"localhost\" or empty: {}",
            url
        )));
    }
    if contains_encoded_separator(raw_path) {
        return Err(StreamError::invalid_argument(format!(
            "file URL path must not include encoded / characters: {}",
            url
        )));
    }

    bytes_to_path(percent_decode(raw_path), url)
}

fn contains_encoded_separator(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.windows(3).any(|w| match w {
        [b'%', b'2', b'f' | b'F'] => true,
        [b'%', b'5', b'c' | b'C'] => cfg!(windows),
        _ => false,
    })
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decodes `%XX` escapes; malformed escapes are kept literally.
fn percent_decode(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

#[cfg(unix)]
fn bytes_to_path(bytes: Vec<u8>, _url: &str) -> Result<PathBuf> {
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;
    Ok(PathBuf::from(OsString::from_vec(bytes)))
}

#[cfg(not(unix))]
fn bytes_to_path(bytes: Vec<u8>, url: &str) -> Result<PathBuf> {
    let s = String::from_utf8(bytes).map_err(|e| {
        StreamError::with_kind_and_source(
            crate::error::ErrorCategory::User,
            crate::error::ErrorKind::InvalidArgument,
            format!("file URL path is not valid UTF-8: {}", url),
            e,
        )
    })?;
    // "/C:/dir" -> "C:\dir"
    let trimmed = match s.as_bytes() {
        [b'/', drive, b':', ..] if drive.is_ascii_alphabetic() => &s[1..],
        _ => s.as_str(),
    };
    Ok(PathBuf::from(trimmed.replace('/', "\\")))
}
