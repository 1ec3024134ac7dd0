use std::fmt;

/// The kind of failure a core operation reported.
///
/// Mirrors the error taxonomy every back-end shares: callers match on
/// `kind()` rather than downcasting, the same way the upstream crate this
/// one grew from keeps a single flat `Error` enum at the root.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorKind {
    /// A caller-supplied type, number or range was outside the contract.
    ArgumentInvalid,
    /// Magic bytes did not match during `open`.
    FormatMagic,
    /// A `block_walk` range fell outside `[first_block, last_block]`.
    WalkRange,
    /// A cell/block address was outside its valid range.
    BlockNumber,
    /// An inode fell outside `[first_inode, last_inode]`.
    InodeNumber,
    /// The underlying image read returned short or failed.
    ReadError,
    /// A structure was internally inconsistent (length, cross-page cell, ...).
    InodeCorrupt,
    /// UTF-16 to UTF-8 transcoding failed; display falls back to empty.
    UnicodeError,
    /// The operation (fscheck, journal, unknown format) is not implemented.
    Unsupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ArgumentInvalid => "argument invalid",
            ErrorKind::FormatMagic => "format magic mismatch",
            ErrorKind::WalkRange => "walk range invalid",
            ErrorKind::BlockNumber => "block number invalid",
            ErrorKind::InodeNumber => "inode number invalid",
            ErrorKind::ReadError => "read error",
            ErrorKind::InodeCorrupt => "inode corrupt",
            ErrorKind::UnicodeError => "unicode conversion error",
            ErrorKind::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

/// Error type returned by every fallible core operation.
///
/// Carries the two free-form message strings described for the per-handle
/// last-error slot: `context` names the operation/field, `detail` carries
/// whatever extra information was available (an address, a raw value, an
/// underlying IO message).
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    context: String,
    detail: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: impl Into<String>, detail: impl Into<String>) -> Self {
        Error {
            kind,
            context: context.into(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}: {}", self.kind, self.context)
        } else {
            write!(f, "{}: {} ({})", self.kind, self.context, self.detail)
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::ReadError, "image read", err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

macro_rules! bail {
    ($kind:expr, $ctx:expr) => {
        return Err(crate::error::Error::new($kind, $ctx, String::new()))
    };
    ($kind:expr, $ctx:expr, $detail:expr) => {
        return Err(crate::error::Error::new($kind, $ctx, $detail))
    };
}

pub(crate) use bail;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context_and_detail() {
        let err = Error::new(ErrorKind::WalkRange, "block_walk", "start=99 end=1");
        let rendered = err.to_string();
        assert!(rendered.contains("walk range invalid"));
        assert!(rendered.contains("block_walk"));
        assert!(rendered.contains("start=99"));
    }

    #[test]
    fn io_error_maps_to_read_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = io_err.into();
        assert_eq!(err.kind(), ErrorKind::ReadError);
    }
}
