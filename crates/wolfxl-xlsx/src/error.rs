use std::path::PathBuf;

use thiserror::Error;
use wolfxl_model::{A1ParseError, NameError, RangeParseError};

/// Coarse classification of [`XlsxError`], for callers that only care about recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The container cannot be opened or a managed part fails to parse.
    MalformedPackage,
    /// An edit names a missing sheet or an invalid coordinate/range. The session stays usable.
    UnresolvableEdit,
    /// Style or string resolution disagreed with prior session state. Fatal to the flush.
    PoolInconsistency,
    /// Emitting the new container failed. The source and the pending edits are intact.
    WriteFailure,
    /// The call is not valid for this session (read-only, closed).
    Usage,
}

#[derive(Debug, Error)]
pub enum XlsxError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("xml attribute error: {0}")]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),
    #[error("xml parse error: {0}")]
    XmlTree(#[from] roxmltree::Error),
    #[error("utf-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("utf-8 error: {0}")]
    FromUtf8(#[from] std::string::FromUtf8Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing required part: {0}")]
    MissingPart(String),
    #[error("part {part} is too large: {size} bytes uncompressed (max {max})")]
    PartTooLarge { part: String, size: u64, max: u64 },
    #[error("package has too many parts: {count} (max {max})")]
    TooManyParts { count: usize, max: usize },
    #[error("malformed {part}: {reason}")]
    Malformed { part: String, reason: String },
    #[error("unknown sheet: {0}")]
    UnknownSheet(String),
    #[error("sheet already exists: {0}")]
    DuplicateSheet(String),
    #[error("invalid cell reference: {0}")]
    InvalidCellRef(#[from] A1ParseError),
    #[error("invalid range: {0}")]
    InvalidRange(#[from] RangeParseError),
    #[error("invalid defined name: {0}")]
    InvalidName(#[from] NameError),
    #[error("invalid edit: {0}")]
    InvalidEdit(String),
    #[error("pool inconsistency: {0}")]
    PoolInconsistency(String),
    #[error("failed to write {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session is read-only; open it with modify=true to edit")]
    ReadOnly,
    #[error("session is closed")]
    Closed,
}

impl XlsxError {
    pub(crate) fn malformed(part: impl Into<String>, reason: impl Into<String>) -> Self {
        XlsxError::Malformed {
            part: part.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            XlsxError::Open { .. }
            | XlsxError::Zip(_)
            | XlsxError::Xml(_)
            | XlsxError::XmlAttr(_)
            | XlsxError::XmlTree(_)
            | XlsxError::Utf8(_)
            | XlsxError::FromUtf8(_)
            | XlsxError::Io(_)
            | XlsxError::MissingPart(_)
            | XlsxError::PartTooLarge { .. }
            | XlsxError::TooManyParts { .. }
            | XlsxError::Malformed { .. } => ErrorKind::MalformedPackage,
            XlsxError::UnknownSheet(_)
            | XlsxError::DuplicateSheet(_)
            | XlsxError::InvalidCellRef(_)
            | XlsxError::InvalidRange(_)
            | XlsxError::InvalidName(_)
            | XlsxError::InvalidEdit(_) => ErrorKind::UnresolvableEdit,
            XlsxError::PoolInconsistency(_) => ErrorKind::PoolInconsistency,
            XlsxError::WriteFailure { .. } => ErrorKind::WriteFailure,
            XlsxError::ReadOnly | XlsxError::Closed => ErrorKind::Usage,
        }
    }

    /// Re-tag container/IO errors raised while emitting `path` as write failures.
    pub(crate) fn into_write_failure(self, path: impl Into<PathBuf>) -> Self {
        match self {
            XlsxError::Io(source) => XlsxError::WriteFailure {
                path: path.into(),
                source,
            },
            XlsxError::Zip(err) => XlsxError::WriteFailure {
                path: path.into(),
                source: std::io::Error::other(err),
            },
            other => other,
        }
    }
}
