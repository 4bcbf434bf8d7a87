use std::path::PathBuf;

use thiserror::Error;

/// Failure while reading a CSV image file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read '{}'", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}:{line}: {kind}", path.display())]
    Parse {
        path: PathBuf,
        line: u64,
        kind: ParseErrorKind,
    },
}

impl LoadError {
    pub fn parse_kind(&self) -> Option<&ParseErrorKind> {
        match self {
            LoadError::Parse { kind, .. } => Some(kind),
            LoadError::Io { .. } => None,
        }
    }
}

/// What was wrong with a malformed row.
///
/// Every `index` counts fields from the start of the row: the label is field 0 and
/// pixel `p` is field `p + 1`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("field {index}: '{token}' is not an unsigned integer")]
    NotAnInteger { index: usize, token: String },
    #[error("field {index}: pixel value {value} does not fit in 0..=255")]
    PixelOutOfRange { index: usize, value: u64 },
    #[error("label {label} is not below {classes}")]
    LabelOutOfRange { label: u64, classes: usize },
    #[error("malformed record: {0}")]
    Malformed(String),
}
