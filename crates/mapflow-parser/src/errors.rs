use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ReaderAttempt {
    pub reader: &'static str,
    pub message: String,
}

impl ReaderAttempt {
    pub fn new(reader: &'static str, message: impl Into<String>) -> Self {
        Self {
            reader,
            message: message.into(),
        }
    }
}

impl fmt::Display for ReaderAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reader, self.message)
    }
}

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("{reader} format mismatch: {reason}")]
    FormatMismatch {
        reader: &'static str,
        reason: String,
    },

    #[error("{reader} source has no {field} column (available: {available:?})")]
    MissingField {
        reader: &'static str,
        field: &'static str,
        available: Vec<String>,
    },

    #[error("{reader} configured {field} column '{column}' is not present in the source")]
    UnknownColumn {
        reader: &'static str,
        field: &'static str,
        column: String,
    },

    #[error("{reader} CSV error: {source}")]
    Csv {
        reader: &'static str,
        #[source]
        source: csv::Error,
    },

    #[error("{reader} source did not contain any rows")]
    EmptyData { reader: &'static str },

    #[error("no reader recognized this source; attempts: {attempts:?}")]
    NoMatchingReader { attempts: Vec<ReaderAttempt> },
}

impl ReaderError {
    /// True when the source is readable but lacks a field every point needs.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            ReaderError::MissingField { .. } | ReaderError::UnknownColumn { .. }
        )
    }
}
