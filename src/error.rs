//! Error types for kmerforge.
//!
//! Command-line parsing and validation problems are collected into a
//! [`CommandErrors`] list and reported together; runtime problems inside a
//! shard surface as [`EngineError`] and abort the run.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while evaluating an operation tree or building a database.
#[derive(Debug, Error)]
pub enum EngineError {
    /// K-mer length is outside the valid range.
    #[error("invalid k-mer length {k}: must be between {min} and {max}")]
    InvalidKmerLength { k: usize, min: usize, max: usize },

    /// An input stream produced k-mers out of order, or a database file is
    /// internally inconsistent.
    #[error("corrupt input: {details}")]
    CorruptInput { details: String },

    /// A modify recipe hit an arithmetic edge case, e.g. division by zero
    /// outside the zero-coercing mode.
    #[error("invalid modify: {details}")]
    InvalidModify { details: String },

    /// Failed to read a sequence file.
    #[error("failed to read sequence file '{path}': {details}")]
    SequenceRead { details: String, path: PathBuf },

    /// Failed to read a database file.
    #[error("failed to read database file '{path}': {source}")]
    DatabaseRead {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to write a database file.
    #[error("failed to write database file '{path}': {source}")]
    DatabaseWrite {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// A database file exists but is not valid.
    #[error("invalid database file '{path}': {details}")]
    InvalidDatabase { details: String, path: PathBuf },

    /// Failed to serialize or parse a database index.
    #[error("invalid database index: {source}")]
    Index {
        #[source]
        source: serde_json::Error,
    },

    /// Underlying file system failure.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl From<serde_json::Error> for EngineError {
    fn from(source: serde_json::Error) -> Self {
        EngineError::Index { source }
    }
}

/// All problems found while parsing and validating a command line.
///
/// The builder never aborts on the first problem; it finishes the scan and
/// reports everything at once.
#[derive(Debug, Default)]
pub struct CommandErrors {
    pub errors: Vec<String>,
}

impl std::error::Error for CommandErrors {}

impl CommandErrors {
    #[must_use]
    pub fn new(errors: Vec<String>) -> Self {
        Self { errors }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }
}

impl fmt::Display for CommandErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} error(s) in command line:", self.errors.len())?;
        for e in &self.errors {
            writeln!(f, "  {e}")?;
        }
        Ok(())
    }
}
