//! Custom error types for the crate.
//!
//! This module defines the primary error type, `OppError`, and the three
//! domain error families it consolidates. Using the `thiserror` crate, every
//! layer gets an error enum of its own while the batch orchestrator can still
//! reason about all of them through one type.
//!
//! ## Error Hierarchy
//!
//! - **`Format`**: the particle file is malformed (bad header, truncated rows,
//!   row framing mismatch, corrupt gzip stream). Scoped to one file.
//! - **`Parameter`**: gating parameters are missing or out of range. Scoped to
//!   one file.
//! - **`Storage`**: the SQLite store is unreachable or a write kept failing
//!   after the retry budget. Fatal to a batch run.
//! - **`FileName`**: a path does not follow the EVT/OPP naming convention.
//! - **`Io`**: reading an input or writing an output file failed.
//! - **`Config`**: the layered configuration could not be extracted or failed
//!   validation.
//!
//! By using `#[from]`, `OppError` can be created from the underlying error
//! types with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, OppError>;

/// Malformed particle file content, detected at decode time.
#[derive(Error, Debug)]
pub enum FormatError {
    /// Fewer than four bytes were available for the row count header.
    #[error("file header is {0} bytes, expected 4")]
    ShortHeader(usize),

    /// The header declares zero rows.
    #[error("file has no particle data (header row count is 0)")]
    Empty,

    /// Fewer row bytes than the header declares.
    #[error("file is truncated: header declares {declared} rows ({expected} bytes), found {actual} bytes")]
    Truncated {
        /// Row count from the header
        declared: u32,
        /// Byte count required by the header
        expected: usize,
        /// Byte count actually present
        actual: usize,
    },

    /// Row data is not a whole number of rows.
    #[error("row data is {actual} bytes, not a multiple of the {row_width}-byte row width")]
    RowFraming {
        /// Byte count present after the header
        actual: usize,
        /// Width of one row in bytes
        row_width: usize,
    },

    /// More whole rows are present than the header declares.
    #[error("header declares {declared} rows but file contains {present}")]
    RowCountMismatch {
        /// Row count from the header
        declared: u32,
        /// Rows physically present
        present: usize,
    },

    /// A gzip stream could not be decompressed.
    #[error("gzip stream is corrupt: {0}")]
    Gzip(#[source] std::io::Error),
}

/// Invalid gating parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    /// A required parameter was not supplied.
    #[error("missing required filter parameter '{0}'")]
    Missing(&'static str),

    /// A parameter is NaN or infinite.
    #[error("filter parameter '{name}' must be a finite number, got {value}")]
    NotFinite {
        /// Parameter name
        name: &'static str,
        /// Offending value
        value: f64,
    },

    /// Width must be strictly positive.
    #[error("filter parameter 'width' must be > 0, got {0}")]
    NonPositiveWidth(f64),

    /// A sampling parameter lies outside its allowed range.
    #[error("parameter '{name}' must be {expected}, got {value}")]
    OutOfRange {
        /// Parameter name
        name: &'static str,
        /// Offending value
        value: f64,
        /// Allowed range, in words
        expected: &'static str,
    },

    /// Notch inference needs at least one aligned particle.
    #[error("no aligned particles available to infer {0}")]
    NoAlignedParticles(&'static str),
}

/// Persistence failure in the backing store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite reported an error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store stayed locked through every retry attempt.
    #[error("database still busy after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Attempts made, including the first
        attempts: u32,
        /// Last error observed
        #[source]
        source: rusqlite::Error,
    },
}

/// Primary error type for the crate.
///
/// Errors fall into two broad categories:
///
/// 1. **File-scoped** - `Format`, `Parameter`, `FileName`, `Io`
///    - Recorded against a single input file
///    - The batch moves on to the next file
///
/// 2. **Run-scoped** - `Storage`, `Config`
///    - Stop the batch; never silently swallowed
#[derive(Error, Debug)]
pub enum OppError {
    /// Particle file decode failed.
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// Gating parameters were invalid.
    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    /// Backing store failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Path does not follow the EVT/OPP naming convention.
    #[error("Invalid SeaFlow file name: {0}")]
    FileName(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or validated.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker task panicked or was aborted.
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl OppError {
    /// Whether the error only invalidates the file being processed.
    pub fn is_file_scoped(&self) -> bool {
        matches!(
            self,
            OppError::Format(_) | OppError::Parameter(_) | OppError::FileName(_) | OppError::Io(_)
        )
    }
}

impl From<rusqlite::Error> for OppError {
    fn from(err: rusqlite::Error) -> Self {
        OppError::Storage(StorageError::Sqlite(err))
    }
}

impl From<figment::Error> for OppError {
    fn from(err: figment::Error) -> Self {
        OppError::Config(err.to_string())
    }
}
