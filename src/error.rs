//! Error types for loading, preprocessing and batching.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by brats-prep.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The first bytes of the file are not a NIfTI-1 header.
    #[error("invalid NIfTI magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),

    /// The header declares a datatype this crate cannot decode.
    #[error("unsupported data type code: {0}")]
    UnsupportedDataType(i16),

    /// Header dimensions are malformed or inconsistent.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// The file is structurally invalid (truncated, extensions, ...).
    #[error("invalid file format: {0}")]
    InvalidFileFormat(String),

    /// Gzip stream could not be decoded.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// A volume could not be loaded from disk.
    #[error("failed to load {}: {reason}", path.display())]
    Load {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying failure.
        reason: Box<Error>,
    },

    /// The volume has zero (or undefined) variance and cannot be normalized.
    #[error("degenerate volume: {0}")]
    DegenerateVolume(String),

    /// An array has a shape the operation cannot handle.
    #[error("shape error: {0}")]
    Shape(String),

    /// A split requested more subjects than the source directory holds.
    #[error("insufficient population: requested {requested} subjects, only {available} available")]
    InsufficientPopulation {
        /// Number of subjects requested.
        requested: usize,
        /// Number of subjects found.
        available: usize,
    },

    /// Every subject of a batch slice failed to preprocess.
    #[error("batch in pass {pass} is empty: all {} subjects failed", failures.len())]
    EmptyBatch {
        /// Pass the slice belonged to.
        pass: usize,
        /// Per-subject failures, in slice order.
        failures: Vec<SkippedSubject>,
    },

    /// A batch generator was created over an empty subject pool.
    #[error("subject pool is empty")]
    EmptyPool,

    /// Invalid user configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// A subject dropped from a batch together with the reason.
#[derive(Debug)]
pub struct SkippedSubject {
    /// Subject identifier (directory base name).
    pub id: String,
    /// Why preprocessing failed.
    pub error: Error,
}

impl std::fmt::Display for SkippedSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.id, self.error)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap `reason` as a load failure for `path`.
    ///
    /// Already-wrapped load errors are returned unchanged.
    pub fn load(path: impl Into<PathBuf>, reason: Error) -> Self {
        match reason {
            Self::Load { .. } => reason,
            other => Self::Load {
                path: path.into(),
                reason: Box::new(other),
            },
        }
    }

    /// Create a shape error.
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    /// True for failures that come from reading a volume.
    pub fn is_load(&self) -> bool {
        matches!(self, Self::Load { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_wraps_once() {
        let inner = Error::InvalidMagic(*b"BAD!");
        let wrapped = Error::load("a.nii", inner);
        let rewrapped = Error::load("b.nii", wrapped);
        match rewrapped {
            Error::Load { path, reason } => {
                assert_eq!(path, PathBuf::from("a.nii"));
                assert!(matches!(*reason, Error::InvalidMagic(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_messages_name_the_file() {
        let err = Error::load("/data/s1/s1-t2f.nii.gz", Error::Decompression("eof".into()));
        let msg = err.to_string();
        assert!(msg.contains("s1-t2f.nii.gz"));
        assert!(msg.contains("decompression failed"));
    }

    #[test]
    fn test_empty_batch_counts_failures() {
        let err = Error::EmptyBatch {
            pass: 3,
            failures: vec![
                SkippedSubject {
                    id: "a".into(),
                    error: Error::EmptyPool,
                },
                SkippedSubject {
                    id: "b".into(),
                    error: Error::EmptyPool,
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "batch in pass 3 is empty: all 2 subjects failed"
        );
    }
}
