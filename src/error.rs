//! Centralized error type for the archiver.
//!
//! `FaError` consolidates every failure mode the core pipeline can produce:
//! malformed masks, protocol violations from wire clients, index misses
//! against the archive (time ranges outside what is stored), and the
//! handful of conditions the spec calls *Fatal* (header validation,
//! geometry mismatches, disk I/O failure during a write the archiver
//! cannot recover from). Binaries wrap this in `anyhow::Context` as they
//! cross from library calls into `main`.

use thiserror::Error;

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, FaError>;

#[derive(Error, Debug)]
pub enum FaError {
    /// Filter mask grammar or range error (spec 4.1).
    #[error("mask error: {0}")]
    Mask(String),

    /// A wire client sent something that doesn't parse as a request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A time range or sample range falls outside readable archive data.
    #[error("{0}")]
    Index(String),

    /// Archive/header geometry is inconsistent or corrupt — not recoverable.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FaError {
    pub fn mask(msg: impl Into<String>) -> Self {
        FaError::Mask(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        FaError::Protocol(msg.into())
    }

    pub fn index(msg: impl Into<String>) -> Self {
        FaError::Index(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        FaError::Fatal(msg.into())
    }

    /// Whether this is one of the §7 *Index miss* conditions, which the
    /// wire frontend reports as a single error line rather than tearing
    /// down the connection the way a protocol error does.
    pub fn is_index_miss(&self) -> bool {
        matches!(self, FaError::Index(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_error_displays_message() {
        let err = FaError::mask("id out of range");
        assert_eq!(err.to_string(), "mask error: id out of range");
    }

    #[test]
    fn index_error_is_classified() {
        let err = FaError::index("Start time too late");
        assert!(err.is_index_miss());
        assert!(!FaError::fatal("boom").is_index_miss());
    }
}
