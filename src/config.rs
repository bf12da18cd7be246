//! Archiver daemon configuration (SPEC_FULL §A.3): CLI flags validated
//! into one struct shared by the sniffer, ring buffer, transform and
//! wire-protocol server.

use std::path::PathBuf;

use crate::error::{FaError, Result};

/// Parsed and validated configuration for the `fa-archiver` daemon.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    /// Path to the prepared archive file.
    pub archive_path: PathBuf,
    /// Ring buffer capacity in blocks.
    pub buffer_block_count: usize,
    /// TCP socket bind address (host:port or just a port on `0.0.0.0`).
    pub socket_addr: String,
    /// Override for the sniffer's reported entry count, when the device
    /// can supply fewer ids than the archive's `n`.
    pub entry_count_override: Option<usize>,
    /// Use the synthetic sniffer instead of the real character device
    /// (`-F` in the original CLI: fake/force a software source).
    pub use_synthetic_sniffer: bool,
    /// Character device path for the real sniffer.
    pub device_path: PathBuf,
    /// Suppress informational logging.
    pub quiet: bool,
}

impl ArchiverConfig {
    /// Validate cross-field invariants not enforceable at parse time.
    pub fn validate(&self, archive_n: usize) -> Result<()> {
        if self.buffer_block_count == 0 {
            return Err(FaError::fatal("buffer block count must be nonzero"));
        }
        if let Some(entry_count) = self.entry_count_override {
            if entry_count == 0 || entry_count > archive_n {
                return Err(FaError::fatal(format!(
                    "entry count override {entry_count} is not in 1..={archive_n}"
                )));
            }
        }
        if self.socket_addr.is_empty() {
            return Err(FaError::fatal("socket address must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ArchiverConfig {
        ArchiverConfig {
            archive_path: PathBuf::from("/tmp/archive.dat"),
            buffer_block_count: 256,
            socket_addr: "0.0.0.0:8888".to_string(),
            entry_count_override: None,
            use_synthetic_sniffer: false,
            device_path: PathBuf::from("/dev/fa_sniffer0"),
            quiet: false,
        }
    }

    #[test]
    fn rejects_zero_buffer_block_count() {
        let mut config = base_config();
        config.buffer_block_count = 0;
        assert!(config.validate(256).is_err());
    }

    #[test]
    fn rejects_entry_count_override_above_archive_n() {
        let mut config = base_config();
        config.entry_count_override = Some(512);
        assert!(config.validate(256).is_err());
    }

    #[test]
    fn accepts_sane_defaults() {
        let config = base_config();
        assert!(config.validate(256).is_ok());
    }
}
