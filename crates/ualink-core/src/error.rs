// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Error types for the protocol-agnostic building blocks.
//!
//! # Error Hierarchy
//!
//! ```text
//! CoreError
//! ├── HandleExhausted - every value in the handle space is in use
//! ├── InvalidBackoff  - rejected backoff configuration
//! └── Logging         - subscriber installation failed
//! ```
//!
//! Handle exhaustion is a programmer-error class failure: it means monitored
//! item bookkeeping leaked handles. It is never retried.

use thiserror::Error;

// =============================================================================
// CoreError
// =============================================================================

/// Errors raised by `ualink-core` components.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Every handle in the sequence's space was reported in use.
    #[error("Client handle space exhausted after scanning {scanned} values (seed {seed})")]
    HandleExhausted {
        /// Value the scan started from.
        seed: u32,
        /// Number of candidates examined.
        scanned: u64,
    },

    /// A backoff configuration was rejected.
    #[error("Invalid backoff configuration: {reason}")]
    InvalidBackoff {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// The global tracing subscriber could not be installed.
    #[error("Failed to initialize logging: {message}")]
    Logging {
        /// Error message from the subscriber.
        message: String,
    },
}

impl CoreError {
    /// Creates a handle exhaustion error.
    pub fn handle_exhausted(seed: u32, scanned: u64) -> Self {
        Self::HandleExhausted { seed, scanned }
    }

    /// Creates an invalid backoff error.
    pub fn invalid_backoff(reason: impl Into<String>) -> Self {
        Self::InvalidBackoff {
            reason: reason.into(),
        }
    }

    /// Returns `true` if retrying the operation could succeed.
    ///
    /// None of the core failures are transient.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Returns `true` for failures that indicate a bug in the caller.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, Self::HandleExhausted { .. })
    }
}

/// Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_exhausted_display() {
        let err = CoreError::handle_exhausted(7, 16);
        assert_eq!(
            err.to_string(),
            "Client handle space exhausted after scanning 16 values (seed 7)"
        );
        assert!(err.is_programmer_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_backoff() {
        let err = CoreError::invalid_backoff("multiplier must be >= 1.0");
        assert!(!err.is_programmer_error());
        assert!(err.to_string().contains("multiplier"));
    }
}
