//! Error types for the device communication pipeline.
//!
//! Every fallible operation in the crate returns [`CortexError`]. Errors are grouped
//! into categories that tell the caller how far the damage reaches:
//!
//! - **Transport**: the byte stream timed out, was reset, or hit an OS I/O error.
//!   The device should be treated as unavailable.
//! - **Protocol**: the stream is corrupted or the peer misbehaves (bad magic, CRC,
//!   version, oversized frame). Never repaired silently.
//! - **Chunk**: a fragmented message arrived out of order or did not match the
//!   receiver's expectations. The message is failed, not retried.
//! - **Application**: the remote process diverged from what the harness expects
//!   (session restart, adapter-reported error, unexpected frame kind).
//! - **Configuration**: local setup problems detected before any I/O happens.
//!
//! Each error also carries a stable numeric [`code`](CortexError::code) that is written
//! into telemetry records and ERROR frames.
//!
//! ```rust
//! use cortex::{CortexError, ErrorCategory};
//!
//! let error = CortexError::SequenceMismatch { expected: 7, found: 8 };
//! assert_eq!(error.category(), ErrorCategory::Chunk);
//! assert!(!error.is_retryable());
//! ```

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T, E = CortexError> = std::result::Result<T, E>;

/// Coarse classification of a [`CortexError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Chunk,
    Application,
    Configuration,
}

/// Main error type for the pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CortexError {
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection reset: {context}")]
    ConnectionReset { context: String },

    #[error("I/O error during {context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Frame magic not found after scanning {scanned} bytes")]
    MagicNotFound { scanned: usize },

    #[error("CRC mismatch: header says {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Protocol version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("Frame payload of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge { length: usize, max: usize },

    #[error("Buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Unknown frame type code {code}")]
    UnknownFrameType { code: u8 },

    #[error("Malformed {context}: {details}")]
    Malformed { context: String, details: String },

    #[error("Sequence mismatch: expected {expected}, found {found}")]
    SequenceMismatch { expected: u32, found: u32 },

    #[error("Session mismatch: expected {expected:#010x}, found {found:#010x} (adapter restarted?)")]
    SessionMismatch { expected: u32, found: u32 },

    #[error("Unexpected frame: expected {expected}, found {found}")]
    UnexpectedFrame { expected: &'static str, found: &'static str },

    #[error("Adapter reported error {code}: {message}")]
    Adapter { code: u32, message: String },

    #[error("Kernel '{kernel}' failed: {reason}")]
    Kernel { kernel: String, reason: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Invalid transport URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Failed to spawn adapter {path}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serial port {path} error")]
    Serial {
        path: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Cannot {operation} while device is {state}")]
    InvalidState { operation: &'static str, state: &'static str },

    #[error("{feature} is only available on {required_platform}")]
    UnsupportedPlatform { feature: String, required_platform: String },
}

impl CortexError {
    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CortexError::Timeout { .. }
            | CortexError::ConnectionReset { .. }
            | CortexError::Io { .. }
            | CortexError::Serial { .. } => ErrorCategory::Transport,
            CortexError::MagicNotFound { .. }
            | CortexError::CrcMismatch { .. }
            | CortexError::VersionMismatch { .. }
            | CortexError::FrameTooLarge { .. }
            | CortexError::BufferTooSmall { .. }
            | CortexError::UnknownFrameType { .. }
            | CortexError::Malformed { .. } => ErrorCategory::Protocol,
            CortexError::SequenceMismatch { .. } => ErrorCategory::Chunk,
            CortexError::SessionMismatch { .. }
            | CortexError::UnexpectedFrame { .. }
            | CortexError::Adapter { .. }
            | CortexError::Kernel { .. } => ErrorCategory::Application,
            CortexError::Config { .. }
            | CortexError::InvalidUri { .. }
            | CortexError::Spawn { .. }
            | CortexError::InvalidState { .. }
            | CortexError::UnsupportedPlatform { .. } => ErrorCategory::Configuration,
        }
    }

    /// Stable numeric code used in telemetry records and ERROR frames.
    pub fn code(&self) -> u32 {
        match self {
            CortexError::Timeout { .. } => 1,
            CortexError::ConnectionReset { .. } => 2,
            CortexError::Io { .. } => 3,
            CortexError::Serial { .. } => 4,
            CortexError::MagicNotFound { .. } => 10,
            CortexError::CrcMismatch { .. } => 11,
            CortexError::VersionMismatch { .. } => 12,
            CortexError::FrameTooLarge { .. } => 13,
            CortexError::BufferTooSmall { .. } => 14,
            CortexError::UnknownFrameType { .. } => 15,
            CortexError::Malformed { .. } => 16,
            CortexError::SequenceMismatch { .. } => 20,
            CortexError::SessionMismatch { .. } => 30,
            CortexError::UnexpectedFrame { .. } => 31,
            // Adapter errors forward the remote code so telemetry shows what the device said.
            CortexError::Adapter { code, .. } => *code,
            CortexError::Kernel { .. } => 33,
            CortexError::Config { .. } => 40,
            CortexError::InvalidUri { .. } => 41,
            CortexError::Spawn { .. } => 42,
            CortexError::InvalidState { .. } => 43,
            CortexError::UnsupportedPlatform { .. } => 44,
        }
    }

    /// Returns whether the operation may succeed if the caller tries again.
    ///
    /// Nothing in the crate retries on its own; this only informs caller policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CortexError::Timeout { .. } | CortexError::Io { .. })
    }

    /// Classify an I/O error, folding timeouts and peer resets into their own variants.
    pub fn from_io(context: impl Into<String>, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                CortexError::Timeout { duration: Duration::ZERO }
            }
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => {
                CortexError::ConnectionReset { context: format!("{}: {}", context.into(), source) }
            }
            _ => CortexError::Io { context: context.into(), source },
        }
    }

    /// Helper constructor for malformed payloads.
    pub fn malformed(context: impl Into<String>, details: impl Into<String>) -> Self {
        CortexError::Malformed { context: context.into(), details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        CortexError::Config { reason: reason.into() }
    }

    /// Helper constructor for URI errors.
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        CortexError::InvalidUri { uri: uri.into(), reason: reason.into() }
    }

    /// Helper constructor for kernel failures.
    pub fn kernel(kernel: impl Into<String>, reason: impl Into<String>) -> Self {
        CortexError::Kernel { kernel: kernel.into(), reason: reason.into() }
    }

    /// Helper constructor for unsupported platform errors.
    pub fn unsupported_platform(
        feature: impl Into<String>,
        required_platform: impl Into<String>,
    ) -> Self {
        CortexError::UnsupportedPlatform {
            feature: feature.into(),
            required_platform: required_platform.into(),
        }
    }
}

impl From<io::Error> for CortexError {
    fn from(err: io::Error) -> Self {
        CortexError::from_io("I/O operation", err)
    }
}

/// Multiply sizes, turning overflow into a configuration error.
pub(crate) fn checked_size(what: &str, factors: &[usize]) -> Result<usize> {
    factors.iter().try_fold(1usize, |acc, &f| acc.checked_mul(f)).ok_or_else(|| {
        CortexError::config(format!("{} overflows: {:?}", what, factors))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn messages_carry_their_context(
                expected in any::<u32>(),
                found in any::<u32>(),
                length in 0usize..1_000_000,
                details in "[a-z ]{1,40}"
            ) {
                let seq = CortexError::SequenceMismatch { expected, found };
                let msg = seq.to_string();
                prop_assert!(msg.contains(&expected.to_string()));
                prop_assert!(msg.contains(&found.to_string()));

                let large = CortexError::FrameTooLarge { length, max: 65536 };
                prop_assert!(large.to_string().contains(&length.to_string()));

                let malformed = CortexError::malformed("HELLO", details.clone());
                prop_assert!(malformed.to_string().contains(&details));
            }

            #[test]
            fn adapter_codes_pass_through(code in 1000u32..u32::MAX) {
                let err = CortexError::Adapter { code, message: "kernel blew up".into() };
                prop_assert_eq!(err.code(), code);
                prop_assert_eq!(err.category(), ErrorCategory::Application);
            }
        }
    }

    #[test]
    fn io_errors_are_classified() {
        let timeout = CortexError::from_io("recv", io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(timeout, CortexError::Timeout { .. }));

        let reset = CortexError::from_io("send", io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(reset, CortexError::ConnectionReset { .. }));
        assert_eq!(reset.category(), ErrorCategory::Transport);

        let other: CortexError = io::Error::other("disk on fire").into();
        assert!(matches!(other, CortexError::Io { .. }));
    }

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(CortexError::MagicNotFound { scanned: 3 }.category(), ErrorCategory::Protocol);
        assert_eq!(
            CortexError::CrcMismatch { expected: 1, actual: 2 }.category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            CortexError::SessionMismatch { expected: 1, found: 2 }.category(),
            ErrorCategory::Application
        );
        assert_eq!(CortexError::config("bad").category(), ErrorCategory::Configuration);
    }

    #[test]
    fn codes_are_distinct() {
        let errors = [
            CortexError::Timeout { duration: Duration::ZERO },
            CortexError::ConnectionReset { context: String::new() },
            CortexError::MagicNotFound { scanned: 0 },
            CortexError::CrcMismatch { expected: 0, actual: 0 },
            CortexError::VersionMismatch { expected: 1, found: 2 },
            CortexError::FrameTooLarge { length: 0, max: 0 },
            CortexError::BufferTooSmall { needed: 0, capacity: 0 },
            CortexError::SequenceMismatch { expected: 0, found: 1 },
            CortexError::SessionMismatch { expected: 0, found: 1 },
            CortexError::config("x"),
        ];
        let mut codes: Vec<u32> = errors.iter().map(CortexError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn checked_size_reports_overflow() {
        assert_eq!(checked_size("window", &[160, 64]).unwrap(), 10_240);
        let err = checked_size("window", &[usize::MAX, 2]).unwrap_err();
        assert!(matches!(err, CortexError::Config { .. }));
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<CortexError>();
    }
}
