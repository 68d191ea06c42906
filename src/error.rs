//! Unified error handling.
//!
//! One `thiserror` enum per error-taxonomy category, plus helpers so
//! callers can implement the propagation policy (retry, negative-cache,
//! fatal) without matching on strings.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum CoreError {
    // Transient network errors — retried with backoff at the caller's scope.
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection reset")]
    ConnectionReset,

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("I/O error: {source} (path: {path:?})")]
    Io {
        source: io::Error,
        path: Option<PathBuf>,
    },

    // Circuit-open — recorded, not retried until the probe window opens.
    #[error("circuit open for {service}, retry after {retry_after:?}")]
    CircuitOpen {
        service: String,
        retry_after: Duration,
    },

    // Protocol errors — fatal to the connection, never retried on the same version.
    #[error("bad magic prefix: {0:#010x}")]
    BadMagic(u32),

    #[error("frame length {0} exceeds maximum of 32767")]
    FrameTooLong(usize),

    #[error("hello version too old")]
    TooOldVersion,

    #[error("unknown magic prefix")]
    UnknownMagic,

    #[error("malformed protobuf payload: {0}")]
    MalformedMessage(String),

    #[error("peer violated protocol: {0}")]
    ProtocolViolation(String),

    // Identity/trust errors — fatal to the handshake.
    #[error("peer presented no certificate")]
    NoPeerCert,

    #[error("peer identity mismatch")]
    IdentityMismatch,

    #[error("certificate not yet valid")]
    NotYetValid,

    #[error("certificate expired")]
    Expired,

    #[error("certificate signature invalid")]
    SignatureInvalid,

    #[error("certificate does not match any pin for this device")]
    PinMismatch,

    // Cache-carrying — overrides the default negative-TTL when present.
    #[error("{source} (cache for {cache_for:?})")]
    CacheCarrying {
        #[source]
        source: Box<CoreError>,
        cache_for: Duration,
    },

    // Local filesystem errors — surfaced as unhealthy, never fatal.
    #[error("path does not exist: {0}")]
    PathMissing(PathBuf),

    #[error("path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("marker file missing: {0}")]
    MarkerMissing(PathBuf),

    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    // Resource errors — never fatal, caller degrades.
    #[error("watcher channel overflowed")]
    Overflow,

    #[error("memory reservation denied: requested {requested}, available {available}")]
    ReservationDenied { requested: u64, available: u64 },

    // Certificate store specific.
    #[error("certificate file missing")]
    CertMissing,

    #[error("certificate/key pair invalid")]
    CertInvalid,

    #[error("failed to parse certificate: {0}")]
    CertParse(String),

    // Catch-all for cases the taxonomy above does not name.
    #[error("{0}")]
    Other(String),
}

/// Result alias for fallible operations in this crate's public API.
pub type CoreResult<T> = Result<T, CoreError>;

/// Broad error category, used by callers implementing a propagation
/// policy (log vs. retry vs. alert) without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    TransientNetwork,
    CircuitOpen,
    Protocol,
    IdentityTrust,
    Filesystem,
    Resource,
    Other,
}

impl CoreError {
    /// Category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        use CoreError::*;
        match self {
            Timeout(_) | ConnectionReset | Unreachable(_) | Io { .. } => {
                ErrorCategory::TransientNetwork
            }
            CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            BadMagic(_) | FrameTooLong(_) | TooOldVersion | UnknownMagic
            | MalformedMessage(_) | ProtocolViolation(_) => ErrorCategory::Protocol,
            NoPeerCert | IdentityMismatch | NotYetValid | Expired | SignatureInvalid
            | PinMismatch | CertMissing | CertInvalid | CertParse(_) => {
                ErrorCategory::IdentityTrust
            }
            PathMissing(_) | NotADirectory(_) | MarkerMissing(_) | PermissionDenied(_) => {
                ErrorCategory::Filesystem
            }
            Overflow | ReservationDenied { .. } => ErrorCategory::Resource,
            CacheCarrying { source, .. } => source.category(),
            Other(_) => ErrorCategory::Other,
        }
    }

    /// Whether a caller-driven retry loop is appropriate for this error.
    /// Protocol and identity/trust errors are never retryable on the same
    /// connection/version; transient network and circuit-open errors are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::TransientNetwork | ErrorCategory::CircuitOpen
        )
    }

    /// Negative-cache duration this error carries, if any.
    pub fn cache_for(&self) -> Option<Duration> {
        match self {
            CoreError::CacheCarrying { cache_for, .. } => Some(*cache_for),
            CoreError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Wrap this error with an explicit negative-cache duration.
    pub fn with_cache_for(self, duration: Duration) -> Self {
        CoreError::CacheCarrying {
            source: Box::new(self),
            cache_for: duration,
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(source: io::Error) -> Self {
        CoreError::Io { source, path: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_by_family() {
        assert_eq!(
            CoreError::PinMismatch.category(),
            ErrorCategory::IdentityTrust
        );
        assert_eq!(CoreError::Overflow.category(), ErrorCategory::Resource);
    }

    #[test]
    fn retryability_follows_category() {
        assert!(CoreError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!CoreError::PinMismatch.is_retryable());
        assert!(!CoreError::BadMagic(0).is_retryable());
    }

    #[test]
    fn cache_carrying_overrides_default_ttl() {
        let err = CoreError::Unreachable("10.0.0.1".into()).with_cache_for(Duration::from_secs(7));
        assert_eq!(err.cache_for(), Some(Duration::from_secs(7)));
        assert_eq!(err.category(), ErrorCategory::TransientNetwork);
    }
}
