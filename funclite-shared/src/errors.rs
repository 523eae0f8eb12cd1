//! Error types used across the funclite runtime.

use thiserror::Error;

/// Result type for funclite operations.
pub type FuncliteResult<T> = Result<T, FuncliteError>;

/// Stable error classification.
///
/// Every error that crosses the engine boundary (into a guest as a thrown
/// error object, or out of the engine as an HTTP-class failure) carries one
/// of these kinds. Guest-visible error objects expose it as a `kind`
/// property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing function, file or DNS name.
    NotFound,
    /// Path escape, denied module, denied network target, forbidden fs op.
    PermissionDenied,
    /// Bad encoding, bad algorithm name, malformed URL.
    InvalidArgument,
    /// Pool exhausted, memory limit, KV quota exceeded.
    ResourceExhausted,
    /// Timeout-triggered termination.
    Canceled,
    /// Bare specifier outside the allowed set.
    ModuleDenied,
    /// Unexpected host-side failure. Always corrupts the guest.
    Internal,
}

impl ErrorKind {
    /// Token used on guest-visible error objects.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::Canceled => "Canceled",
            ErrorKind::ModuleDenied => "ModuleDenied",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FuncliteError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("module not available: {0}")]
    ModuleDenied(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FuncliteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FuncliteError::NotFound(_) => ErrorKind::NotFound,
            FuncliteError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            FuncliteError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FuncliteError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            FuncliteError::Canceled(_) => ErrorKind::Canceled,
            FuncliteError::ModuleDenied(_) => ErrorKind::ModuleDenied,
            FuncliteError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            FuncliteError::NotFound(m)
            | FuncliteError::PermissionDenied(m)
            | FuncliteError::InvalidArgument(m)
            | FuncliteError::ResourceExhausted(m)
            | FuncliteError::Canceled(m)
            | FuncliteError::ModuleDenied(m)
            | FuncliteError::Internal(m) => m,
        }
    }

    /// Rebuild an error from a kind token and message.
    ///
    /// Unknown tokens map to `Internal`; this is the inverse of the guest
    /// error-object convention.
    pub fn from_kind(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "NotFound" => FuncliteError::NotFound(message),
            "PermissionDenied" => FuncliteError::PermissionDenied(message),
            "InvalidArgument" => FuncliteError::InvalidArgument(message),
            "ResourceExhausted" => FuncliteError::ResourceExhausted(message),
            "Canceled" => FuncliteError::Canceled(message),
            "ModuleDenied" => FuncliteError::ModuleDenied(message),
            _ => FuncliteError::Internal(message),
        }
    }
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for FuncliteError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FuncliteError::NotFound("no such file or directory".into()),
            std::io::ErrorKind::PermissionDenied => {
                FuncliteError::PermissionDenied("operation not permitted".into())
            }
            _ => FuncliteError::Internal(format!("I/O error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for FuncliteError {
    fn from(err: serde_json::Error) -> Self {
        FuncliteError::Internal(format!("JSON error: {}", err))
    }
}

impl From<String> for FuncliteError {
    fn from(err: String) -> Self {
        FuncliteError::Internal(err)
    }
}

impl From<&str> for FuncliteError {
    fn from(err: &str) -> Self {
        FuncliteError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err: FuncliteError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn io_errors_never_leak_host_detail() {
        let err: FuncliteError = std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "/host/secret/place denied",
        )
        .into();
        assert!(!err.to_string().contains("/host"));
    }

    #[test]
    fn kind_round_trips_through_token() {
        let err = FuncliteError::ModuleDenied("http".into());
        let back = FuncliteError::from_kind(err.kind_str(), err.message());
        assert_eq!(back.kind(), ErrorKind::ModuleDenied);
        assert_eq!(back.message(), "http");
    }

    #[test]
    fn unknown_token_is_internal() {
        assert_eq!(
            FuncliteError::from_kind("Bogus", "x").kind(),
            ErrorKind::Internal
        );
    }
}
