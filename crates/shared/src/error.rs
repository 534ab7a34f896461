/// Status codes carried on `Response` messages.
///
/// The host sees these verbatim; they are part of the wire contract and
/// must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    UnsupportedOperation,
    Malformed,
    ProtocolViolation,
    Busy,
    InvalidArgument,
    NotFound,
    PermissionDenied,
    Timeout,
    ResourceExhausted,
    Unsupported,
    Unavailable,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedOperation => "unsupported_operation",
            ErrorKind::Malformed => "malformed",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::Busy => "busy",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
