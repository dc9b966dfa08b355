// Error taxonomy for the gateway.
//
// Every per-action failure is converted into a scoped `error` event for the
// requesting connection; nothing here tears a connection down.

use parlor_common::protocol::ws::ServerEvent;

use crate::stores::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthFailed,
    Forbidden,
    NotFound,
    ValidationFailed,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::Forbidden => "AUTH_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::AuthFailed => "authentication failed",
            Self::Forbidden => "caller lacks required permission",
            Self::NotFound => "requested resource not found",
            Self::ValidationFailed => "request validation failed",
            Self::InternalError => "internal server error",
        }
    }
}

/// A failure scoped to a single inbound action.
#[derive(Debug, Clone)]
pub struct GatewayError {
    code: ErrorCode,
    message: String,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The `error` event sent to the requesting connection.
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::Error {
            code: self.code.as_str().to_string(),
            message: self.message.clone(),
            retryable: self.code.retryable(),
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for GatewayError {}

impl From<StoreError> for GatewayError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => Self::from_code(ErrorCode::NotFound),
            // Backend details stay in the logs; the client sees a generic
            // failure.
            StoreError::Backend(_) => Self::from_code(ErrorCode::InternalError),
        }
    }
}
