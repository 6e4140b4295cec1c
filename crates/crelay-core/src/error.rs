use bytes::Bytes;
use http::StatusCode;

/// Client-visible failure classes. The kind string is the wire-level
/// `error` field, so variants rename only with the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthMissing,
    AuthInvalid,
    KeyDisabled,
    KeyExpired,
    QuotaExceeded,
    NoAccountAvailable,
    UpstreamUnauthorized,
    UpstreamRateLimited,
    UpstreamError,
    BadRequest,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthMissing => "AuthMissing",
            ErrorKind::AuthInvalid => "AuthInvalid",
            ErrorKind::KeyDisabled => "KeyDisabled",
            ErrorKind::KeyExpired => "KeyExpired",
            ErrorKind::QuotaExceeded => "QuotaExceeded",
            ErrorKind::NoAccountAvailable => "NoAccountAvailable",
            ErrorKind::UpstreamUnauthorized => "UpstreamUnauthorized",
            ErrorKind::UpstreamRateLimited => "UpstreamRateLimited",
            ErrorKind::UpstreamError => "UpstreamError",
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::Internal => "Internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::AuthMissing | ErrorKind::AuthInvalid => StatusCode::UNAUTHORIZED,
            ErrorKind::KeyDisabled | ErrorKind::KeyExpired => StatusCode::FORBIDDEN,
            ErrorKind::QuotaExceeded | ErrorKind::UpstreamRateLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ErrorKind::NoAccountAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::UpstreamUnauthorized | ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    pub kind: ErrorKind,
    pub message: String,
    /// Seconds for the `retry-after` header, where the kind carries one.
    pub retry_after: Option<u64>,
}

impl RelayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }

    pub fn body(&self) -> Bytes {
        let payload = serde_json::json!({
            "error": self.kind.as_str(),
            "message": self.message,
        });
        Bytes::from(payload.to_string())
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_spec_statuses() {
        assert_eq!(ErrorKind::AuthInvalid.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::KeyExpired.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorKind::QuotaExceeded.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ErrorKind::NoAccountAvailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ErrorKind::UpstreamError.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn body_carries_kind_string() {
        let err = RelayError::new(ErrorKind::AuthInvalid, "unknown key");
        let body = String::from_utf8(err.body().to_vec()).unwrap();
        assert!(body.contains("\"error\":\"AuthInvalid\""));
    }
}
