//! Error types for the auth gateway.

use thiserror::Error;

/// Result type alias for the auth gateway.
pub type Result<T> = std::result::Result<T, Error>;

/// Auth gateway errors.
///
/// Token-validation failures are deliberately fine-grained so the
/// authentication filter can log them precisely while the cross-service
/// bridge converts them into structured failure results.
#[derive(Error, Debug)]
pub enum Error {
    /// The token could not be parsed (bad structure, bad base64, missing
    /// required claims or header fields).
    #[error("Token malformed: {0}")]
    TokenMalformed(String),

    /// Signature verification failed.
    #[error("Token signature invalid")]
    SignatureInvalid,

    /// The token's expiry is in the past.
    #[error("Token expired")]
    TokenExpired,

    /// Issuer or audience does not match the configured values.
    #[error("Token issuer or audience mismatch")]
    IssuerOrAudienceMismatch,

    /// The signing key could not be resolved (provider unreachable,
    /// fetch rate-limited with no cached key, or unknown key id).
    #[error("Key resolution failed: {0}")]
    KeyResolutionFailed(String),

    /// No identity matches the given lookup.
    #[error("Identity not found: {0}")]
    IdentityNotFound(String),

    /// The operation would violate an identity uniqueness invariant.
    #[error("Identity conflict: {0}")]
    IdentityConflict(String),

    /// The external identity provider returned an error or was unreachable.
    #[error("Upstream provider error: {0}")]
    UpstreamProvider(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<jsonwebtoken::errors::Error> for Error {
    /// Map `jsonwebtoken` failures onto the gateway taxonomy.
    ///
    /// The mapping is shared by both validators; key-resolution failures
    /// never originate here (the key set cache reports those itself).
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::TokenExpired,
            ErrorKind::InvalidSignature => Self::SignatureInvalid,
            ErrorKind::InvalidIssuer | ErrorKind::InvalidAudience => {
                Self::IssuerOrAudienceMismatch
            }
            _ => Self::TokenMalformed(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::UpstreamProvider(err.to_string())
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            Self::TokenMalformed(_)
            | Self::SignatureInvalid
            | Self::TokenExpired
            | Self::IssuerOrAudienceMismatch => StatusCode::UNAUTHORIZED,
            Self::KeyResolutionFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::IdentityNotFound(_) => StatusCode::NOT_FOUND,
            Self::IdentityConflict(_) => StatusCode::CONFLICT,
            Self::UpstreamProvider(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Json(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
