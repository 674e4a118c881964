use axum::http::StatusCode;
use thiserror::Error;

/// Where a failed sign-in sends the browser back to
pub const SIGNIN_PATH: &str = "/client/signin";

/// Bad input from the client side of the flow. Always a 400.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client not found")]
    ClientNotFound,

    #[error("redirect uri does not match")]
    RedirectMismatch,

    #[error("{0}")]
    Invalid(String),
}

/// Every core operation fails with exactly one of these four kinds.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Client(#[from] ClientError),

    /// authentication failed, re-prompt at `location`
    #[error("{message}")]
    Redirect { message: String, location: String },

    /// grant or token is absent, expired or revoked
    #[error("{0}")]
    Forbidden(String),

    /// store, codec or rng failure. the detail is for logs only
    #[error("server error: {0:#}")]
    Server(anyhow::Error),
}

impl AuthError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Client(ClientError::Invalid(message.into()))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn server(err: impl Into<anyhow::Error>) -> Self {
        Self::Server(err.into())
    }

    pub fn redirect_to_signin(message: impl Into<String>) -> Self {
        Self::Redirect {
            message: message.into(),
            location: SIGNIN_PATH.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Client(_) => StatusCode::BAD_REQUEST,
            Self::Redirect { .. } => StatusCode::FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// RFC 6749 error code used by the token endpoint
    pub fn oauth_code(&self) -> &'static str {
        match self {
            Self::Client(_) | Self::Redirect { .. } => "invalid_request",
            Self::Forbidden(_) => "invalid_grant",
            Self::Server(_) => "server_error",
        }
    }

    /// Message safe to show an end user. Server errors never leak their cause.
    pub fn public_message(&self) -> String {
        match self {
            Self::Server(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_hides_detail() {
        let err = AuthError::server(anyhow::anyhow!("connection refused to db:5432"));
        assert_eq!(err.public_message(), "internal server error");
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_client_error_is_bad_request() {
        let err = AuthError::from(ClientError::RedirectMismatch);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.public_message(), "redirect uri does not match");
        assert_eq!(err.oauth_code(), "invalid_request");
    }

    #[test]
    fn test_redirect_points_at_signin() {
        match AuthError::redirect_to_signin("nope") {
            AuthError::Redirect { location, .. } => assert_eq!(location, SIGNIN_PATH),
            other => panic!("unexpected {other:?}"),
        }
    }
}
