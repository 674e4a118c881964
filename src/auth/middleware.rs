use super::error::AuthError;
use super::handlers::{OAuthAppState, error_response};
use super::token::Claims;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// What the bearer middleware leaves in the request extensions
#[derive(Debug, Clone)]
pub struct AuthenticatedToken {
    pub access_token: String,
    pub claims: Claims,
}

/// Bearer token middleware. The token must verify against our key and still
/// be live in the store, so revoked tokens stop working immediately.
pub async fn bearer_auth_middleware(
    State(state): State<OAuthAppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());

    let Some(token) = token.filter(|t| !t.is_empty()) else {
        tracing::warn!(
            "Missing or invalid Authorization header for {} {}",
            req.method(),
            req.uri()
        );
        return unauthorized_response(&state.base_url, None);
    };

    match state.auth.tokens.authenticate_access_token(&token).await {
        Ok(claims) => {
            tracing::debug!(
                "Valid access token for user {} client {}",
                claims.user_id,
                claims.client_id
            );
            req.extensions_mut().insert(AuthenticatedToken {
                access_token: token,
                claims,
            });
            next.run(req).await
        }
        Err(e @ AuthError::Server(_)) => error_response(&e),
        Err(e) => {
            tracing::warn!("Rejected access token: {}", e);
            unauthorized_response(&state.base_url, Some("invalid_token"))
        }
    }
}

/// 401 with a WWW-Authenticate challenge (RFC 6750)
fn unauthorized_response(base_url: &str, error: Option<&str>) -> Response {
    let challenge = match error {
        Some(err) => format!("Bearer realm=\"{}\", error=\"{}\"", base_url, err),
        None => format!("Bearer realm=\"{}\"", base_url),
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_str(&challenge).unwrap_or_else(|_| HeaderValue::from_static("Bearer")),
    );

    (StatusCode::UNAUTHORIZED, headers).into_response()
}
