use super::AuthService;
use super::authorization_code::random_token;
use super::error::{AuthError, SIGNIN_PATH};
use super::middleware::{AuthenticatedToken, bearer_auth_middleware};
use super::model::{AuthorizeRequest, SigninForm, TokenPair};
use super::session::{FLASH_KEY, LOGIN_KEY, SIGNIN_FORM_KEY, Session};
use super::traits::bounded;
use axum::{
    Extension, Form, Router,
    extract::{Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "sessionID";
const CONSENT_PATH: &str = "/oauth2/consent";

/// Combined OAuth state for all handlers
#[derive(Clone)]
pub struct OAuthAppState {
    pub auth: Arc<AuthService>,
    pub base_url: String,
}

impl OAuthAppState {
    pub fn new(auth: AuthService, base_url: impl Into<String>) -> Self {
        Self {
            auth: Arc::new(auth),
            base_url: base_url.into(),
        }
    }
}

/// Browser-facing pages and metadata. No bearer token involved.
pub fn browser_routes(state: OAuthAppState) -> Router {
    Router::new()
        .route("/client/sign-entry", get(sign_entry_handler))
        .route(
            SIGNIN_PATH,
            get(signin_page_handler).post(signin_submit_handler),
        )
        .route(
            CONSENT_PATH,
            get(consent_page_handler).post(consent_submit_handler),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get(metadata_handler),
        )
        .with_state(state)
}

/// The token endpoint
pub fn api_routes(state: OAuthAppState) -> Router {
    Router::new()
        .route("/oauth2/token", post(token_handler))
        .with_state(state)
}

/// Routes that need a live access token
pub fn protected_routes(state: OAuthAppState) -> Router {
    Router::new()
        .route("/oauth2/revoke", post(revoke_handler))
        .route("/me", get(me_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_middleware,
        ))
        .with_state(state)
}

// ---- browser session plumbing ----

struct BrowserSession {
    session: Session,
    cookie: String,
}

impl BrowserSession {
    /// Reuse the `sessionID` cookie if it looks like one of ours, otherwise start fresh.
    fn open(state: &OAuthAppState, headers: &HeaderMap) -> Result<Self, AuthError> {
        let id = match cookie_value(headers, SESSION_COOKIE).filter(|id| valid_session_id(id)) {
            Some(id) => id.to_string(),
            None => random_token().map_err(AuthError::server)?,
        };

        Ok(Self {
            cookie: session_cookie_header(state, &id),
            session: state.auth.session(id),
        })
    }

    /// Move the signed-in state under a fresh id so a session id planted
    /// before sign-in is worthless afterwards.
    async fn rotate(&mut self, state: &OAuthAppState) -> Result<(), AuthError> {
        let id = random_token().map_err(AuthError::server)?;
        let next = bounded(
            state.auth.store_timeout(),
            "rotate session id",
            self.session.move_to(id.clone(), &[LOGIN_KEY, FLASH_KEY]),
        )
        .await?;

        self.cookie = session_cookie_header(state, &id);
        self.session = next;
        Ok(())
    }

    /// attach the (refreshed) session cookie
    fn respond(&self, resp: impl IntoResponse) -> Response {
        let mut resp = resp.into_response();
        if let Ok(value) = HeaderValue::from_str(&self.cookie) {
            resp.headers_mut().append(header::SET_COOKIE, value);
        }
        resp
    }
}

fn session_cookie_header(state: &OAuthAppState, id: &str) -> String {
    let secure = if state.base_url.starts_with("https://") {
        "; Secure"
    } else {
        ""
    };
    format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}{}",
        SESSION_COOKIE,
        id,
        state.auth.session_ttl().as_secs(),
        secure
    )
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

fn valid_session_id(id: &str) -> bool {
    (16..=128).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// plain 302, which is what the browser flow expects
fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => {
            tracing::error!("refusing to redirect to unprintable location");
            error_page(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

/// How a core error reaches the browser. Redirect errors come back as a flash
/// message on the page they point at.
async fn browser_error(state: &OAuthAppState, session: &Session, err: AuthError) -> Response {
    match err {
        AuthError::Redirect { message, location } => {
            if let Err(e) = bounded(
                state.auth.store_timeout(),
                "store flash message",
                session.add_flash(message),
            )
            .await
            {
                tracing::error!("{}", e);
            }
            found(&location)
        }
        AuthError::Server(e) => {
            tracing::error!("browser flow failed: {:#}", e);
            error_page(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
        other => {
            tracing::warn!("browser flow rejected: {}", other);
            error_page(other.status(), &other.public_message())
        }
    }
}

// ---- browser handlers ----

/// GET /client/sign-entry - start of the grant, parks the request in the session
pub async fn sign_entry_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    Query(req): Query<AuthorizeRequest>,
) -> Response {
    let browser = match BrowserSession::open(&state, &headers) {
        Ok(b) => b,
        Err(e) => return browser_error_without_session(e),
    };

    match state.auth.flow.entry(&browser.session, req).await {
        Ok(client) => {
            tracing::debug!("pending authorization stored for client {}", client.id);
            browser.respond(found(SIGNIN_PATH))
        }
        Err(e) => browser.respond(browser_error(&state, &browser.session, e).await),
    }
}

/// GET /client/signin
pub async fn signin_page_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
) -> Response {
    let browser = match BrowserSession::open(&state, &headers) {
        Ok(b) => b,
        Err(e) => return browser_error_without_session(e),
    };
    let session = &browser.session;

    let pending = match state.auth.flow.pending_authorization(session).await {
        Ok(p) => p,
        Err(e) => return browser.respond(browser_error(&state, session, e).await),
    };

    let timeout = state.auth.store_timeout();
    let form: Option<SigninForm> = match bounded(
        timeout,
        "read sign-in form",
        session.flush_named(SIGNIN_FORM_KEY),
    )
    .await
    {
        Ok(f) => f,
        Err(e) => return browser.respond(browser_error(&state, session, e).await),
    };
    let flash = match bounded(timeout, "read flash messages", session.take_flash()).await {
        Ok(f) => f,
        Err(e) => return browser.respond(browser_error(&state, session, e).await),
    };

    let email = form.map(|f| f.email).unwrap_or_default();
    browser.respond(html_page(
        "Sign in",
        &signin_body(&pending.client_id, &email, &flash),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct SigninRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// POST /client/signin
pub async fn signin_submit_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    Form(req): Form<SigninRequest>,
) -> Response {
    let mut browser = match BrowserSession::open(&state, &headers) {
        Ok(b) => b,
        Err(e) => return browser_error_without_session(e),
    };

    match state
        .auth
        .flow
        .authenticate(&browser.session, req.email.trim(), &req.password)
        .await
    {
        Ok(_) => match browser.rotate(&state).await {
            Ok(()) => browser.respond(found(CONSENT_PATH)),
            Err(e) => browser.respond(browser_error(&state, &browser.session, e).await),
        },
        Err(e) => browser.respond(browser_error(&state, &browser.session, e).await),
    }
}

/// GET /oauth2/consent
pub async fn consent_page_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
) -> Response {
    let browser = match BrowserSession::open(&state, &headers) {
        Ok(b) => b,
        Err(e) => return browser_error_without_session(e),
    };

    match state.auth.flow.consent(&browser.session).await {
        Ok((login, client)) => browser.respond(html_page(
            "Authorize Application",
            &consent_body(&client.name, &login.email, &login.scope),
        )),
        Err(e) => browser.respond(browser_error(&state, &browser.session, e).await),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConsentRequest {
    pub agree: Option<String>,
}

/// POST /oauth2/consent - anything but an explicit yes is a denial
pub async fn consent_submit_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    Form(req): Form<ConsentRequest>,
) -> Response {
    let browser = match BrowserSession::open(&state, &headers) {
        Ok(b) => b,
        Err(e) => return browser_error_without_session(e),
    };
    let agree = matches!(req.agree.as_deref(), Some("true" | "on" | "1" | "yes"));

    match state.auth.flow.approve(&browser.session, agree).await {
        Ok(location) => browser.respond(found(&location)),
        Err(e) => browser.respond(browser_error(&state, &browser.session, e).await),
    }
}

fn browser_error_without_session(err: AuthError) -> Response {
    tracing::error!("could not open browser session: {}", err);
    error_page(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
}

// ---- token endpoint ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub grant_type: GrantType,
    /// required for authorization_code
    pub code: Option<String>,
    /// required for refresh_token
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// access token expiry, unix seconds
    pub expiry: i64,
}

impl From<TokenPair> for TokenResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            expiry: pair.token.expiry(),
            access_token: pair.token.access_token,
            refresh_token: pair.refresh_token.refresh_token,
            token_type: "Bearer".to_string(),
        }
    }
}

/// OAuth 2.0 error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
}

/// POST /oauth2/token
pub async fn token_handler(
    State(state): State<OAuthAppState>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            tracing::warn!("Malformed token request: {}", rejection.body_text());
            return error_response(&AuthError::invalid(rejection.body_text()));
        }
    };

    tracing::info!("Token request: grant_type={:?}", req.grant_type);

    let tokens = &state.auth.tokens;
    let result = match req.grant_type {
        GrantType::AuthorizationCode => match non_empty(req.code.as_deref()) {
            Some(code) => tokens.generate_token_by_code(code).await,
            None => Err(AuthError::invalid("Missing required parameter: code")),
        },
        GrantType::RefreshToken => match non_empty(req.refresh_token.as_deref()) {
            Some(rt) => tokens.generate_token_by_refresh_token(rt).await,
            None => Err(AuthError::invalid(
                "Missing required parameter: refresh_token",
            )),
        },
    };

    match result {
        Ok(pair) => {
            let headers = [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))];
            (StatusCode::OK, headers, Json(TokenResponse::from(pair))).into_response()
        }
        Err(e) => error_response(&e),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// POST /oauth2/revoke - logs out the bearer token used to call it
pub async fn revoke_handler(
    State(state): State<OAuthAppState>,
    Extension(token): Extension<AuthenticatedToken>,
) -> Response {
    match state.auth.tokens.revoke_access_token(&token.access_token).await {
        Ok(()) => {
            tracing::info!(
                "Revoked access token for user {} client {}",
                token.claims.user_id,
                token.claims.client_id
            );
            StatusCode::OK.into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MeResponse {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

/// GET /me - the user behind the bearer token
pub async fn me_handler(
    State(state): State<OAuthAppState>,
    Extension(token): Extension<AuthenticatedToken>,
) -> Response {
    match state.auth.credentials.find_user(token.claims.user_id).await {
        Ok(user) => Json(MeResponse {
            id: user.id,
            name: user.name,
            email: user.email,
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}

/// JSON error body for the API routes
pub(crate) fn error_response(err: &AuthError) -> Response {
    if let AuthError::Server(e) = err {
        tracing::error!("request failed: {:#}", e);
    }

    let status = match err {
        // there is no page to bounce an API caller to
        AuthError::Redirect { .. } => StatusCode::BAD_REQUEST,
        other => other.status(),
    };
    let body = ErrorResponse {
        error: err.oauth_code().to_string(),
        error_description: Some(err.public_message()),
    };
    (status, Json(body)).into_response()
}

// ---- metadata ----

/// Auth server metadata (RFC 8414)
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub revocation_endpoint: String,
    pub grant_types_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub response_types_supported: Vec<String>,
}

/// Tells clients where the endpoints are
pub async fn metadata_handler(State(state): State<OAuthAppState>) -> Response {
    let base_url = &state.base_url;
    let metadata = AuthorizationServerMetadata {
        issuer: base_url.clone(),
        authorization_endpoint: format!("{}/client/sign-entry", base_url),
        token_endpoint: format!("{}/oauth2/token", base_url),
        revocation_endpoint: format!("{}/oauth2/revoke", base_url),
        grant_types_supported: vec![
            "authorization_code".to_string(),
            "refresh_token".to_string(),
        ],
        token_endpoint_auth_methods_supported: vec!["none".to_string()],
        response_types_supported: vec!["code".to_string()],
    };

    tracing::debug!("Serving authorization server metadata");
    (StatusCode::OK, Json(metadata)).into_response()
}

// ---- html ----

fn html_page(title: &str, body: &str) -> Response {
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>{}</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            max-width: 400px;
            margin: 100px auto;
            padding: 20px;
            text-align: center;
        }}
        h1 {{ color: #333; }}
        .client {{
            background: #f5f5f5;
            padding: 10px;
            border-radius: 4px;
            word-break: break-all;
        }}
        .flash {{ color: #b00020; }}
        input {{
            display: block;
            width: 100%;
            box-sizing: border-box;
            padding: 10px;
            margin: 8px 0;
        }}
        button {{
            padding: 12px 24px;
            margin: 5px;
            border: none;
            border-radius: 4px;
            cursor: pointer;
            font-size: 16px;
            color: white;
        }}
        .approve {{ background: #0066cc; }}
        .deny {{ background: #666; }}
    </style>
</head>
<body>
{}
</body>
</html>"#,
        html_escape(title),
        body
    );

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'; style-src 'unsafe-inline'"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));

    (headers, Html(html)).into_response()
}

fn error_page(status: StatusCode, message: &str) -> Response {
    let mut resp = html_page(
        "Error",
        &format!(
            "    <h1>Something went wrong</h1>\n    <p>{}</p>",
            html_escape(message)
        ),
    );
    *resp.status_mut() = status;
    resp
}

fn signin_body(client_id: &str, email: &str, flash: &[String]) -> String {
    let messages: String = flash
        .iter()
        .map(|m| format!("    <p class=\"flash\">{}</p>\n", html_escape(m)))
        .collect();

    format!(
        r#"    <h1>Sign in</h1>
    <p>Sign in to continue to</p>
    <div class="client">{}</div>
{}    <form method="post" action="{}">
        <input type="email" name="email" placeholder="Email" value="{}" required>
        <input type="password" name="password" placeholder="Password" required>
        <button class="approve" type="submit">Sign in</button>
    </form>"#,
        html_escape(client_id),
        messages,
        SIGNIN_PATH,
        html_escape(email)
    )
}

fn consent_body(client_name: &str, email: &str, scope: &str) -> String {
    let scope = if scope.is_empty() { "(none)" } else { scope };
    format!(
        r#"    <h1>Authorize Application</h1>
    <p>Signed in as {}</p>
    <p>The following application is requesting access to your account:</p>
    <div class="client">{}</div>
    <p>Scope: {}</p>
    <form method="post" action="{}">
        <button class="approve" type="submit" name="agree" value="true">Approve</button>
        <button class="deny" type="submit" name="agree" value="false">Deny</button>
    </form>"#,
        html_escape(email),
        html_escape(client_name),
        html_escape(scope),
        CONSENT_PATH
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
