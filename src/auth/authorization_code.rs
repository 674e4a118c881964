use super::credentials::CredentialVerifier;
use super::error::AuthError;
use super::model::{AuthorizationCode, AuthorizeRequest, Client, LoginRecord, SigninForm};
use super::session::{AUTH_KEY, LOGIN_KEY, SIGNIN_FORM_KEY, Session};
use super::traits::{TokenStore, bounded};
use anyhow::{Context, anyhow};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{Duration as ChronoDuration, Utc};
use rand::TryRngCore;
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// random bytes behind every code and refresh token
const RANDOM_TOKEN_BYTES: usize = 32;

/// 32 bytes from the OS rng, base64url without padding
pub(crate) fn random_token() -> anyhow::Result<String> {
    let mut bytes = [0u8; RANDOM_TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to read random bytes")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

#[derive(Debug, Clone)]
pub struct IssueCodeParams {
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub scope: String,
    pub redirect_uri: String,
    /// may be zero, which makes a code that is dead on arrival
    pub expires_in: i64,
}

/// The browser half of the grant: entry, sign-in, consent, code issuance.
///
/// State between steps lives only in the session:
/// `auth` after entry, `login` after sign-in, nothing after the code is issued.
#[derive(Clone)]
pub struct AuthorizationFlow {
    verifier: CredentialVerifier,
    tokens: Arc<dyn TokenStore + Send + Sync>,
    code_ttl: i64,
    store_timeout: Duration,
}

impl AuthorizationFlow {
    pub fn new(
        verifier: CredentialVerifier,
        tokens: Arc<dyn TokenStore + Send + Sync>,
        code_ttl: i64,
        store_timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            tokens,
            code_ttl,
            store_timeout,
        }
    }

    /// Validate the client and park the request in the session. Nothing is
    /// written when the client or redirect uri is rejected.
    pub async fn entry(&self, session: &Session, req: AuthorizeRequest) -> Result<Client, AuthError> {
        tracing::info!(
            "Authorization request from client_id={}, redirect_uri={}",
            req.client_id,
            req.redirect_uri
        );

        if req.response_type != "code" {
            return Err(AuthError::invalid("response_type must be 'code'"));
        }
        if req.redirect_uri.is_empty() {
            return Err(AuthError::invalid("missing redirect_uri"));
        }
        let client_id = Uuid::parse_str(&req.client_id)
            .map_err(|_| AuthError::invalid("invalid client_id"))?;

        let client = self
            .verifier
            .authenticate_client(client_id, &req.redirect_uri)
            .await?;

        bounded(
            self.store_timeout,
            "store pending authorization",
            session.set_named(AUTH_KEY, &req),
        )
        .await?;

        Ok(client)
    }

    /// The request parked by `entry`. Absent means the flow was entered out of order.
    pub async fn pending_authorization(&self, session: &Session) -> Result<AuthorizeRequest, AuthError> {
        let pending: Option<AuthorizeRequest> = bounded(
            self.store_timeout,
            "read pending authorization",
            session.get_named(AUTH_KEY),
        )
        .await?;

        match pending {
            Some(p) if !p.client_id.is_empty() => Ok(p),
            _ => Err(AuthError::invalid("invalid client_id")),
        }
    }

    /// Sign the user in against the pending authorization and swap `auth` for `login`.
    pub async fn authenticate(
        &self,
        session: &Session,
        email: &str,
        password: &str,
    ) -> Result<LoginRecord, AuthError> {
        let pending = self.pending_authorization(session).await?;

        let result = if email.is_empty() || password.is_empty() {
            Err(AuthError::redirect_to_signin("email and password are required"))
        } else {
            self.verifier.authenticate_user(email, password).await
        };

        let user = match result {
            Ok(user) => user,
            Err(e @ AuthError::Redirect { .. }) => {
                // keep the email so the form comes back filled in
                bounded(
                    self.store_timeout,
                    "store sign-in form",
                    session.set_named(
                        SIGNIN_FORM_KEY,
                        &SigninForm {
                            email: email.to_string(),
                        },
                    ),
                )
                .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        bounded(self.store_timeout, "clear pending authorization", session.delete(AUTH_KEY)).await?;
        bounded(self.store_timeout, "clear sign-in form", session.delete(SIGNIN_FORM_KEY)).await?;

        let login = LoginRecord {
            email: email.to_string(),
            user_id: user.id.to_string(),
            client_id: pending.client_id,
            redirect_uri: pending.redirect_uri,
            scope: pending.scope,
            state: pending.state,
            code_expires: self.code_ttl,
        };
        bounded(
            self.store_timeout,
            "store login",
            session.set_named(LOGIN_KEY, &login),
        )
        .await?;

        tracing::info!("user {} signed in for client {}", user.id, login.client_id);
        Ok(login)
    }

    async fn login(&self, session: &Session) -> Result<LoginRecord, AuthError> {
        let login: Option<LoginRecord> =
            bounded(self.store_timeout, "read login", session.get_named(LOGIN_KEY)).await?;

        match login {
            Some(l) if !l.client_id.is_empty() => Ok(l),
            _ => Err(AuthError::invalid("not signed in")),
        }
    }

    /// The signed-in user and the client asking for consent. No state change.
    pub async fn consent(&self, session: &Session) -> Result<(LoginRecord, Client), AuthError> {
        let login = self.login(session).await?;
        let client_id = Uuid::parse_str(&login.client_id)
            .map_err(|_| AuthError::invalid("invalid client_id"))?;
        let client = self.verifier.find_client(client_id).await?;
        Ok((login, client))
    }

    /// Handle the consent submission and return where to send the browser.
    ///
    /// Approval issues a code and yields `{redirect_uri}?code=..`; denial
    /// yields `{redirect_uri}?error=access_denied`. Either way the login
    /// record is consumed.
    pub async fn approve(&self, session: &Session, agree: bool) -> Result<String, AuthError> {
        let login = self.login(session).await?;

        if !agree {
            bounded(self.store_timeout, "clear login", session.delete(LOGIN_KEY)).await?;
            tracing::info!("user {} denied client {}", login.user_id, login.client_id);
            return append_query(
                &login.redirect_uri,
                &[
                    ("error", "access_denied"),
                    ("error_description", "User denied the authorization request"),
                    ("state", login.state.as_str()),
                ],
            );
        }

        let params = IssueCodeParams {
            user_id: Uuid::parse_str(&login.user_id)
                .map_err(|e| AuthError::server(anyhow!("corrupt login record: {e}")))?,
            client_id: Uuid::parse_str(&login.client_id)
                .map_err(|_| AuthError::invalid("invalid client_id"))?,
            scope: login.scope.clone(),
            redirect_uri: login.redirect_uri.clone(),
            expires_in: login.code_expires,
        };
        let code = self.issue_authorization_code(params).await?;

        bounded(self.store_timeout, "clear login", session.delete(LOGIN_KEY)).await?;

        tracing::info!(
            "Authorization approved for client_id={}, redirecting to {}",
            code.client_id,
            code.redirect_uri
        );
        append_query(
            &code.redirect_uri,
            &[("code", code.code.as_str()), ("state", login.state.as_str())],
        )
    }

    /// Mint a code, store it, and hand back the stored row as the store sees it.
    pub async fn issue_authorization_code(
        &self,
        params: IssueCodeParams,
    ) -> Result<AuthorizationCode, AuthError> {
        let value = random_token().map_err(AuthError::server)?;
        let now = Utc::now();
        let expires_at = ChronoDuration::try_seconds(params.expires_in)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| {
                AuthError::server(anyhow!(
                    "authorization code lifetime of {}s is out of range",
                    params.expires_in
                ))
            })?;

        let code = AuthorizationCode {
            code: value,
            client_id: params.client_id,
            user_id: params.user_id,
            scope: params.scope,
            redirect_uri: params.redirect_uri,
            expires_at,
            revoked_at: None,
            created_at: now,
            updated_at: now,
        };

        let key = bounded(
            self.store_timeout,
            "store authorization code",
            self.tokens.store_authorization_code(&code),
        )
        .await?;

        bounded(
            self.store_timeout,
            "re-read authorization code",
            self.tokens.find_authorization_code(&key),
        )
        .await?
        .ok_or_else(|| AuthError::server(anyhow!("authorization code vanished right after it was stored")))
    }
}

/// append non-empty query pairs to a registered redirect uri
fn append_query(redirect_uri: &str, pairs: &[(&str, &str)]) -> Result<String, AuthError> {
    let mut url = Url::parse(redirect_uri)
        .map_err(|e| AuthError::server(anyhow!("registered redirect uri is not a url: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in pairs.iter().filter(|(_, v)| !v.is_empty()) {
            query.append_pair(key, value);
        }
    }
    Ok(url.into())
}
