mod authorization_code;
mod credentials;
mod error;
mod handlers;
mod lifecycle;
mod memory;
mod middleware;
mod model;
mod session;
mod token;
mod traits;

pub use authorization_code::AuthorizationFlow;
pub use credentials::CredentialVerifier;
pub use handlers::{OAuthAppState, api_routes, browser_routes, protected_routes};
pub use lifecycle::TokenService;
pub use memory::{MemorySessionStore, MemoryStore};
pub use model::{Client, User};
pub use session::Session;
pub use token::{SigningKey, VerifyingKey};
pub use traits::{CredentialStore, SessionStore, TokenStore};

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the authentication system
#[derive(Clone)]
pub struct AuthConfig {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
    /// authorization code ttl, seconds
    pub auth_code_expires: i64,
    pub access_token_ttl: ChronoDuration,
    pub refresh_token_ttl: ChronoDuration,
    pub session_expires: Duration,
    /// deadline for every single store or session call
    pub store_timeout: Duration,
}

/// Everything the handlers need: the browser flow, the token service and a
/// way to open sessions.
#[derive(Clone)]
pub struct AuthService {
    pub credentials: CredentialVerifier,
    pub flow: AuthorizationFlow,
    pub tokens: TokenService,
    sessions: Arc<dyn SessionStore + Send + Sync>,
    session_ttl: Duration,
    store_timeout: Duration,
}

impl AuthService {
    pub fn new(
        config: AuthConfig,
        credentials: Arc<dyn CredentialStore + Send + Sync>,
        tokens: Arc<dyn TokenStore + Send + Sync>,
        sessions: Arc<dyn SessionStore + Send + Sync>,
    ) -> Self {
        let verifier = CredentialVerifier::new(credentials, config.store_timeout);
        let flow = AuthorizationFlow::new(
            verifier.clone(),
            tokens.clone(),
            config.auth_code_expires,
            config.store_timeout,
        );
        let tokens = TokenService::new(
            tokens,
            config.signing_key,
            config.verifying_key,
            config.access_token_ttl,
            config.refresh_token_ttl,
            config.store_timeout,
        );

        Self {
            credentials: verifier,
            flow,
            tokens,
            sessions,
            session_ttl: config.session_expires,
            store_timeout: config.store_timeout,
        }
    }

    /// Convenience for the common single-process setup
    pub fn in_memory(config: AuthConfig, store: MemoryStore, sessions: MemorySessionStore) -> Self {
        let store = Arc::new(store);
        Self::new(config, store.clone(), store, Arc::new(sessions))
    }

    pub fn session(&self, id: String) -> Session {
        Session::new(id, self.sessions.clone(), self.session_ttl)
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }
}


#[cfg(test)]
mod tests {
    use super::model::AuthorizeRequest;
    use super::testing::*;
    use super::*;
    use url::Url;

    #[tokio::test]
    async fn test_full_grant_then_refresh() {
        let h = harness().await;
        let session = h.auth.session("browser-1".to_string());

        h.auth
            .flow
            .entry(
                &session,
                AuthorizeRequest {
                    response_type: "code".to_string(),
                    client_id: h.client.id.to_string(),
                    scope: "read".to_string(),
                    redirect_uri: REDIRECT_URI.to_string(),
                    state: String::new(),
                },
            )
            .await
            .unwrap();
        h.auth
            .flow
            .authenticate(&session, EMAIL, PASSWORD)
            .await
            .unwrap();
        let location = h.auth.flow.approve(&session, true).await.unwrap();

        let code = Url::parse(&location)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let first = h.auth.tokens.generate_token_by_code(&code).await.unwrap();
        assert_eq!(first.token.user_id, h.user.id);
        assert_eq!(first.token.client_id, h.client.id);
        assert_eq!(first.token.scope, "read");

        let second = h
            .auth
            .tokens
            .generate_token_by_refresh_token(&first.refresh_token.refresh_token)
            .await
            .unwrap();
        assert_eq!(second.token.user_id, h.user.id);

        let old = h
            .store
            .find_token(&first.token.access_token)
            .await
            .unwrap()
            .unwrap();
        assert!(old.revoked_at.is_some());

        let claims = h
            .auth
            .tokens
            .authenticate_access_token(&second.token.access_token)
            .await
            .unwrap();
        assert_eq!(claims.user_id, h.user.id);
    }
}
