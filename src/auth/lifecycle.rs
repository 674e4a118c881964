use super::authorization_code::random_token;
use super::error::AuthError;
use super::model::{RefreshToken, Token, TokenPair};
use super::token::{self, Claims, SigningKey, TokenParams, VerifyingKey};
use super::traits::{TokenStore, bounded};
use anyhow::anyhow;
use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Turns a code or refresh token into a fresh access/refresh pair and retires
/// whatever was consumed.
///
/// New rows are always written before old ones are revoked. A crash in between
/// leaves the grant reusable rather than leaving the user with nothing; the
/// single-winner revoke keeps concurrent exchanges from both succeeding.
#[derive(Clone)]
pub struct TokenService {
    tokens: Arc<dyn TokenStore + Send + Sync>,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    access_ttl: ChronoDuration,
    refresh_ttl: ChronoDuration,
    store_timeout: Duration,
}

impl TokenService {
    pub fn new(
        tokens: Arc<dyn TokenStore + Send + Sync>,
        signing_key: SigningKey,
        verifying_key: VerifyingKey,
        access_ttl: ChronoDuration,
        refresh_ttl: ChronoDuration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            tokens,
            signing_key,
            verifying_key,
            access_ttl,
            refresh_ttl,
            store_timeout,
        }
    }

    pub async fn generate_token_by_code(&self, code: &str) -> Result<TokenPair, AuthError> {
        let found = bounded(
            self.store_timeout,
            "find authorization code",
            self.tokens.find_valid_authorization_code(code, Utc::now()),
        )
        .await?;

        let Some(auth_code) = found else {
            tracing::warn!("rejected unknown, used or expired authorization code");
            return Err(AuthError::forbidden("authorization code is invalid or expired"));
        };

        // the lookup already filtered on expiry, but the clock kept moving since
        if auth_code.is_expired(Utc::now()) {
            return Err(AuthError::forbidden("code has expired"));
        }

        let pair = self
            .issue_pair(auth_code.client_id, auth_code.user_id, &auth_code.scope)
            .await?;

        let won = bounded(
            self.store_timeout,
            "revoke authorization code",
            self.tokens.revoke_authorization_code(code),
        )
        .await?;
        if !won {
            tracing::warn!(
                "authorization code for client {} was exchanged concurrently, discarding new pair",
                auth_code.client_id
            );
            self.discard(&pair).await;
            return Err(AuthError::forbidden("authorization code has already been used"));
        }

        tracing::info!(
            "Issued tokens via authorization_code for client {} user {}",
            auth_code.client_id,
            auth_code.user_id
        );
        Ok(pair)
    }

    pub async fn generate_token_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenPair, AuthError> {
        let found = bounded(
            self.store_timeout,
            "find refresh token",
            self.tokens.find_valid_refresh_token(refresh_token, Utc::now()),
        )
        .await?;
        let Some(old_refresh) = found else {
            tracing::warn!("rejected unknown, revoked or expired refresh token");
            return Err(AuthError::forbidden("refresh token is invalid or expired"));
        };

        let old_token = bounded(
            self.store_timeout,
            "find access token",
            self.tokens.find_token(&old_refresh.access_token),
        )
        .await?
        .ok_or_else(|| {
            tracing::warn!("refresh token points at a missing access token");
            AuthError::forbidden("access token for refresh token not found")
        })?;

        let pair = self
            .issue_pair(old_token.client_id, old_token.user_id, &old_token.scope)
            .await?;

        // the refresh token revoke is the single-winner gate for rotation
        let won = bounded(
            self.store_timeout,
            "revoke refresh token",
            self.tokens.revoke_refresh_token(&old_refresh.refresh_token),
        )
        .await?;
        if !won {
            tracing::warn!(
                "refresh token for client {} was rotated concurrently, discarding new pair",
                old_token.client_id
            );
            self.discard(&pair).await;
            return Err(AuthError::forbidden("refresh token has already been used"));
        }

        // the rotation is already won, so a failure here must not cost the caller the new pair.
        // the old access token still dies at its own expiry
        if let Err(e) = bounded(
            self.store_timeout,
            "revoke rotated access token",
            self.tokens.revoke_token(&old_token.access_token),
        )
        .await
        {
            tracing::error!("{}", e);
        }

        tracing::info!(
            "Rotated tokens via refresh_token for client {} user {}",
            old_token.client_id,
            old_token.user_id
        );
        Ok(pair)
    }

    /// Logout. Unknown and already-revoked tokens are not an error here.
    pub async fn revoke_access_token(&self, access_token: &str) -> Result<(), AuthError> {
        let revoked = bounded(
            self.store_timeout,
            "revoke access token",
            self.tokens.revoke_token(access_token),
        )
        .await?;
        tracing::debug!("access token revoke requested (changed: {})", revoked);
        Ok(())
    }

    /// Accept a bearer token only if its signature verifies, it has not
    /// expired, and the store still holds it unrevoked with matching claims.
    pub async fn authenticate_access_token(&self, access_token: &str) -> Result<Claims, AuthError> {
        let claims = token::parse(access_token, &self.verifying_key).map_err(|e| {
            tracing::warn!("Invalid access token: {}", e);
            AuthError::forbidden("invalid access token")
        })?;

        let now = Utc::now();
        if claims.is_expired(now) {
            return Err(AuthError::forbidden("access token has expired"));
        }

        let stored = bounded(
            self.store_timeout,
            "find access token",
            self.tokens.find_token(access_token),
        )
        .await?
        .ok_or_else(|| AuthError::forbidden("access token not found"))?;

        if !stored.is_active(now) {
            return Err(AuthError::forbidden("access token has been revoked"));
        }
        if stored.user_id != claims.user_id
            || stored.client_id != claims.client_id
            || stored.expiry() != claims.exp
        {
            tracing::error!("stored access token disagrees with its own claims");
            return Err(AuthError::forbidden("invalid access token"));
        }

        Ok(claims)
    }

    async fn issue_pair(
        &self,
        client_id: Uuid,
        user_id: Uuid,
        scope: &str,
    ) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        // whole seconds, so the row and the exp claim agree exactly
        let expires_at = expiry_after(now, self.access_ttl)?.trunc_subsecs(0);
        let refresh_expires_at = expiry_after(now, self.refresh_ttl)?;

        let access_token = token::generate(
            &TokenParams {
                user_id,
                client_id,
                scope: scope.to_string(),
                expires_at,
            },
            &self.signing_key,
        )
        .map_err(AuthError::server)?;

        let token = Token {
            access_token,
            client_id,
            user_id,
            scope: scope.to_string(),
            expires_at,
            revoked_at: None,
        };
        bounded(
            self.store_timeout,
            "store access token",
            self.tokens.store_token(&token),
        )
        .await?;

        let refresh_token = RefreshToken {
            refresh_token: random_token().map_err(AuthError::server)?,
            access_token: token.access_token.clone(),
            expires_at: refresh_expires_at,
            revoked_at: None,
        };
        bounded(
            self.store_timeout,
            "store refresh token",
            self.tokens.store_refresh_token(&refresh_token),
        )
        .await?;

        Ok(TokenPair {
            token,
            refresh_token,
        })
    }

    /// best effort, a pair that lost the race must never be usable
    async fn discard(&self, pair: &TokenPair) {
        if let Err(e) = bounded(
            self.store_timeout,
            "revoke losing refresh token",
            self.tokens.revoke_refresh_token(&pair.refresh_token.refresh_token),
        )
        .await
        {
            tracing::error!("{}", e);
        }
        if let Err(e) = bounded(
            self.store_timeout,
            "revoke losing access token",
            self.tokens.revoke_token(&pair.token.access_token),
        )
        .await
        {
            tracing::error!("{}", e);
        }
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: ChronoDuration) -> Result<DateTime<Utc>, AuthError> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| AuthError::server(anyhow!("token lifetime {ttl} overflows the calendar")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::memory::MemoryStore;
    use crate::auth::model::AuthorizationCode;
    use crate::auth::token::test_keys;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn service(store: Arc<dyn TokenStore + Send + Sync>) -> TokenService {
        let (signing, verifying) = test_keys();
        TokenService::new(
            store,
            signing,
            verifying,
            ChronoDuration::minutes(60),
            ChronoDuration::days(30),
            Duration::from_secs(1),
        )
    }

    async fn seed_code(store: &MemoryStore, expires_in: i64) -> AuthorizationCode {
        seed_code_for(store, Uuid::new_v4(), Uuid::new_v4(), expires_in).await
    }

    async fn seed_code_for(
        store: &MemoryStore,
        client_id: Uuid,
        user_id: Uuid,
        expires_in: i64,
    ) -> AuthorizationCode {
        let now = Utc::now();
        let code = AuthorizationCode {
            code: random_token().unwrap(),
            client_id,
            user_id,
            scope: "read".to_string(),
            redirect_uri: "https://app/cb".to_string(),
            expires_at: now + ChronoDuration::seconds(expires_in),
            revoked_at: None,
            created_at: now,
            updated_at: now,
        };
        store.store_authorization_code(&code).await.unwrap();
        code
    }

    #[tokio::test]
    async fn test_code_exchange_issues_consistent_pair() {
        let store = MemoryStore::new();
        let svc = service(Arc::new(store.clone()));
        let code = seed_code(&store, 120).await;

        let pair = svc.generate_token_by_code(&code.code).await.unwrap();

        assert_eq!(pair.token.client_id, code.client_id);
        assert_eq!(pair.token.user_id, code.user_id);
        assert_eq!(pair.token.scope, "read");
        assert_eq!(pair.refresh_token.access_token, pair.token.access_token);
        assert!(pair.refresh_token.expires_at > Utc::now() + ChronoDuration::days(29));

        let claims = token::parse(&pair.token.access_token, &svc.verifying_key).unwrap();
        assert_eq!(claims.exp, pair.token.expiry());
        assert_eq!(claims.user_id, code.user_id);

        let stored = store.find_token(&pair.token.access_token).await.unwrap().unwrap();
        assert_eq!(stored, pair.token);
        let used = store.find_authorization_code(&code.code).await.unwrap().unwrap();
        assert!(used.revoked_at.is_some());
    }

    #[tokio::test]
    async fn test_code_is_single_use() {
        let store = MemoryStore::new();
        let svc = service(Arc::new(store.clone()));
        let code = seed_code(&store, 120).await;

        svc.generate_token_by_code(&code.code).await.unwrap();
        let err = svc.generate_token_by_code(&code.code).await.unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_zero_ttl_code_is_forbidden() {
        let store = MemoryStore::new();
        let svc = service(Arc::new(store.clone()));
        let code = seed_code(&store, 0).await;

        let err = svc.generate_token_by_code(&code.code).await.unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));
        // nothing was issued, nothing was revoked
        let row = store.find_authorization_code(&code.code).await.unwrap().unwrap();
        assert!(row.revoked_at.is_none());
    }

    #[tokio::test]
    async fn test_unknown_code_is_forbidden() {
        let svc = service(Arc::new(MemoryStore::new()));
        assert!(matches!(
            svc.generate_token_by_code("nope").await,
            Err(AuthError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_same_grant_twice_in_one_second() {
        let store = MemoryStore::new();
        let svc = service(Arc::new(store.clone()));
        let (client_id, user_id) = (Uuid::new_v4(), Uuid::new_v4());
        let a = seed_code_for(&store, client_id, user_id, 120).await;
        let b = seed_code_for(&store, client_id, user_id, 120).await;

        let first = svc.generate_token_by_code(&a.code).await.unwrap();
        let second = svc.generate_token_by_code(&b.code).await.unwrap();
        assert_ne!(first.token.access_token, second.token.access_token);
        assert_eq!(first.token.expiry(), second.token.expiry());

        // and a refresh right away
        let rotated = svc
            .generate_token_by_refresh_token(&first.refresh_token.refresh_token)
            .await
            .unwrap();
        assert_ne!(rotated.token.access_token, first.token.access_token);
        svc.authenticate_access_token(&second.token.access_token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_calendar_overflowing_ttl_is_server_error() {
        let store = MemoryStore::new();
        let (signing, verifying) = test_keys();
        let svc = TokenService::new(
            Arc::new(store.clone()),
            signing,
            verifying,
            ChronoDuration::minutes(60),
            ChronoDuration::days(200_000_000),
            Duration::from_secs(1),
        );
        let code = seed_code(&store, 120).await;

        let err = svc.generate_token_by_code(&code.code).await.unwrap_err();
        assert!(matches!(err, AuthError::Server(_)));
        // nothing issued, the code is still good
        assert!(
            store
                .find_valid_authorization_code(&code.code, Utc::now())
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_concurrent_code_exchange_has_one_winner() {
        let store = MemoryStore::new();
        let svc = service(Arc::new(store.clone()));
        let code = seed_code(&store, 120).await;

        let (a, b) = tokio::join!(
            svc.generate_token_by_code(&code.code),
            svc.generate_token_by_code(&code.code)
        );
        let results = [a, b];
        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(AuthError::Forbidden(_))))
        );

        // the winner's token is usable
        svc.authenticate_access_token(&winners[0].token.access_token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_rotation_invalidates_predecessor() {
        let store = MemoryStore::new();
        let svc = service(Arc::new(store.clone()));
        let code = seed_code(&store, 120).await;

        let first = svc.generate_token_by_code(&code.code).await.unwrap();
        let second = svc
            .generate_token_by_refresh_token(&first.refresh_token.refresh_token)
            .await
            .unwrap();

        assert_ne!(first.token.access_token, second.token.access_token);
        assert_ne!(
            first.refresh_token.refresh_token,
            second.refresh_token.refresh_token
        );
        assert_eq!(second.token.user_id, first.token.user_id);
        assert_eq!(second.token.client_id, first.token.client_id);
        assert_eq!(second.token.scope, first.token.scope);

        // old refresh token is spent
        assert!(matches!(
            svc.generate_token_by_refresh_token(&first.refresh_token.refresh_token)
                .await,
            Err(AuthError::Forbidden(_))
        ));
        // old access token no longer authenticates, new one does
        assert!(matches!(
            svc.authenticate_access_token(&first.token.access_token).await,
            Err(AuthError::Forbidden(_))
        ));
        svc.authenticate_access_token(&second.token.access_token)
            .await
            .unwrap();
        // and the new refresh token rotates again
        svc.generate_token_by_refresh_token(&second.refresh_token.refresh_token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_refresh_token_is_forbidden() {
        let store = MemoryStore::new();
        let svc = service(Arc::new(store.clone()));
        let code = seed_code(&store, 120).await;
        let pair = svc.generate_token_by_code(&code.code).await.unwrap();

        let stale = RefreshToken {
            refresh_token: "stale".to_string(),
            access_token: pair.token.access_token.clone(),
            expires_at: Utc::now() - ChronoDuration::seconds(1),
            revoked_at: None,
        };
        store.store_refresh_token(&stale).await.unwrap();

        assert!(matches!(
            svc.generate_token_by_refresh_token("stale").await,
            Err(AuthError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_token_with_missing_access_token() {
        let store = MemoryStore::new();
        let svc = service(Arc::new(store.clone()));
        store
            .store_refresh_token(&RefreshToken {
                refresh_token: "orphan".to_string(),
                access_token: "gone".to_string(),
                expires_at: Utc::now() + ChronoDuration::days(1),
                revoked_at: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            svc.generate_token_by_refresh_token("orphan").await,
            Err(AuthError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_rotation_has_one_winner() {
        let store = MemoryStore::new();
        let svc = service(Arc::new(store.clone()));
        let code = seed_code(&store, 120).await;
        let pair = svc.generate_token_by_code(&code.code).await.unwrap();
        let rt = pair.refresh_token.refresh_token.clone();

        let (a, b) = tokio::join!(
            svc.generate_token_by_refresh_token(&rt),
            svc.generate_token_by_refresh_token(&rt)
        );
        let oks: Vec<_> = [a, b].into_iter().filter_map(|r| r.ok()).collect();
        assert_eq!(oks.len(), 1);
    }

    #[tokio::test]
    async fn test_revoke_access_token_is_idempotent() {
        let store = MemoryStore::new();
        let svc = service(Arc::new(store.clone()));
        let code = seed_code(&store, 120).await;
        let pair = svc.generate_token_by_code(&code.code).await.unwrap();

        svc.revoke_access_token(&pair.token.access_token).await.unwrap();
        svc.revoke_access_token(&pair.token.access_token).await.unwrap();
        svc.revoke_access_token("never-issued").await.unwrap();

        assert!(matches!(
            svc.authenticate_access_token(&pair.token.access_token).await,
            Err(AuthError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_foreign_signed_token_is_rejected() {
        let store = MemoryStore::new();
        let svc = service(Arc::new(store.clone()));
        let (other_signing, _) = test_keys();

        let forged = token::generate(
            &TokenParams {
                user_id: Uuid::new_v4(),
                client_id: Uuid::new_v4(),
                scope: "admin".to_string(),
                expires_at: Utc::now() + ChronoDuration::hours(1),
            },
            &other_signing,
        )
        .unwrap();

        assert!(matches!(
            svc.authenticate_access_token(&forged).await,
            Err(AuthError::Forbidden(_))
        ));
    }

    /// MemoryStore that can be told to fail access token writes
    struct FlakyStore {
        inner: MemoryStore,
        fail_token_writes: AtomicBool,
        fail_token_revokes: AtomicBool,
    }

    impl FlakyStore {
        fn new(inner: MemoryStore) -> Self {
            Self {
                inner,
                fail_token_writes: AtomicBool::new(false),
                fail_token_revokes: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TokenStore for FlakyStore {
        async fn store_authorization_code(&self, code: &AuthorizationCode) -> Result<String> {
            self.inner.store_authorization_code(code).await
        }
        async fn find_authorization_code(&self, code: &str) -> Result<Option<AuthorizationCode>> {
            self.inner.find_authorization_code(code).await
        }
        async fn find_valid_authorization_code(
            &self,
            code: &str,
            now: DateTime<Utc>,
        ) -> Result<Option<AuthorizationCode>> {
            self.inner.find_valid_authorization_code(code, now).await
        }
        async fn revoke_authorization_code(&self, code: &str) -> Result<bool> {
            self.inner.revoke_authorization_code(code).await
        }
        async fn store_token(&self, token: &Token) -> Result<()> {
            if self.fail_token_writes.load(Ordering::SeqCst) {
                return Err(anyhow!("write timeout"));
            }
            self.inner.store_token(token).await
        }
        async fn find_token(&self, access_token: &str) -> Result<Option<Token>> {
            self.inner.find_token(access_token).await
        }
        async fn revoke_token(&self, access_token: &str) -> Result<bool> {
            if self.fail_token_revokes.load(Ordering::SeqCst) {
                return Err(anyhow!("revoke timeout"));
            }
            self.inner.revoke_token(access_token).await
        }
        async fn store_refresh_token(&self, refresh_token: &RefreshToken) -> Result<()> {
            self.inner.store_refresh_token(refresh_token).await
        }
        async fn find_valid_refresh_token(
            &self,
            refresh_token: &str,
            now: DateTime<Utc>,
        ) -> Result<Option<RefreshToken>> {
            self.inner.find_valid_refresh_token(refresh_token, now).await
        }
        async fn revoke_refresh_token(&self, refresh_token: &str) -> Result<bool> {
            self.inner.revoke_refresh_token(refresh_token).await
        }
    }

    #[tokio::test]
    async fn test_failed_issuance_leaves_code_usable() {
        let inner = MemoryStore::new();
        let flaky = Arc::new(FlakyStore::new(inner.clone()));
        flaky.fail_token_writes.store(true, Ordering::SeqCst);
        let svc = service(flaky.clone());
        let code = seed_code(&inner, 120).await;

        let err = svc.generate_token_by_code(&code.code).await.unwrap_err();
        assert!(matches!(err, AuthError::Server(_)));
        assert!(
            inner
                .find_valid_authorization_code(&code.code, Utc::now())
                .await
                .unwrap()
                .is_some()
        );

        flaky.fail_token_writes.store(false, Ordering::SeqCst);
        svc.generate_token_by_code(&code.code).await.unwrap();
    }

    #[tokio::test]
    async fn test_rotation_survives_failed_old_token_revoke() {
        let inner = MemoryStore::new();
        let flaky = Arc::new(FlakyStore::new(inner.clone()));
        let svc = service(flaky.clone());
        let code = seed_code(&inner, 120).await;
        let first = svc.generate_token_by_code(&code.code).await.unwrap();

        flaky.fail_token_revokes.store(true, Ordering::SeqCst);
        let rotated = svc
            .generate_token_by_refresh_token(&first.refresh_token.refresh_token)
            .await
            .unwrap();
        flaky.fail_token_revokes.store(false, Ordering::SeqCst);

        // the new refresh token is the one that works now
        svc.generate_token_by_refresh_token(&rotated.refresh_token.refresh_token)
            .await
            .unwrap();
        assert!(matches!(
            svc.generate_token_by_refresh_token(&first.refresh_token.refresh_token)
                .await,
            Err(AuthError::Forbidden(_))
        ));
    }
}
