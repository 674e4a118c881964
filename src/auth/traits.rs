use super::error::AuthError;
use super::model::{AuthorizationCode, Client, RefreshToken, Token, User};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

// async_trait my beloved. this shit rocks

/// Read side of users and clients. Absent rows are `None`, never an empty struct.
#[async_trait]
pub trait CredentialStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>>;
    async fn find_client_by_id(&self, id: Uuid) -> Result<Option<Client>>;
}

/// Persistence for codes, access tokens and refresh tokens.
///
/// The `revoke_*` methods must be single-winner: they return `true` only for
/// the one call that moved the row from unrevoked to revoked (think
/// `UPDATE ... WHERE revoked_at IS NULL`), and `false` for unknown or already
/// revoked rows. Exchange-once and rotate-once depend on it.
#[async_trait]
pub trait TokenStore {
    async fn store_authorization_code(&self, code: &AuthorizationCode) -> Result<String>;
    /// plain lookup by value, ignores expiry and revocation
    async fn find_authorization_code(&self, code: &str) -> Result<Option<AuthorizationCode>>;
    /// unrevoked and `expires_at > now`
    async fn find_valid_authorization_code(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthorizationCode>>;
    async fn revoke_authorization_code(&self, code: &str) -> Result<bool>;

    async fn store_token(&self, token: &Token) -> Result<()>;
    /// returns revoked and expired rows too, callers decide what counts as active
    async fn find_token(&self, access_token: &str) -> Result<Option<Token>>;
    async fn revoke_token(&self, access_token: &str) -> Result<bool>;

    async fn store_refresh_token(&self, refresh_token: &RefreshToken) -> Result<()>;
    /// unrevoked and `expires_at > now`
    async fn find_valid_refresh_token(
        &self,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshToken>>;
    async fn revoke_refresh_token(&self, refresh_token: &str) -> Result<bool>;
}

/// Raw key/value storage behind browser sessions. Keys arrive already scoped
/// to a session id; values expire after `ttl`.
#[async_trait]
pub trait SessionStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Run a store call under the caller's deadline, folding both failure and
/// timeout into a server error.
pub(crate) async fn bounded<T, F>(timeout: Duration, step: &'static str, fut: F) -> Result<T, AuthError>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(AuthError::server(e.context(step))),
        Err(_) => Err(AuthError::server(anyhow!(
            "{step}: timed out after {timeout:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_passes_value_through() {
        let value = bounded(Duration::from_secs(1), "lookup", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_bounded_wraps_store_failure() {
        let err = bounded::<(), _>(Duration::from_secs(1), "store token", async {
            Err(anyhow!("disk full"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AuthError::Server(_)));
        assert!(err.to_string().contains("store token"));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let err = bounded::<(), _>(Duration::from_millis(10), "slow lookup", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AuthError::Server(_)));
        assert!(err.to_string().contains("timed out"));
    }
}
