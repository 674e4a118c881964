use super::error::{AuthError, ClientError};
use super::model::{Client, User};
use super::traits::{CredentialStore, bounded};
use anyhow::anyhow;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Both "no such user" and "wrong password" surface with this exact message
const SIGNIN_FAILED: &str = "user or password not match";

/// Verified against when the email is unknown, so that failure costs the same
/// bcrypt work as a wrong password. Built on first use, off the async workers.
static TIMING_HASH: LazyLock<String> =
    LazyLock::new(|| bcrypt::hash("no such user", bcrypt::DEFAULT_COST).unwrap_or_default());

/// Checks clients against their registered redirect uri and users against their password hash
#[derive(Clone)]
pub struct CredentialVerifier {
    store: Arc<dyn CredentialStore + Send + Sync>,
    store_timeout: Duration,
}

impl CredentialVerifier {
    pub fn new(store: Arc<dyn CredentialStore + Send + Sync>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    pub async fn find_client(&self, client_id: Uuid) -> Result<Client, AuthError> {
        bounded(
            self.store_timeout,
            "find client",
            self.store.find_client_by_id(client_id),
        )
        .await?
        .ok_or_else(|| ClientError::ClientNotFound.into())
    }

    /// The redirect uri must equal the registered one exactly. No prefixes, no wildcards.
    pub async fn authenticate_client(
        &self,
        client_id: Uuid,
        redirect_uri: &str,
    ) -> Result<Client, AuthError> {
        let client = self.find_client(client_id).await.inspect_err(|e| {
            if matches!(e, AuthError::Client(_)) {
                tracing::warn!("unknown client_id {}", client_id);
            }
        })?;

        let matches: bool = client
            .redirect_uri
            .as_bytes()
            .ct_eq(redirect_uri.as_bytes())
            .into();
        if !matches {
            tracing::warn!(
                "rejected redirect_uri '{}' for client '{}'",
                redirect_uri,
                client_id
            );
            return Err(ClientError::RedirectMismatch.into());
        }

        Ok(client)
    }

    /// The user a bearer token was issued to. Gone since issuance is `Forbidden`.
    pub async fn find_user(&self, user_id: Uuid) -> Result<User, AuthError> {
        bounded(
            self.store_timeout,
            "find user",
            self.store.find_user_by_id(user_id),
        )
        .await?
        .ok_or_else(|| AuthError::forbidden("user not found"))
    }

    /// Unknown email and bad password collapse into the same redirect back to
    /// sign-in. Only a failing lookup is a server error.
    pub async fn authenticate_user(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let user = bounded(
            self.store_timeout,
            "find user",
            self.store.find_user_by_email(email),
        )
        .await?;

        let Some(user) = user else {
            verify_password(password, None).await?;
            tracing::warn!("sign-in failed: unknown email");
            return Err(AuthError::redirect_to_signin(SIGNIN_FAILED));
        };

        if !verify_password(password, Some(&user.password_hash)).await? {
            tracing::warn!("sign-in failed: password mismatch for user {}", user.id);
            return Err(AuthError::redirect_to_signin(SIGNIN_FAILED));
        }

        Ok(user)
    }
}

/// bcrypt is deliberately slow, so keep it off the async workers. A malformed
/// stored hash counts as a mismatch. No hash means check against `TIMING_HASH`.
async fn verify_password(password: &str, hash: Option<&str>) -> Result<bool, AuthError> {
    let password = password.to_owned();
    let hash = hash.map(str::to_owned);

    tokio::task::spawn_blocking(move || {
        let hash = hash.as_deref().unwrap_or(TIMING_HASH.as_str());
        bcrypt::verify(&password, hash).unwrap_or(false)
    })
    .await
    .map_err(|e| AuthError::server(anyhow!("password verification task failed: {e}")))
}

#[cfg(test)]
pub(crate) fn hash_password(password: &str) -> String {
    // minimum cost, tests don't need the real work factor
    bcrypt::hash(password, 4).unwrap()
}
