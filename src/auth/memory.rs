use super::model::{AuthorizationCode, Client, RefreshToken, Token, User};
use super::traits::{CredentialStore, SessionStore, TokenStore};
use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory users, clients, codes and tokens. Nothing survives a restart.
///
/// Every revoke takes the write lock and checks `revoked_at` under it, so
/// concurrent revokes of the same row have exactly one winner.
#[derive(Clone, Default)]
pub struct MemoryStore {
    users: Arc<RwLock<HashMap<String, User>>>,
    clients: Arc<RwLock<HashMap<Uuid, Client>>>,
    codes: Arc<RwLock<HashMap<String, AuthorizationCode>>>,
    tokens: Arc<RwLock<HashMap<String, Token>>>,
    refresh_tokens: Arc<RwLock<HashMap<String, RefreshToken>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// users are keyed by email, so a second insert with the same email replaces the first
    pub async fn insert_user(&self, user: User) {
        self.users.write().await.insert(user.email.clone(), user);
    }

    pub async fn insert_client(&self, client: Client) {
        self.clients.write().await.insert(client.id, client);
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self.users.read().await.get(email).cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.id == id)
            .cloned())
    }

    async fn find_client_by_id(&self, id: Uuid) -> Result<Option<Client>> {
        Ok(self.clients.read().await.get(&id).cloned())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn store_authorization_code(&self, code: &AuthorizationCode) -> Result<String> {
        let mut codes = self.codes.write().await;
        if codes.contains_key(&code.code) {
            bail!("authorization code already exists");
        }
        codes.insert(code.code.clone(), code.clone());
        Ok(code.code.clone())
    }

    async fn find_authorization_code(&self, code: &str) -> Result<Option<AuthorizationCode>> {
        Ok(self.codes.read().await.get(code).cloned())
    }

    async fn find_valid_authorization_code(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthorizationCode>> {
        Ok(self
            .codes
            .read()
            .await
            .get(code)
            .filter(|c| c.revoked_at.is_none() && c.expires_at > now)
            .cloned())
    }

    async fn revoke_authorization_code(&self, code: &str) -> Result<bool> {
        let mut codes = self.codes.write().await;
        match codes.get_mut(code) {
            Some(c) if c.revoked_at.is_none() => {
                let now = Utc::now();
                c.revoked_at = Some(now);
                c.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn store_token(&self, token: &Token) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        if tokens.contains_key(&token.access_token) {
            bail!("access token already exists");
        }
        tokens.insert(token.access_token.clone(), token.clone());
        Ok(())
    }

    async fn find_token(&self, access_token: &str) -> Result<Option<Token>> {
        Ok(self.tokens.read().await.get(access_token).cloned())
    }

    async fn revoke_token(&self, access_token: &str) -> Result<bool> {
        let mut tokens = self.tokens.write().await;
        match tokens.get_mut(access_token) {
            Some(t) if t.revoked_at.is_none() => {
                t.revoked_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn store_refresh_token(&self, refresh_token: &RefreshToken) -> Result<()> {
        let mut refresh_tokens = self.refresh_tokens.write().await;
        if refresh_tokens.contains_key(&refresh_token.refresh_token) {
            bail!("refresh token already exists");
        }
        refresh_tokens.insert(refresh_token.refresh_token.clone(), refresh_token.clone());
        Ok(())
    }

    async fn find_valid_refresh_token(
        &self,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshToken>> {
        Ok(self
            .refresh_tokens
            .read()
            .await
            .get(refresh_token)
            .filter(|rt| rt.is_active(now))
            .cloned())
    }

    async fn revoke_refresh_token(&self, refresh_token: &str) -> Result<bool> {
        let mut refresh_tokens = self.refresh_tokens.write().await;
        match refresh_tokens.get_mut(refresh_token) {
            Some(rt) if rt.revoked_at.is_none() => {
                rt.revoked_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// max live session entries before we start evicting the oldest
const MAX_SESSION_ENTRIES: usize = 10_000;

struct SessionEntry {
    value: String,
    expires_at: Instant,
}

/// session key/value storage (in-memory, doesn't persist)
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// boot out anything past its ttl
    pub async fn cleanup_expired(&self) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);

        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!("cleaned up {} expired session entries", removed);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        if self.len().await >= MAX_SESSION_ENTRIES {
            self.cleanup_expired().await;
        }

        let mut entries = self.entries.write().await;
        // still full after cleanup: drop whatever expires soonest
        while entries.len() >= MAX_SESSION_ENTRIES {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            entries.remove(&oldest);
            tracing::debug!("evicted session entry due to capacity limit: {}", oldest);
        }

        entries.insert(
            key.to_string(),
            SessionEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
