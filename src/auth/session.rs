use super::traits::SessionStore;
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// session keys used by the browser flow
pub const AUTH_KEY: &str = "auth";
pub const SIGNIN_FORM_KEY: &str = "signin_form";
pub const LOGIN_KEY: &str = "login";
pub const FLASH_KEY: &str = "flash";

/// One browser session. Values are JSON documents stored under `{id}:{key}`.
#[derive(Clone)]
pub struct Session {
    id: String,
    store: Arc<dyn SessionStore + Send + Sync>,
    ttl: Duration,
}

impl Session {
    pub fn new(id: String, store: Arc<dyn SessionStore + Send + Sync>, ttl: Duration) -> Self {
        Self { id, store, ttl }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}:{}", self.id, key)
    }

    pub async fn set_named<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)
            .with_context(|| format!("failed to encode session value {key}"))?;
        self.store.set(&self.scoped(key), encoded, self.ttl).await
    }

    pub async fn get_named<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(&self.scoped(key)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .with_context(|| format!("failed to decode session value {key}")),
            None => Ok(None),
        }
    }

    /// get, then delete
    pub async fn flush_named<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let value = self.get_named(key).await?;
        self.delete(key).await?;
        Ok(value)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(&self.scoped(key)).await
    }

    /// Carry `keys` over to a session under `new_id` and drop them here.
    /// Anything not listed stays behind with the old id.
    pub async fn move_to(&self, new_id: String, keys: &[&str]) -> Result<Session> {
        let next = Session::new(new_id, self.store.clone(), self.ttl);
        for key in keys {
            if let Some(raw) = self.store.get(&self.scoped(key)).await? {
                self.store.set(&next.scoped(key), raw, self.ttl).await?;
            }
            self.delete(key).await?;
        }
        Ok(next)
    }

    /// queue a message for the next rendered page
    pub async fn add_flash(&self, message: impl Into<String>) -> Result<()> {
        let mut messages: Vec<String> = self.get_named(FLASH_KEY).await?.unwrap_or_default();
        messages.push(message.into());
        self.set_named(FLASH_KEY, &messages).await
    }

    pub async fn take_flash(&self) -> Result<Vec<String>> {
        Ok(self.flush_named(FLASH_KEY).await?.unwrap_or_default())
    }
}
