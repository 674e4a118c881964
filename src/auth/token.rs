use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid key material: {0}")]
    Key(#[source] jsonwebtoken::errors::Error),

    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

/// Ed25519 private key used to mint access tokens
#[derive(Clone)]
pub struct SigningKey(EncodingKey);

impl SigningKey {
    /// PKCS#8 PEM ("BEGIN PRIVATE KEY")
    pub fn from_ed_pem(pem: &[u8]) -> Result<Self, CodecError> {
        EncodingKey::from_ed_pem(pem).map(Self).map_err(CodecError::Key)
    }
}

/// Ed25519 public key. Anything holding only this can verify tokens.
#[derive(Clone)]
pub struct VerifyingKey(DecodingKey);

impl VerifyingKey {
    /// SPKI PEM ("BEGIN PUBLIC KEY")
    pub fn from_ed_pem(pem: &[u8]) -> Result<Self, CodecError> {
        DecodingKey::from_ed_pem(pem).map(Self).map_err(CodecError::Key)
    }
}

/// What goes into a fresh access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenParams {
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub scope: String,
    pub iat: i64, // Issued at
    pub exp: i64, // Expires at
    /// unique per token, two grants in the same second must not sign to the same string
    pub jti: Uuid,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.exp <= now.timestamp()
    }
}

/// Sign `params` into a compact EdDSA JWT. `iat` and `jti` are filled in here.
pub fn generate(params: &TokenParams, key: &SigningKey) -> Result<String, CodecError> {
    let claims = Claims {
        user_id: params.user_id,
        client_id: params.client_id,
        scope: params.scope.clone(),
        iat: Utc::now().timestamp(),
        exp: params.expires_at.timestamp(),
        jti: Uuid::new_v4(),
    };

    encode(&Header::new(Algorithm::EdDSA), &claims, &key.0).map_err(CodecError::Signing)
}

/// Verify signature and algorithm, then decode the claims.
///
/// Expiry is deliberately not checked here; callers compare `exp` against
/// their own clock (see `Claims::is_expired`).
pub fn parse(token: &str, key: &VerifyingKey) -> Result<Claims, CodecError> {
    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    decode::<Claims>(token, &key.0, &validation)
        .map(|data| data.claims)
        .map_err(|e| CodecError::InvalidToken(e.to_string()))
}

#[cfg(test)]
pub(crate) fn test_keys() -> (SigningKey, VerifyingKey) {
    use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
    use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};

    let secret = ed25519_dalek::SigningKey::from_bytes(&rand::random::<[u8; 32]>());
    let private_pem = secret.to_pkcs8_pem(LineEnding::LF).unwrap();
    let public_pem = secret
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();

    (
        SigningKey::from_ed_pem(private_pem.as_bytes()).unwrap(),
        VerifyingKey::from_ed_pem(public_pem.as_bytes()).unwrap(),
    )
}
