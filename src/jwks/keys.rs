//! Signing key rows and RSA key material generation.

use crate::config::JwtAlgorithm;
use crate::error::{AuthError, AuthResult};
use crate::jwks::jwk::Jwk;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// A signing key row from the `jwks_key` table.
///
/// `public_key` holds the JWK form published through the key set;
/// `private_key` holds the PEM wrapped in JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwksKeyRow {
    /// Row id
    pub id: String,
    /// Globally unique key id, embedded in JWT headers as `kid`
    pub key_id: String,
    /// Signing algorithm name
    pub algorithm: String,
    /// Public key as JWK JSON
    pub public_key: Value,
    /// Private key JSON (`{"kty": "RSA", "pem": …}`)
    pub private_key: Value,
    /// Whether this key still verifies tokens
    pub is_active: bool,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// End of the key's signing or grace window
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Last signing use
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Number of tokens signed with this key
    #[serde(default)]
    pub usage_count: i64,
}

impl JwksKeyRow {
    /// Whether the key is past its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// The published JWK for this key.
    pub fn to_jwk(&self) -> AuthResult<Jwk> {
        serde_json::from_value(self.public_key.clone())
            .map_err(|e| AuthError::internal(format!("Malformed public key JWK: {e}")))
    }

    /// The private key PEM for signing.
    pub fn private_pem(&self) -> AuthResult<&str> {
        self.private_key
            .get("pem")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::internal("Signing key row has no private PEM"))
    }
}

/// Freshly generated key material, ready to persist.
pub struct GeneratedKey {
    /// Globally unique key id
    pub key_id: String,
    /// Public key in JWK form
    pub public_jwk: Value,
    /// Private key JSON
    pub private_key: Value,
}

/// Generate an RSA keypair for the given algorithm.
///
/// Key generation is CPU-bound and runs on a blocking task.
pub async fn generate_key_material(
    algorithm: JwtAlgorithm,
    bits: usize,
) -> AuthResult<GeneratedKey> {
    let key_id = format!("key-{}", Uuid::new_v4());

    let (private_pem, n, e) = tokio::task::spawn_blocking(move || -> AuthResult<_> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| AuthError::internal(format!("RSA key generation failed: {e}")))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| AuthError::internal(format!("Private key encoding failed: {e}")))?
            .to_string();

        let n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());
        Ok((private_pem, n, e))
    })
    .await
    .map_err(|e| AuthError::internal(format!("Key generation task failed: {e}")))??;

    Ok(GeneratedKey {
        public_jwk: json!({
            "kty": "RSA",
            "kid": key_id,
            "use": "sig",
            "alg": algorithm.as_str(),
            "n": n,
            "e": e,
        }),
        private_key: json!({ "kty": "RSA", "pem": private_pem }),
        key_id,
    })
}

/// Build a `jsonwebtoken` decoding key from a stored public JWK.
pub fn decoding_key(public_jwk: &Value) -> AuthResult<jsonwebtoken::DecodingKey> {
    let n = public_jwk
        .get("n")
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::internal("Public JWK missing modulus"))?;
    let e = public_jwk
        .get("e")
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::internal("Public JWK missing exponent"))?;
    jsonwebtoken::DecodingKey::from_rsa_components(n, e)
        .map_err(|e| AuthError::internal(format!("Public key rejected: {e}")))
}
