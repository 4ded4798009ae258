//! Relying-party client registry.
//!
//! Clients that consume the published JWKS register here. Confidential
//! clients hold a secret; like refresh tokens, only its hash is stored.

use crate::error::{AuthError, AuthResult};
use crate::jwks::refresh::hash_refresh_token;
use crate::jwks::CLIENTS_TABLE;
use crate::orm::{from_row, row, to_row, Orm, Predicate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Client confidentiality class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// No secret; public JWKS consumption only
    Public,
    /// Holds a secret and can authenticate itself
    Confidential,
}

/// A relying-party client row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRow {
    /// Row id
    pub id: String,
    /// Owning subject
    pub subject_id: String,
    /// Confidentiality class
    pub client_type: ClientType,
    /// SHA-256 of the client secret, confidential clients only
    #[serde(default)]
    pub client_secret_hash: Option<String>,
    /// Display name
    pub name: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the client may authenticate
    pub is_active: bool,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Last update instant
    pub updated_at: DateTime<Utc>,
}

/// Registry of relying-party clients.
pub struct ClientRegistry {
    orm: Arc<dyn Orm>,
}

impl ClientRegistry {
    /// Create the registry over the given store.
    #[must_use]
    pub fn new(orm: Arc<dyn Orm>) -> Self {
        Self { orm }
    }

    /// Register a client.
    ///
    /// Confidential clients require a secret; its hash is stored, the raw
    /// secret never is.
    pub async fn register_client(
        &self,
        subject_id: &str,
        client_type: ClientType,
        name: &str,
        description: Option<&str>,
        secret: Option<&str>,
    ) -> AuthResult<ClientRow> {
        let client_secret_hash = match (client_type, secret) {
            (ClientType::Confidential, Some(secret)) => Some(hash_refresh_token(secret)),
            (ClientType::Confidential, None) => {
                return Err(AuthError::input_validation(
                    "secret is required for confidential clients",
                ))
            }
            (ClientType::Public, _) => None,
        };

        let now = Utc::now();
        let client = ClientRow {
            id: Uuid::new_v4().to_string(),
            subject_id: subject_id.to_string(),
            client_type,
            client_secret_hash,
            name: name.to_string(),
            description: description.map(str::to_string),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.orm.create(CLIENTS_TABLE, to_row(&client)?).await?;

        info!(client_id = %client.id, name, "Registered relying-party client");
        Ok(client)
    }

    /// Verify a confidential client's secret.
    ///
    /// Inactive, public, and unknown clients all fail the same way.
    pub async fn verify_client_secret(&self, client_id: &str, secret: &str) -> AuthResult<bool> {
        let Some(found) = self
            .orm
            .find_first(CLIENTS_TABLE, &Predicate::eq("id", client_id))
            .await?
        else {
            return Ok(false);
        };
        let client: ClientRow = from_row(found)?;

        Ok(client.is_active
            && client.client_type == ClientType::Confidential
            && client
                .client_secret_hash
                .is_some_and(|hash| hash == hash_refresh_token(secret)))
    }

    /// Deactivate a client. Idempotent.
    pub async fn deactivate_client(&self, client_id: &str) -> AuthResult<()> {
        self.orm
            .update_many(
                CLIENTS_TABLE,
                &Predicate::eq("id", client_id),
                row(vec![
                    ("is_active", json!(false)),
                    ("updated_at", json!(Utc::now())),
                ]),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orm::MemoryOrm;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(Arc::new(MemoryOrm::new()))
    }

    #[tokio::test]
    async fn test_confidential_client_requires_secret() {
        let reg = registry();
        let err = reg
            .register_client("u1", ClientType::Confidential, "backend", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InputValidation(_)));
    }

    #[tokio::test]
    async fn test_secret_verification() {
        let reg = registry();
        let client = reg
            .register_client(
                "u1",
                ClientType::Confidential,
                "backend",
                Some("internal API"),
                Some("s3cret"),
            )
            .await
            .unwrap();

        assert!(reg.verify_client_secret(&client.id, "s3cret").await.unwrap());
        assert!(!reg.verify_client_secret(&client.id, "wrong").await.unwrap());
        assert!(!reg.verify_client_secret("unknown", "s3cret").await.unwrap());
    }

    #[tokio::test]
    async fn test_public_client_never_verifies() {
        let reg = registry();
        let client = reg
            .register_client("u1", ClientType::Public, "spa", None, Some("ignored"))
            .await
            .unwrap();

        assert!(client.client_secret_hash.is_none());
        assert!(!reg.verify_client_secret(&client.id, "ignored").await.unwrap());
    }

    #[tokio::test]
    async fn test_deactivation_blocks_verification() {
        let reg = registry();
        let client = reg
            .register_client("u1", ClientType::Confidential, "backend", None, Some("s"))
            .await
            .unwrap();

        reg.deactivate_client(&client.id).await.unwrap();
        reg.deactivate_client(&client.id).await.unwrap();
        assert!(!reg.verify_client_secret(&client.id, "s").await.unwrap());
    }
}
