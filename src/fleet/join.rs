//! Join-token issuance and redemption
//!
//! A join token is a short-lived, single-use bearer secret that authorizes a
//! new node to register into the fleet. The token value is an AES-256-GCM
//! encrypted payload (12-byte nonce prepended to the ciphertext, the whole
//! thing base64url-encoded) carrying the issuing fleet id, the token id and
//! the expiry. The key is derived from the fleet passphrase with SHA-256 and
//! rotated out of band; rotating it invalidates every outstanding token.
//!
//! Redemption is exactly-once: the used flag is flipped under the token
//! record's entry lock, so two requests racing with the same stolen token
//! yield one success and one `TokenAlreadyUsed`.

use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::node::{JoinRequestInfo, NodeRole, UNode};
use super::registry::{RegistryError, SharedNodeRegistry};

/// Default token lifetime
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// Errors from token issuance and redemption.
///
/// All redemption failures are non-retryable: the caller must obtain a new
/// token.
#[derive(Error, Debug)]
pub enum JoinError {
    #[error("Join token has expired")]
    TokenExpired,

    #[error("Join token was already used")]
    TokenAlreadyUsed,

    #[error("Join token is invalid")]
    TokenInvalid,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl JoinError {
    /// Stable error code for the routing layer
    pub fn code(&self) -> &'static str {
        match self {
            JoinError::TokenExpired => "TOKEN_EXPIRED",
            JoinError::TokenAlreadyUsed => "TOKEN_ALREADY_USED",
            JoinError::TokenInvalid => "TOKEN_INVALID",
            JoinError::Registry(e) => e.code(),
        }
    }
}

/// Derive the 256-bit token key from the fleet passphrase
pub fn derive_key(passphrase: &str) -> [u8; 32] {
    let digest = Sha256::digest(passphrase.as_bytes());
    digest.into()
}

/// Encrypted token payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct TokenPayload {
    token_id: Uuid,
    fleet_id: String,
    expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<NodeRole>,
}

/// Audit record kept for every issued token. The bearer value itself is
/// never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinTokenRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    /// Role hint applied to the joining node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<NodeRole>,
    /// Node created by redeeming this token, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeemed_node_id: Option<String>,
}

/// A freshly minted token: the bearer value plus its audit record
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub record: JoinTokenRecord,
}

/// Mints and redeems join tokens for one fleet
pub struct JoinTokenIssuer {
    fleet_id: String,
    cipher: Aes256Gcm,
    tokens: DashMap<Uuid, JoinTokenRecord>,
    registry: SharedNodeRegistry,
}

impl JoinTokenIssuer {
    pub fn new(fleet_id: impl Into<String>, key: &[u8; 32], registry: SharedNodeRegistry) -> Self {
        Self {
            fleet_id: fleet_id.into(),
            cipher: Aes256Gcm::new(key.into()),
            tokens: DashMap::new(),
            registry,
        }
    }

    /// Mint a single-use token with the default lifetime
    pub fn issue(&self, role: Option<NodeRole>) -> Result<IssuedToken, JoinError> {
        self.issue_with_ttl(role, Duration::seconds(DEFAULT_TOKEN_TTL_SECS))
    }

    /// Mint a single-use token with an explicit lifetime
    pub fn issue_with_ttl(
        &self,
        role: Option<NodeRole>,
        ttl: Duration,
    ) -> Result<IssuedToken, JoinError> {
        let now = Utc::now();
        let payload = TokenPayload {
            token_id: Uuid::new_v4(),
            fleet_id: self.fleet_id.clone(),
            expires_at: now + ttl,
            role,
        };

        let token = self.seal(&payload)?;
        let record = JoinTokenRecord {
            id: payload.token_id,
            created_at: now,
            expires_at: payload.expires_at,
            used: false,
            used_at: None,
            role,
            redeemed_node_id: None,
        };
        self.tokens.insert(record.id, record.clone());

        info!(token_id = %record.id, expires_at = %record.expires_at, "join token issued");
        Ok(IssuedToken { token, record })
    }

    /// Redeem a token and register the joining node.
    ///
    /// The mark-used step and node creation form one atomic unit under the
    /// token entry lock; a losing concurrent redemption fails with
    /// `TokenAlreadyUsed` and never creates a duplicate node.
    pub fn redeem(&self, token_value: &str, info: JoinRequestInfo) -> Result<UNode, JoinError> {
        let payload = self.open(token_value)?;

        if payload.fleet_id != self.fleet_id {
            return Err(JoinError::TokenInvalid);
        }

        let mut record = self
            .tokens
            .get_mut(&payload.token_id)
            .ok_or(JoinError::TokenInvalid)?;

        if record.used {
            return Err(JoinError::TokenAlreadyUsed);
        }
        if Utc::now() > payload.expires_at {
            return Err(JoinError::TokenExpired);
        }

        // Burn the token before touching the registry: a redemption attempt
        // invalidates it permanently regardless of outcome.
        record.used = true;
        record.used_at = Some(Utc::now());

        let node = UNode::new(
            format!("unode-{}", Uuid::new_v4()),
            payload.role.unwrap_or_default(),
            info,
        );
        self.registry.register(node.clone())?;
        record.redeemed_node_id = Some(node.id.clone());

        info!(token_id = %record.id, node_id = %node.id, "join token redeemed");
        Ok(node)
    }

    /// All issued tokens, for audit listings
    pub fn list_tokens(&self) -> Vec<JoinTokenRecord> {
        self.tokens.iter().map(|r| r.clone()).collect()
    }

    fn seal(&self, payload: &TokenPayload) -> Result<String, JoinError> {
        let plaintext = serde_json::to_vec(payload).map_err(|_| JoinError::TokenInvalid)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| JoinError::TokenInvalid)?;

        let mut raw = nonce.to_vec();
        raw.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    fn open(&self, token_value: &str) -> Result<TokenPayload, JoinError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token_value)
            .map_err(|_| JoinError::TokenInvalid)?;
        if raw.len() < 13 {
            return Err(JoinError::TokenInvalid);
        }

        let (nonce_bytes, ciphertext) = raw.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| JoinError::TokenInvalid)?;

        serde_json::from_slice(&plaintext).map_err(|_| JoinError::TokenInvalid)
    }
}
