//! Bearer token verification and channel authorization.
//!
//! [`AuthenticationVerifier`] checks HS256 signature and expiry against the
//! process-wide secret and produces an [`Identity`]. It is stateless and
//! safe to call concurrently without synchronization. Which channels an
//! identity may join is decided by its permitted patterns; the role→pattern
//! mapping is consumed here, not authored.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use serde::{Deserialize, Serialize};

use crate::domain::channels;
use crate::error::RealtimeError;

/// Claims carried by a platform bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id).
    pub sub: String,
    /// Platform role (`admin`, `dpo`, `auditor`, ...).
    pub role: String,
    /// Explicit permitted-channel patterns. When empty, role defaults apply.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Expiration time (Unix timestamp, seconds).
    pub exp: u64,
    /// Issued at (Unix timestamp, seconds).
    pub iat: u64,
}

/// A verified identity attached to an authenticated connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// User id.
    pub id: String,
    /// Platform role.
    pub role: String,
    /// Channel patterns this identity may subscribe to. A pattern is an
    /// exact channel name, a `domain:*` prefix wildcard, or `*`.
    pub permitted_channels: Vec<String>,
}

impl Identity {
    /// Returns `true` if the channel matches one of the permitted patterns.
    #[must_use]
    pub fn may_subscribe(&self, channel: &str) -> bool {
        self.permitted_channels.iter().any(|pattern| {
            if pattern == "*" {
                return true;
            }
            if let Some(prefix) = pattern.strip_suffix('*') {
                return channel.starts_with(prefix);
            }
            pattern == channel
        })
    }
}

/// Stateless bearer token verifier over the process-wide signing secret.
pub struct AuthenticationVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for AuthenticationVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationVerifier").finish_non_exhaustive()
    }
}

impl AuthenticationVerifier {
    /// Creates a verifier for HS256 tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verifies signature and expiry, returning the token's identity.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Authentication`] on an expired, malformed,
    /// or wrongly signed token.
    pub fn verify(&self, token: &str) -> Result<Identity, RealtimeError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(
            |err| match err.kind() {
                ErrorKind::ExpiredSignature => {
                    RealtimeError::Authentication("token expired".to_string())
                }
                _ => RealtimeError::Authentication(format!("invalid token: {err}")),
            },
        )?;

        let claims = data.claims;
        let permitted_channels = if claims.channels.is_empty() {
            default_patterns(&claims.role)
        } else {
            claims.channels
        };

        Ok(Identity {
            id: claims.sub,
            role: claims.role,
            permitted_channels,
        })
    }
}

/// Role defaults applied when a token carries no explicit `channels` claim.
/// Admins see everything; everyone else sees the well-known channels except
/// the per-user activity feed.
fn default_patterns(role: &str) -> Vec<String> {
    if role == "admin" {
        return vec!["*".to_string()];
    }
    channels::ALL
        .iter()
        .filter(|channel| **channel != channels::USER_ACTIVITY)
        .map(|channel| (*channel).to_string())
        .collect()
}
