//! Capability tokens - short-lived, narrowly scoped dispatch credentials.
//!
//! The [`TokenIssuer`] is owned by the scheduler and is the only holder of
//! use counters and revocations. The [`TokenVerifier`] is stateless and is
//! handed to the sandboxed executor (and to anything else at an execution
//! boundary) so that every token is re-checked where it is used.
//!
//! # Invariants
//! - `granted` is covered by the issued-to arm's declared set
//! - `granted` covers what the action requires, and nothing more
//! - `signature` is an HS256 JWT whose claims restate every other field

mod issuer;
mod verify;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::CapabilitySet;
use crate::task::TaskId;

pub use issuer::TokenIssuer;
pub use verify::TokenVerifier;

/// A signed credential for one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub id: String,
    /// Arm the token was minted for
    pub issued_to: String,
    pub task_id: TaskId,
    pub step: u32,
    pub granted: CapabilitySet,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Use ceiling
    pub max_uses: u32,
    /// Compact HS256 JWT over the claims
    pub signature: String,
}

impl CapabilityToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// JWT claims mirrored from a [`CapabilityToken`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub jti: String,
    /// Issued-to arm id
    pub sub: String,
    pub task: String,
    pub step: u32,
    pub caps: Vec<String>,
    /// Issued-at unix seconds
    pub iat: i64,
    /// Expiration unix seconds
    pub exp: i64,
    pub max_uses: u32,
}

impl TokenClaims {
    pub(crate) fn from_token(token: &CapabilityToken) -> Self {
        Self {
            jti: token.id.clone(),
            sub: token.issued_to.clone(),
            task: token.task_id.to_string(),
            step: token.step,
            caps: token.granted.to_strings(),
            iat: token.issued_at.timestamp(),
            exp: token.expires_at.timestamp(),
            max_uses: token.max_uses,
        }
    }
}

/// Errors raised issuing, redeeming, or verifying tokens.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TokenError {
    #[error("Arm '{arm_id}' does not declare {missing}")]
    ArmLacksCapability {
        arm_id: String,
        missing: CapabilitySet,
    },

    #[error("Token scope does not cover {missing}")]
    ScopeInsufficient { missing: CapabilitySet },

    #[error("Token was issued to '{issued_to}', presented by '{presented_by}'")]
    WrongArm {
        issued_to: String,
        presented_by: String,
    },

    #[error("Invalid token signature: {0}")]
    InvalidSignature(String),

    #[error("Token fields do not match its signed claims")]
    Tampered,

    #[error("Token has expired")]
    Expired,

    #[error("Token {0} has no uses left")]
    UsesExhausted(String),

    #[error("Token {0} was revoked")]
    Revoked(String),

    #[error("Token {0} was not issued by this issuer")]
    UnknownToken(String),

    #[error("Cannot derive requirements: {0}")]
    InvalidAction(String),

    #[error("Failed to sign token: {0}")]
    Encoding(String),
}
