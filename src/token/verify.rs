//! Stateless token verification for execution boundaries.

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};

use super::{CapabilityToken, TokenClaims, TokenError};
use crate::capability::CapabilitySet;

/// Checks signature, expiry, and scope of a presented token.
///
/// Holds only the shared secret; cloning is cheap enough to hand one to
/// every executor.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify a token covers `required`.
    ///
    /// # Errors
    /// - `InvalidSignature` if the JWT does not verify under this secret
    /// - `Tampered` if any token field differs from its signed claim
    /// - `Expired` once `expires_at` has passed
    /// - `ScopeInsufficient` naming what the granted set does not cover
    pub fn verify(
        &self,
        token: &CapabilityToken,
        required: &CapabilitySet,
    ) -> Result<TokenClaims, TokenError> {
        let claims = jsonwebtoken::decode::<TokenClaims>(&token.signature, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::InvalidSignature(e.to_string()),
            })?
            .claims;

        if claims != TokenClaims::from_token(token) {
            return Err(TokenError::Tampered);
        }
        if token.is_expired_at(Utc::now()) {
            return Err(TokenError::Expired);
        }
        let missing = token.granted.uncovered(required);
        if !missing.is_empty() {
            return Err(TokenError::ScopeInsufficient { missing });
        }
        Ok(claims)
    }

    /// Verify, and also that the token belongs to `arm_id`.
    pub fn verify_for_arm(
        &self,
        token: &CapabilityToken,
        arm_id: &str,
        required: &CapabilitySet,
    ) -> Result<TokenClaims, TokenError> {
        let claims = self.verify(token, required)?;
        if claims.sub != arm_id {
            return Err(TokenError::WrongArm {
                issued_to: claims.sub,
                presented_by: arm_id.to_string(),
            });
        }
        Ok(claims)
    }
}
