//! Token minting, redemption, and revocation.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{EncodingKey, Header};
use tracing::debug;
use uuid::Uuid;

use super::{CapabilityToken, TokenClaims, TokenError, TokenVerifier};
use crate::capability::CapabilitySet;
use crate::registry::ArmCapability;
use crate::task::{PlanStep, TaskId};

#[derive(Debug, Clone)]
struct Issued {
    task_id: TaskId,
    remaining: u32,
    expires_at: DateTime<Utc>,
}

/// Mints scoped tokens and tracks their use.
///
/// # Invariants
/// - Every live token id is in `issued` until it is revoked or pruned
/// - A revoked id is never redeemable again
pub struct TokenIssuer {
    key: EncodingKey,
    verifier: TokenVerifier,
    ttl: Duration,
    max_uses: u32,
    issued: HashMap<String, Issued>,
    revoked: HashMap<String, DateTime<Utc>>,
}

impl TokenIssuer {
    /// # Preconditions
    /// - `secret` is non-empty
    /// - `max_uses >= 1`
    pub fn new(secret: &str, ttl: Duration, max_uses: u32) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
            verifier: TokenVerifier::new(secret),
            ttl,
            max_uses: max_uses.max(1),
            issued: HashMap::new(),
            revoked: HashMap::new(),
        }
    }

    /// A verifier sharing this issuer's secret.
    pub fn verifier(&self) -> TokenVerifier {
        self.verifier.clone()
    }

    /// Number of live (unrevoked, unexpired when last pruned) tokens.
    pub fn live_tokens(&self) -> usize {
        self.issued.len()
    }

    /// Mint a token for `step` on `arm`.
    ///
    /// The granted set is exactly the step's requirements; a wildcard
    /// declaration on the arm is never copied into the token.
    ///
    /// # Errors
    /// `ArmLacksCapability` if the arm's declared set does not cover the
    /// requirements. Rejection is unconditional.
    pub fn issue(
        &mut self,
        task_id: TaskId,
        step: &PlanStep,
        arm: &ArmCapability,
    ) -> Result<CapabilityToken, TokenError> {
        let required = step
            .required_capabilities()
            .map_err(|e| TokenError::InvalidAction(e.to_string()))?;
        self.issue_for(task_id, step.step, required, arm)
    }

    /// Mint a token granting `required` on `arm`.
    pub fn issue_for(
        &mut self,
        task_id: TaskId,
        step: u32,
        required: CapabilitySet,
        arm: &ArmCapability,
    ) -> Result<CapabilityToken, TokenError> {
        let missing = arm.capabilities.uncovered(&required);
        if !missing.is_empty() {
            return Err(TokenError::ArmLacksCapability {
                arm_id: arm.arm_id.clone(),
                missing,
            });
        }

        let now = Utc::now();
        self.prune(now);
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let mut token = CapabilityToken {
            id: Uuid::new_v4().to_string(),
            issued_to: arm.arm_id.clone(),
            task_id,
            step,
            granted: required,
            issued_at: now,
            expires_at: now + ttl,
            max_uses: self.max_uses,
            signature: String::new(),
        };
        token.signature = jsonwebtoken::encode(
            &Header::default(),
            &TokenClaims::from_token(&token),
            &self.key,
        )
        .map_err(|e| TokenError::Encoding(e.to_string()))?;

        self.issued.insert(
            token.id.clone(),
            Issued {
                task_id,
                remaining: token.max_uses,
                expires_at: token.expires_at,
            },
        );
        debug!(
            token_id = %token.id,
            arm_id = %token.issued_to,
            step,
            granted = %token.granted,
            "Issued capability token"
        );
        Ok(token)
    }

    /// Verify and consume one use.
    ///
    /// # Errors
    /// Anything [`TokenVerifier::verify_for_arm`] rejects, plus `Revoked`,
    /// `UnknownToken`, and `UsesExhausted`.
    pub fn redeem(
        &mut self,
        token: &CapabilityToken,
        arm_id: &str,
        required: &CapabilitySet,
    ) -> Result<(), TokenError> {
        if self.revoked.contains_key(&token.id) {
            return Err(TokenError::Revoked(token.id.clone()));
        }
        self.verifier.verify_for_arm(token, arm_id, required)?;
        let entry = self
            .issued
            .get_mut(&token.id)
            .ok_or_else(|| TokenError::UnknownToken(token.id.clone()))?;
        if entry.remaining == 0 {
            return Err(TokenError::UsesExhausted(token.id.clone()));
        }
        entry.remaining -= 1;
        Ok(())
    }

    /// Revoke one token. Returns whether it was live.
    pub fn revoke(&mut self, token_id: &str) -> bool {
        match self.issued.remove(token_id) {
            Some(issued) => {
                self.revoked.insert(token_id.to_string(), issued.expires_at);
                true
            }
            None => false,
        }
    }

    /// Revoke every token of a task. Returns how many were revoked.
    pub fn revoke_task(&mut self, task_id: TaskId) -> usize {
        let ids: Vec<String> = self
            .issued
            .iter()
            .filter(|(_, issued)| issued.task_id == task_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.revoke(id);
        }
        if !ids.is_empty() {
            debug!(%task_id, count = ids.len(), "Revoked task tokens");
        }
        ids.len()
    }

    /// Drop bookkeeping for tokens that can no longer verify anyway.
    fn prune(&mut self, now: DateTime<Utc>) {
        self.issued.retain(|_, issued| issued.expires_at > now);
        self.revoked.retain(|_, expires_at| *expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::registry::ArmHealth;
    use crate::task::Action;

    const SECRET: &str = "test-secret";

    fn arm(id: &str, caps: &[&str]) -> ArmCapability {
        ArmCapability::new(id, CapabilitySet::parse(caps).unwrap(), 1, 2)
    }

    fn read_step() -> PlanStep {
        PlanStep::new(1, Action::ReadFile { path: "notes.txt".into() })
    }

    fn write_step() -> PlanStep {
        PlanStep::new(2, Action::WriteFile { path: "out.txt".into(), contents: "x".into() })
    }

    fn caps(items: &[&str]) -> CapabilitySet {
        CapabilitySet::parse(items).unwrap()
    }

    #[test]
    fn test_granted_set_is_minimal() {
        let mut issuer = TokenIssuer::new(SECRET, Duration::from_secs(60), 1);
        let broad = arm("worker", &["fs:read", "fs:write", "process:exec", "net:*"]);
        let step = read_step().with_capability(Capability::skill("summarize"));
        let broad = ArmCapability {
            capabilities: broad.capabilities.union(&caps(&["skill:summarize"])),
            ..broad
        };
        let token = issuer.issue(TaskId::new(), &step, &broad).unwrap();
        assert_eq!(token.granted, caps(&["fs:read", "skill:summarize"]));
        assert!(broad.capabilities.covers(&token.granted));
    }

    #[test]
    fn test_wildcard_declaration_narrowed_to_host() {
        let mut issuer = TokenIssuer::new(SECRET, Duration::from_secs(60), 1);
        let fetcher = arm("fetcher", &["net:*.example.com"]);
        let step = PlanStep::new(1, Action::HttpGet { url: "https://api.example.com/x".into() });
        let token = issuer.issue(TaskId::new(), &step, &fetcher).unwrap();
        assert_eq!(token.granted, caps(&["net:api.example.com"]));
    }

    #[test]
    fn test_issue_rejects_arm_without_capability() {
        let mut issuer = TokenIssuer::new(SECRET, Duration::from_secs(60), 1);
        let reader = arm("reader", &["fs:read"]);
        let err = issuer.issue(TaskId::new(), &write_step(), &reader).unwrap_err();
        assert_eq!(
            err,
            TokenError::ArmLacksCapability {
                arm_id: "reader".into(),
                missing: caps(&["fs:write"])
            }
        );
        assert_eq!(issuer.live_tokens(), 0);
    }

    #[test]
    fn test_read_token_cannot_authorize_write() {
        let mut issuer = TokenIssuer::new(SECRET, Duration::from_secs(60), 1);
        let token = issuer
            .issue(TaskId::new(), &read_step(), &arm("rw", &["fs:read", "fs:write"]))
            .unwrap();
        let verifier = issuer.verifier();
        assert!(verifier.verify(&token, &caps(&["fs:read"])).is_ok());
        assert_eq!(
            verifier.verify(&token, &caps(&["fs:write"])),
            Err(TokenError::ScopeInsufficient { missing: caps(&["fs:write"]) })
        );
    }

    #[test]
    fn test_widened_token_detected() {
        let mut issuer = TokenIssuer::new(SECRET, Duration::from_secs(60), 1);
        let mut token = issuer
            .issue(TaskId::new(), &read_step(), &arm("rw", &["fs:read", "fs:write"]))
            .unwrap();
        token.granted.insert(Capability::FsWrite);
        assert_eq!(
            issuer.verifier().verify(&token, &caps(&["fs:write"])),
            Err(TokenError::Tampered)
        );
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let mut issuer = TokenIssuer::new(SECRET, Duration::from_secs(60), 1);
        let token = issuer.issue(TaskId::new(), &read_step(), &arm("r", &["fs:read"])).unwrap();
        let other = TokenVerifier::new("another-secret");
        assert!(matches!(
            other.verify(&token, &caps(&["fs:read"])),
            Err(TokenError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut issuer = TokenIssuer::new(SECRET, Duration::ZERO, 1);
        let token = issuer.issue(TaskId::new(), &read_step(), &arm("r", &["fs:read"])).unwrap();
        assert_eq!(
            issuer.verifier().verify(&token, &caps(&["fs:read"])),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn test_use_ceiling_and_revocation() {
        let mut issuer = TokenIssuer::new(SECRET, Duration::from_secs(60), 1);
        let task = TaskId::new();
        let required = caps(&["fs:read"]);
        let token = issuer.issue(task, &read_step(), &arm("r", &["fs:read"])).unwrap();
        assert_eq!(
            issuer.redeem(&token, "impostor", &required),
            Err(TokenError::WrongArm { issued_to: "r".into(), presented_by: "impostor".into() })
        );
        assert!(issuer.redeem(&token, "r", &required).is_ok());
        assert_eq!(
            issuer.redeem(&token, "r", &required),
            Err(TokenError::UsesExhausted(token.id.clone()))
        );

        let second = issuer.issue(task, &read_step(), &arm("r", &["fs:read"])).unwrap();
        assert_eq!(issuer.revoke_task(task), 2);
        assert_eq!(
            issuer.redeem(&second, "r", &required),
            Err(TokenError::Revoked(second.id.clone()))
        );
    }

    #[test]
    fn test_unreachable_arm_still_checked_by_scope_only() {
        let mut issuer = TokenIssuer::new(SECRET, Duration::from_secs(60), 1);
        let mut down = arm("r", &["fs:read"]);
        down.health = ArmHealth::Unreachable;
        assert!(issuer.issue(TaskId::new(), &read_step(), &down).is_ok());
    }
}
