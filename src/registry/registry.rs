//! Capability registry - which arms exist, what they can do, and how busy
//! and healthy they are.
//!
//! Owned by the scheduler; every method takes `&mut self` or `&self` and no
//! lock is involved.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::arm::{Arm, ArmCapability};
use super::health::{ArmHealth, ArmHealthSnapshot, BackoffConfig, HealthState};
use crate::capability::CapabilitySet;

struct RegisteredArm {
    capability: ArmCapability,
    handle: Arc<dyn Arm>,
    in_flight: u32,
    health: HealthState,
}

impl RegisteredArm {
    fn free_slots(&self) -> u32 {
        self.capability.max_concurrent.saturating_sub(self.in_flight)
    }
}

/// One candidate arm for a requirement set, with the facts used to rank it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArmMatch {
    pub arm_id: String,
    /// Every requirement is declared literally (no wildcard coverage)
    pub exact: bool,
    pub cost_tier: u8,
    pub health: ArmHealth,
    pub in_cooldown: bool,
    pub free_slots: u32,
}

impl ArmMatch {
    fn health_rank(&self) -> u8 {
        let base = match self.health {
            ArmHealth::Healthy => 0,
            ArmHealth::Degraded => 1,
            ArmHealth::Unreachable => 2,
        };
        base + self.in_cooldown as u8
    }

    fn sort_key(&self) -> (bool, u8, u8, Reverse<u32>, &str) {
        (
            !self.exact,
            self.cost_tier,
            self.health_rank(),
            Reverse(self.free_slots),
            self.arm_id.as_str(),
        )
    }
}

/// Outcome of a health check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthUpdate {
    Recorded,
    /// Threshold of consecutive unreachable checks hit; arm removed
    Deregistered,
}

/// Errors that can occur in registry operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("Arm '{0}' is already registered")]
    DuplicateArm(String),

    #[error("Arm '{0}' declares a concurrency ceiling of zero")]
    ZeroConcurrency(String),

    #[error("Arm '{arm_id}' has cost tier {tier}, expected 1-5")]
    InvalidCostTier { arm_id: String, tier: u8 },

    #[error("Arm '{0}' is not registered")]
    UnknownArm(String),

    #[error("No available arm declares {required}")]
    NoMatch { required: CapabilitySet },

    #[error("Arm '{0}' has no free dispatch slot")]
    Saturated(String),

    #[error("Invalid arm manifest: {0}")]
    Manifest(String),
}

/// Registry of arms keyed by id.
pub struct CapabilityRegistry {
    arms: BTreeMap<String, RegisteredArm>,
    backoff: BackoffConfig,
    failure_threshold: u32,
}

impl CapabilityRegistry {
    /// # Preconditions
    /// `failure_threshold >= 1`
    pub fn new(failure_threshold: u32) -> Self {
        Self::with_backoff(failure_threshold, BackoffConfig::default())
    }

    pub fn with_backoff(failure_threshold: u32, backoff: BackoffConfig) -> Self {
        Self {
            arms: BTreeMap::new(),
            backoff,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Register an arm.
    ///
    /// # Errors
    /// `DuplicateArm`, `ZeroConcurrency`, or `InvalidCostTier`.
    pub fn register(
        &mut self,
        capability: ArmCapability,
        handle: Arc<dyn Arm>,
    ) -> Result<(), RegistryError> {
        if self.arms.contains_key(&capability.arm_id) {
            return Err(RegistryError::DuplicateArm(capability.arm_id));
        }
        if capability.max_concurrent == 0 {
            return Err(RegistryError::ZeroConcurrency(capability.arm_id));
        }
        if !(1..=5).contains(&capability.cost_tier) {
            return Err(RegistryError::InvalidCostTier {
                arm_id: capability.arm_id,
                tier: capability.cost_tier,
            });
        }
        info!(
            arm_id = %capability.arm_id,
            capabilities = %capability.capabilities,
            cost_tier = capability.cost_tier,
            max_concurrent = capability.max_concurrent,
            "Registered arm"
        );
        self.arms.insert(
            capability.arm_id.clone(),
            RegisteredArm {
                capability,
                handle,
                in_flight: 0,
                health: HealthState::default(),
            },
        );
        Ok(())
    }

    /// Remove an arm. In-flight dispatches finish; nothing new is routed to it.
    pub fn deregister(&mut self, arm_id: &str) -> Option<ArmCapability> {
        let removed = self.arms.remove(arm_id).map(|arm| arm.capability);
        if removed.is_some() {
            info!(arm_id, "Deregistered arm");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.arms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }

    pub fn contains(&self, arm_id: &str) -> bool {
        self.arms.contains_key(arm_id)
    }

    pub fn get(&self, arm_id: &str) -> Option<&ArmCapability> {
        self.arms.get(arm_id).map(|arm| &arm.capability)
    }

    pub fn handle(&self, arm_id: &str) -> Option<Arc<dyn Arm>> {
        self.arms.get(arm_id).map(|arm| Arc::clone(&arm.handle))
    }

    /// Every registered arm with its handle, for health polling.
    pub fn handles(&self) -> Vec<(String, Arc<dyn Arm>)> {
        self.arms
            .iter()
            .map(|(id, arm)| (id.clone(), Arc::clone(&arm.handle)))
            .collect()
    }

    /// Ranked candidates for a requirement set.
    ///
    /// Order: exact match before wildcard coverage, lowest cost tier, best
    /// health (healthy and not cooling down first), most free slots, arm id.
    /// Unreachable arms never match.
    pub fn match_capabilities(&self, required: &CapabilitySet) -> Vec<ArmMatch> {
        let mut matches: Vec<ArmMatch> = self
            .arms
            .values()
            .filter(|arm| arm.capability.health != ArmHealth::Unreachable)
            .filter(|arm| arm.capability.capabilities.covers(required))
            .map(|arm| ArmMatch {
                arm_id: arm.capability.arm_id.clone(),
                exact: arm.capability.capabilities.contains_all(required),
                cost_tier: arm.capability.cost_tier,
                health: arm.capability.health,
                in_cooldown: arm.health.is_in_cooldown(),
                free_slots: arm.free_slots(),
            })
            .collect();
        matches.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        matches
    }

    /// Best candidate with a free slot.
    ///
    /// # Errors
    /// `NoMatch` when no arm can serve `required` at all.
    ///
    /// Returns `Ok(None)` when candidates exist but all are saturated.
    pub fn select(&self, required: &CapabilitySet) -> Result<Option<String>, RegistryError> {
        let matches = self.match_capabilities(required);
        if matches.is_empty() {
            return Err(RegistryError::NoMatch {
                required: required.clone(),
            });
        }
        Ok(matches
            .into_iter()
            .find(|m| m.free_slots > 0)
            .map(|m| m.arm_id))
    }

    /// Take a dispatch slot.
    pub fn acquire(&mut self, arm_id: &str) -> Result<(), RegistryError> {
        let arm = self
            .arms
            .get_mut(arm_id)
            .ok_or_else(|| RegistryError::UnknownArm(arm_id.to_string()))?;
        if arm.free_slots() == 0 {
            return Err(RegistryError::Saturated(arm_id.to_string()));
        }
        arm.in_flight += 1;
        Ok(())
    }

    /// Return a dispatch slot. Releasing for a deregistered arm is a no-op.
    pub fn release(&mut self, arm_id: &str) {
        if let Some(arm) = self.arms.get_mut(arm_id) {
            arm.in_flight = arm.in_flight.saturating_sub(1);
        }
    }

    pub fn in_flight(&self, arm_id: &str) -> u32 {
        self.arms.get(arm_id).map_or(0, |arm| arm.in_flight)
    }

    pub fn record_dispatch_success(&mut self, arm_id: &str, latency_ms: u64) {
        if let Some(arm) = self.arms.get_mut(arm_id) {
            arm.health.record_success(latency_ms);
        }
    }

    /// Record a dispatch failure and put the arm in cooldown.
    pub fn record_dispatch_failure(&mut self, arm_id: &str, reason: &str) {
        if let Some(arm) = self.arms.get_mut(arm_id) {
            let cooldown = arm.health.record_failure(reason, &self.backoff);
            warn!(
                arm_id,
                consecutive_failures = arm.health.consecutive_failures,
                cooldown_secs = cooldown.as_secs_f64(),
                "Arm placed in cooldown"
            );
        }
    }

    /// Apply a health check result.
    ///
    /// After `failure_threshold` consecutive unreachable checks the arm is
    /// deregistered.
    pub fn record_health(
        &mut self,
        arm_id: &str,
        health: ArmHealth,
    ) -> Result<HealthUpdate, RegistryError> {
        let threshold = self.failure_threshold;
        let arm = self
            .arms
            .get_mut(arm_id)
            .ok_or_else(|| RegistryError::UnknownArm(arm_id.to_string()))?;
        if health == ArmHealth::Unreachable {
            arm.health.consecutive_unreachable += 1;
        } else {
            arm.health.consecutive_unreachable = 0;
        }
        if arm.capability.health != health {
            info!(arm_id, from = %arm.capability.health, to = %health, "Arm health changed");
        }
        arm.capability.health = health;

        if arm.health.consecutive_unreachable >= threshold {
            warn!(
                arm_id,
                checks = arm.health.consecutive_unreachable,
                "Arm unreachable for too many consecutive checks"
            );
            self.deregister(arm_id);
            return Ok(HealthUpdate::Deregistered);
        }
        Ok(HealthUpdate::Recorded)
    }

    pub fn snapshot(&self) -> Vec<ArmHealthSnapshot> {
        self.arms
            .values()
            .map(|arm| ArmHealthSnapshot {
                arm_id: arm.capability.arm_id.clone(),
                health: arm.capability.health,
                in_flight: arm.in_flight,
                max_concurrent: arm.capability.max_concurrent,
                cooldown_remaining_secs: arm.health.remaining_cooldown().map(|d| d.as_secs_f64()),
                consecutive_failures: arm.health.consecutive_failures,
                consecutive_unreachable: arm.health.consecutive_unreachable,
                last_failure_reason: arm.health.last_failure_reason.clone(),
                total_dispatches: arm.health.total_dispatches,
                total_successes: arm.health.total_successes,
                avg_latency_ms: arm.health.avg_latency_ms(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExecutionError;
    use crate::task::{DispatchRequest, ExecutionResult};
    use crate::token::CapabilityToken;
    use async_trait::async_trait;

    struct NullArm;

    #[async_trait]
    impl Arm for NullArm {
        async fn invoke(
            &self,
            _token: &CapabilityToken,
            _request: &DispatchRequest,
        ) -> Result<ExecutionResult, ExecutionError> {
            Err(ExecutionError::Failure("not used".into()))
        }

        async fn health(&self) -> ArmHealth {
            ArmHealth::Healthy
        }
    }

    fn caps(items: &[&str]) -> CapabilitySet {
        CapabilitySet::parse(items).unwrap()
    }

    fn register(registry: &mut CapabilityRegistry, id: &str, declared: &[&str], tier: u8, slots: u32) {
        registry
            .register(ArmCapability::new(id, caps(declared), tier, slots), Arc::new(NullArm))
            .unwrap();
    }

    fn ids(matches: &[ArmMatch]) -> Vec<&str> {
        matches.iter().map(|m| m.arm_id.as_str()).collect()
    }

    #[test]
    fn test_register_rejects_duplicates_and_zero_concurrency() {
        let mut registry = CapabilityRegistry::new(3);
        register(&mut registry, "a", &["fs:read"], 1, 1);
        assert_eq!(
            registry.register(ArmCapability::new("a", caps(&["fs:read"]), 1, 1), Arc::new(NullArm)),
            Err(RegistryError::DuplicateArm("a".into()))
        );
        assert_eq!(
            registry.register(ArmCapability::new("b", caps(&["fs:read"]), 1, 0), Arc::new(NullArm)),
            Err(RegistryError::ZeroConcurrency("b".into()))
        );
    }

    #[test]
    fn test_ranking_exact_then_cost_then_id() {
        let mut registry = CapabilityRegistry::new(3);
        register(&mut registry, "wild-cheap", &["net:*"], 1, 1);
        register(&mut registry, "exact-pricey", &["net:api.example.com"], 3, 1);
        register(&mut registry, "exact-cheap-b", &["net:api.example.com"], 2, 1);
        register(&mut registry, "exact-cheap-a", &["net:api.example.com", "fs:read"], 2, 1);
        register(&mut registry, "unrelated", &["fs:write"], 1, 1);

        let matches = registry.match_capabilities(&caps(&["net:api.example.com"]));
        assert_eq!(
            ids(&matches),
            vec!["exact-cheap-a", "exact-cheap-b", "exact-pricey", "wild-cheap"]
        );
        assert!(!matches[3].exact);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_and_free_slots_break_ties() {
        let mut registry = CapabilityRegistry::new(3);
        register(&mut registry, "a", &["fs:read"], 1, 1);
        register(&mut registry, "b", &["fs:read"], 1, 4);
        // More free slots wins among equals
        assert_eq!(registry.select(&caps(&["fs:read"])).unwrap().as_deref(), Some("b"));
        registry.record_dispatch_failure("b", "exit 1");
        assert_eq!(registry.select(&caps(&["fs:read"])).unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn test_select_distinguishes_unavailable_from_saturated() {
        let mut registry = CapabilityRegistry::new(3);
        register(&mut registry, "a", &["fs:read"], 1, 1);
        assert_eq!(
            registry.select(&caps(&["fs:write"])),
            Err(RegistryError::NoMatch { required: caps(&["fs:write"]) })
        );
        registry.acquire("a").unwrap();
        assert_eq!(registry.select(&caps(&["fs:read"])), Ok(None));
        assert_eq!(registry.acquire("a"), Err(RegistryError::Saturated("a".into())));
        registry.release("a");
        assert_eq!(registry.select(&caps(&["fs:read"])), Ok(Some("a".to_string())));
    }

    #[test]
    fn test_unreachable_arms_never_match_and_get_deregistered() {
        let mut registry = CapabilityRegistry::new(2);
        register(&mut registry, "a", &["fs:read"], 1, 1);
        assert_eq!(registry.record_health("a", ArmHealth::Unreachable), Ok(HealthUpdate::Recorded));
        assert!(registry.match_capabilities(&caps(&["fs:read"])).is_empty());
        assert_eq!(registry.record_health("a", ArmHealth::Healthy), Ok(HealthUpdate::Recorded));
        assert_eq!(registry.match_capabilities(&caps(&["fs:read"])).len(), 1);
        registry.record_health("a", ArmHealth::Unreachable).unwrap();
        assert_eq!(
            registry.record_health("a", ArmHealth::Unreachable),
            Ok(HealthUpdate::Deregistered)
        );
        assert!(!registry.contains("a"));
    }

    #[test]
    fn test_degraded_ranks_below_healthy() {
        let mut registry = CapabilityRegistry::new(3);
        register(&mut registry, "a", &["fs:read"], 1, 1);
        register(&mut registry, "b", &["fs:read"], 1, 1);
        registry.record_health("a", ArmHealth::Degraded).unwrap();
        assert_eq!(ids(&registry.match_capabilities(&caps(&["fs:read"]))), vec!["b", "a"]);
    }
}
