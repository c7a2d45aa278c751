//! Arm declarations and the black-box worker interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::health::ArmHealth;
use crate::capability::CapabilitySet;
use crate::sandbox::ExecutionError;
use crate::task::{DispatchRequest, ExecutionResult};
use crate::token::CapabilityToken;

fn default_cost_tier() -> u8 {
    1
}

fn default_max_concurrent() -> u32 {
    1
}

/// What an arm declares about itself.
///
/// # Invariants
/// - `arm_id` is unique within a registry
/// - `max_concurrent >= 1` once registered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmCapability {
    pub arm_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared capability set; fixed for the arm's lifetime
    pub capabilities: CapabilitySet,

    /// Relative expense, 1 (cheap) to 5
    #[serde(default = "default_cost_tier")]
    pub cost_tier: u8,

    /// Per-arm in-flight dispatch ceiling
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    #[serde(default)]
    pub health: ArmHealth,
}

impl ArmCapability {
    pub fn new(
        arm_id: impl Into<String>,
        capabilities: CapabilitySet,
        cost_tier: u8,
        max_concurrent: u32,
    ) -> Self {
        let arm_id = arm_id.into();
        Self {
            name: arm_id.clone(),
            arm_id,
            description: None,
            capabilities,
            cost_tier,
            max_concurrent,
            health: ArmHealth::Healthy,
        }
    }
}

/// A specialist worker.
///
/// Arms receive the scoped token with every request and must present it to
/// anything that enforces capabilities on their behalf.
#[async_trait]
pub trait Arm: Send + Sync {
    /// Perform an `invoke` action.
    async fn invoke(
        &self,
        token: &CapabilityToken,
        request: &DispatchRequest,
    ) -> Result<ExecutionResult, ExecutionError>;

    /// Current health as seen by the arm.
    async fn health(&self) -> ArmHealth;
}
