//! Capability registry - arms, their declared capability sets, concurrency
//! ceilings, and health.

mod arm;
mod health;
mod manifest;
mod registry;

pub use arm::{Arm, ArmCapability};
pub use health::{ArmHealth, ArmHealthSnapshot, BackoffConfig, HealthState};
pub use manifest::{ArmDeclaration, ArmManifest};
pub use registry::{ArmMatch, CapabilityRegistry, HealthUpdate, RegistryError};
