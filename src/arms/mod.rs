//! Concrete arm clients.

mod http;

use std::sync::Arc;

pub use http::HttpArm;

use crate::registry::{ArmManifest, CapabilityRegistry, RegistryError};

/// Register every arm in `manifest` as an [`HttpArm`].
///
/// Returns the number of arms registered. Stops at the first rejected
/// declaration; arms registered before it stay registered.
pub fn register_manifest(
    registry: &mut CapabilityRegistry,
    manifest: &ArmManifest,
) -> Result<usize, RegistryError> {
    for decl in &manifest.arms {
        let arm = HttpArm::new(&decl.endpoint)
            .map_err(|e| RegistryError::Manifest(format!("arm '{}': {}", decl.capability.arm_id, e)))?;
        registry.register(decl.capability.clone(), Arc::new(arm))?;
    }
    Ok(manifest.arms.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_manifest() {
        let manifest = ArmManifest::parse(
            r#"
arms:
  - arm_id: coder
    capabilities: ["skill:code_generation"]
    endpoint: http://localhost:8101
  - arm_id: fetcher
    capabilities: ["net:*.example.com"]
    max_concurrent: 2
    endpoint: http://localhost:8102/fetcher
"#,
        )
        .unwrap();
        let mut registry = CapabilityRegistry::new(3);
        assert_eq!(register_manifest(&mut registry, &manifest).unwrap(), 2);
        assert!(registry.contains("coder"));
        assert_eq!(registry.get("fetcher").unwrap().max_concurrent, 2);

        assert!(matches!(
            register_manifest(&mut registry, &manifest),
            Err(RegistryError::DuplicateArm(id)) if id == "coder"
        ));
    }
}
