//! YAML manifest of remotely reachable arms.
//!
//! ```yaml
//! arms:
//!   - arm_id: coder
//!     name: Coder
//!     capabilities: [skill:code_generation, fs:read, fs:write]
//!     cost_tier: 2
//!     max_concurrent: 4
//!     endpoint: http://localhost:8101
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::arm::ArmCapability;
use super::registry::RegistryError;

/// One arm entry: its declaration plus where to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmDeclaration {
    #[serde(flatten)]
    pub capability: ArmCapability,
    /// Base URL of the arm's HTTP interface
    pub endpoint: String,
}

/// Parsed manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmManifest {
    #[serde(default)]
    pub arms: Vec<ArmDeclaration>,
}

impl ArmManifest {
    pub fn parse(yaml: &str) -> Result<Self, RegistryError> {
        let manifest: Self =
            serde_yaml::from_str(yaml).map_err(|e| RegistryError::Manifest(e.to_string()))?;
        for decl in &manifest.arms {
            url::Url::parse(&decl.endpoint).map_err(|e| {
                RegistryError::Manifest(format!(
                    "arm '{}' has invalid endpoint '{}': {}",
                    decl.capability.arm_id, decl.endpoint, e
                ))
            })?;
        }
        Ok(manifest)
    }

    pub async fn load(path: &Path) -> Result<Self, RegistryError> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RegistryError::Manifest(format!("{}: {}", path.display(), e)))?;
        Self::parse(&yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySet;
    use crate::registry::ArmHealth;

    #[test]
    fn test_parse_manifest() {
        let manifest = ArmManifest::parse(
            r#"
arms:
  - arm_id: coder
    name: Coder
    capabilities: ["skill:code_generation", "fs:read"]
    cost_tier: 2
    max_concurrent: 4
    endpoint: http://localhost:8101
  - arm_id: fetcher
    capabilities: ["net:*.example.com"]
    endpoint: http://localhost:8102
"#,
        )
        .unwrap();
        assert_eq!(manifest.arms.len(), 2);
        let coder = &manifest.arms[0].capability;
        assert_eq!(coder.cost_tier, 2);
        assert_eq!(
            coder.capabilities,
            CapabilitySet::parse(["skill:code_generation", "fs:read"]).unwrap()
        );
        let fetcher = &manifest.arms[1].capability;
        assert_eq!(fetcher.cost_tier, 1);
        assert_eq!(fetcher.max_concurrent, 1);
        assert_eq!(fetcher.health, ArmHealth::Healthy);
    }

    #[test]
    fn test_bad_manifest_rejected() {
        assert!(matches!(
            ArmManifest::parse("arms:\n  - arm_id: x\n    capabilities: [\"bogus:thing\"]\n    endpoint: http://h\n"),
            Err(RegistryError::Manifest(_))
        ));
        assert!(matches!(
            ArmManifest::parse("arms:\n  - arm_id: x\n    capabilities: []\n    endpoint: not a url\n"),
            Err(RegistryError::Manifest(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arms.yaml");
        tokio::fs::write(&path, "arms: []\n").await.unwrap();
        assert!(ArmManifest::load(&path).await.unwrap().arms.is_empty());
        assert!(ArmManifest::load(&dir.path().join("missing.yaml")).await.is_err());
    }
}
