//! Action descriptors and the capability requirements they imply.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::subtask::AttemptContext;
use super::task::TaskId;
use crate::capability::{Capability, CapabilitySet};
use crate::memory::PriorResult;
use crate::sandbox::ResourceLimits;

/// What a subtask asks its arm to do.
///
/// `Invoke` is forwarded to the arm untouched. Every other variant is an
/// untrusted operation and runs in the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Arm-defined operation with an opaque payload
    Invoke {
        operation: String,
        #[serde(default)]
        payload: Value,
    },
    /// Spawn a program inside the sandbox.
    ///
    /// The process runs with the host user's file permissions, so it is
    /// granted both filesystem classes in addition to `process:exec`.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Read a file relative to the sandbox root
    ReadFile { path: String },
    /// Write a file relative to the sandbox root
    WriteFile { path: String, contents: String },
    /// Fetch a URL
    HttpGet { url: String },
}

/// Error deriving requirements from an action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("Invalid URL '{0}': {1}")]
    InvalidUrl(String, String),

    #[error("URL '{0}' has no host")]
    MissingHost(String),

    #[error("Action field '{0}' must not be empty")]
    EmptyField(&'static str),
}

impl Action {
    /// Capabilities needed to perform this action.
    ///
    /// # Property
    /// Reads never require `fs:write`, writes never require `fs:read`.
    /// Commands require `process:exec`, `fs:read` and `fs:write`.
    pub fn required_capabilities(&self) -> Result<CapabilitySet, ActionError> {
        let mut caps = CapabilitySet::new();
        match self {
            Action::Invoke { operation, .. } => {
                if operation.trim().is_empty() {
                    return Err(ActionError::EmptyField("operation"));
                }
            }
            Action::Command { program, .. } => {
                if program.trim().is_empty() {
                    return Err(ActionError::EmptyField("program"));
                }
                caps.insert(Capability::ProcessExec);
                caps.insert(Capability::FsRead);
                caps.insert(Capability::FsWrite);
            }
            Action::ReadFile { path } => {
                if path.trim().is_empty() {
                    return Err(ActionError::EmptyField("path"));
                }
                caps.insert(Capability::FsRead);
            }
            Action::WriteFile { path, .. } => {
                if path.trim().is_empty() {
                    return Err(ActionError::EmptyField("path"));
                }
                caps.insert(Capability::FsWrite);
            }
            Action::HttpGet { url } => {
                caps.insert(Capability::network(http_host(url)?));
            }
        }
        Ok(caps)
    }

    /// Whether this action must go through the sandboxed executor.
    pub fn requires_sandbox(&self) -> bool {
        !matches!(self, Action::Invoke { .. })
    }

    /// SHA-256 of the canonical JSON encoding, hex-encoded.
    pub fn digest(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        match self {
            Action::Invoke { operation, .. } => format!("invoke:{}", operation),
            Action::Command { program, .. } => format!("command:{}", program),
            Action::ReadFile { path } => format!("read_file:{}", path),
            Action::WriteFile { path, .. } => format!("write_file:{}", path),
            Action::HttpGet { url } => format!("http_get:{}", url),
        }
    }
}

/// Lowercased host of an http(s) URL.
pub fn http_host(raw: &str) -> Result<String, ActionError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ActionError::InvalidUrl(raw.to_string(), e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ActionError::InvalidUrl(
            raw.to_string(),
            format!("unsupported scheme '{}'", parsed.scheme()),
        ));
    }
    parsed
        .host_str()
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| ActionError::MissingHost(raw.to_string()))
}

/// Everything an arm receives for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task_id: TaskId,
    pub step: u32,
    pub attempt: u32,
    pub action: Action,
    /// Feedback from earlier failed attempts of this step
    pub attempt_context: AttemptContext,
    /// Recalled results of similar earlier work
    #[serde(default)]
    pub prior_results: Vec<PriorResult>,
    pub limits: ResourceLimits,
}
