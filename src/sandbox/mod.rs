//! Sandboxed executor - runs untrusted actions under a verified token.
//!
//! Default deny: before anything runs, the presented token is re-verified
//! (signature, expiry, scope) against the capabilities the action needs,
//! independent of whatever the registry and issuer decided upstream.
//!
//! # Isolation
//! - Commands: own process group, cleared environment, working directory
//!   pinned to the sandbox root, optional address-space and CPU rlimits.
//!   A process keeps the host user's file permissions, so a command token
//!   must also grant `fs:read` and `fs:write`
//! - Files: relative paths under the sandbox root only
//! - Network: GET to the granted host, redirects disabled
//! - Every action: wall-clock limit and captured-output cap

mod fs;
mod net;
mod process;

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::error::FailureKind;
use crate::task::{Action, ExecutionResult, Provenance};
use crate::token::{CapabilityToken, TokenError, TokenVerifier};

/// Resource ceilings for one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub wall_clock: Duration,
    pub max_output_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_secs: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_secs(30),
            max_output_bytes: 1024 * 1024,
            max_memory_bytes: None,
            max_cpu_secs: None,
        }
    }
}

impl ResourceLimits {
    pub fn with_wall_clock(mut self, wall_clock: Duration) -> Self {
        self.wall_clock = wall_clock;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

/// Why an execution attempt did not produce a result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Execution timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Execution failed: {0}")]
    Failure(String),

    #[error("Capability violation: {0}")]
    CapabilityViolation(#[from] TokenError),

    #[error("Path '{0}' escapes the sandbox root")]
    PathEscape(String),

    #[error("Execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } => FailureKind::ExecutionTimeout,
            Self::Failure(_) => FailureKind::ExecutionFailure,
            Self::CapabilityViolation(_) | Self::PathEscape(_) => FailureKind::CapabilityViolation,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }

    /// The message without the kind prefix, for attempt records that
    /// already carry the kind.
    pub fn detail(&self) -> String {
        match self {
            Self::Failure(message) => message.clone(),
            Self::Timeout { after } => format!("no result within {:?}", after),
            Self::CapabilityViolation(e) => e.to_string(),
            Self::PathEscape(path) => format!("path '{}' escapes the sandbox root", path),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Runs authorized actions as isolated units.
pub struct SandboxExecutor {
    config: SandboxConfig,
    verifier: TokenVerifier,
    client: reqwest::Client,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig, verifier: TokenVerifier) -> Self {
        Self {
            config,
            verifier,
            client: net::build_client(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Run `action` under `token`.
    ///
    /// # Errors
    /// - `CapabilityViolation` if the token does not verify or does not
    ///   cover the action; nothing is executed
    /// - `PathEscape` for file paths outside the root; nothing is touched
    /// - `Timeout` when the wall clock runs out (the process group is killed)
    /// - `Cancelled` when `cancel` fires first
    /// - `Failure` for anything else that prevents a result
    pub async fn run(
        &self,
        token: &CapabilityToken,
        action: &Action,
        limits: &ResourceLimits,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        if !action.requires_sandbox() {
            return Err(not_sandboxed(action));
        }
        let required = action
            .required_capabilities()
            .map_err(|e| ExecutionError::Failure(e.to_string()))?;
        if let Err(e) = self.verifier.verify(token, &required) {
            warn!(token_id = %token.id, action = %action.label(), error = %e, "Rejected token at sandbox boundary");
            return Err(ExecutionError::CapabilityViolation(e));
        }

        tokio::fs::create_dir_all(&self.config.root)
            .await
            .map_err(|e| ExecutionError::Failure(format!("cannot prepare sandbox root: {}", e)))?;

        let started_at = Utc::now();
        let clock = Instant::now();
        debug!(token_id = %token.id, action = %action.label(), "Sandbox executing");

        let (success, output, exit_code) = match action {
            Action::Command { program, args, env } => {
                let out = process::run_command(&self.config, program, args, env, limits, &cancel).await?;
                (
                    out.exit_code == 0,
                    json!({
                        "stdout": out.stdout,
                        "stderr": out.stderr,
                        "truncated": out.truncated,
                    }),
                    Some(out.exit_code),
                )
            }
            Action::ReadFile { path } => {
                let read = fs::read_file(&self.config.root, path, limits.max_output_bytes);
                let (contents, truncated) = with_limits(read, limits, &cancel).await?;
                (true, json!({ "path": path, "contents": contents, "truncated": truncated }), None)
            }
            Action::WriteFile { path, contents } => {
                let write = fs::write_file(&self.config.root, path, contents);
                let written = with_limits(write, limits, &cancel).await?;
                (true, json!({ "path": path, "bytes_written": written }), None)
            }
            Action::HttpGet { url } => {
                let fetched = net::http_get(&self.client, url, limits, &cancel).await?;
                (
                    (200..300).contains(&fetched.status),
                    json!({
                        "status": fetched.status,
                        "body": fetched.body,
                        "truncated": fetched.truncated,
                    }),
                    None,
                )
            }
            Action::Invoke { .. } => return Err(not_sandboxed(action)),
        };

        Ok(ExecutionResult {
            success,
            output,
            exit_code,
            duration_ms: clock.elapsed().as_millis() as u64,
            cost_cents: 0,
            provenance: Provenance {
                action_digest: action.digest(),
                token_id: token.id.clone(),
                arm_id: token.issued_to.clone(),
                capabilities_exercised: required,
                sandboxed: true,
                started_at,
                finished_at: Utc::now(),
            },
        })
    }
}

fn not_sandboxed(action: &Action) -> ExecutionError {
    ExecutionError::Failure(format!(
        "'{}' is forwarded to its arm, not run in the sandbox",
        action.label()
    ))
}

async fn with_limits<T>(
    work: impl std::future::Future<Output = Result<T, ExecutionError>>,
    limits: &ResourceLimits,
    cancel: &CancellationToken,
) -> Result<T, ExecutionError> {
    tokio::select! {
        result = tokio::time::timeout(limits.wall_clock, work) => match result {
            Ok(inner) => inner,
            Err(_) => Err(ExecutionError::Timeout { after: limits.wall_clock }),
        },
        _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySet;
    use crate::registry::ArmCapability;
    use crate::task::TaskId;
    use crate::token::TokenIssuer;
    use std::collections::BTreeMap;

    const SECRET: &str = "sandbox-test-secret";
    const EXEC: &[&str] = &["process:exec", "fs:read", "fs:write"];

    struct Fixture {
        _dir: tempfile::TempDir,
        issuer: TokenIssuer,
        executor: SandboxExecutor,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let issuer = TokenIssuer::new(SECRET, Duration::from_secs(60), 1);
        let executor = SandboxExecutor::new(SandboxConfig::new(dir.path().to_path_buf()), issuer.verifier());
        Fixture { _dir: dir, issuer, executor }
    }

    fn token_for(issuer: &mut TokenIssuer, granted: &[&str]) -> CapabilityToken {
        let caps = CapabilitySet::parse(granted).unwrap();
        let arm = ArmCapability::new("worker", caps.clone(), 1, 1);
        issuer.issue_for(TaskId::new(), 1, caps, &arm).unwrap()
    }

    fn command(program: &str, args: &[&str]) -> Action {
        Action::Command {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_read_only_token_cannot_write() {
        let mut fx = fixture();
        let token = token_for(&mut fx.issuer, &["fs:read"]);
        let action = Action::WriteFile { path: "out.txt".into(), contents: "data".into() };
        let err = fx
            .executor
            .run(&token, &action, &ResourceLimits::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::CapabilityViolation(TokenError::ScopeInsufficient { .. })
        ));
        assert_eq!(err.kind(), FailureKind::CapabilityViolation);
        assert!(!fx.executor.root().join("out.txt").exists());
    }

    #[tokio::test]
    async fn test_file_actions_create_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut issuer = TokenIssuer::new(SECRET, Duration::from_secs(60), 1);
        let root = dir.path().join("fresh").join("sandbox");
        let executor = SandboxExecutor::new(SandboxConfig::new(root.clone()), issuer.verifier());

        let token = token_for(&mut issuer, &["fs:write"]);
        let action = Action::WriteFile { path: "a.txt".into(), contents: "first".into() };
        let result = executor
            .run(&token, &action, &ResourceLimits::default(), CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "first");
    }

    #[test]
    fn test_error_detail_drops_kind_prefix() {
        let failure = ExecutionError::Failure("exit status 2".into());
        assert_eq!(failure.detail(), "exit status 2");
        assert!(failure.to_string().starts_with("Execution failed"));
        assert!(ExecutionError::PathEscape("../x".into()).detail().contains("../x"));
    }

    #[tokio::test]
    async fn test_token_from_other_issuer_rejected() {
        let fx = fixture();
        let mut rogue = TokenIssuer::new("rogue", Duration::from_secs(60), 1);
        let token = token_for(&mut rogue, &["fs:write"]);
        let action = Action::WriteFile { path: "out.txt".into(), contents: "x".into() };
        let err = fx
            .executor
            .run(&token, &action, &ResourceLimits::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::CapabilityViolation(TokenError::InvalidSignature(_))));
    }

    #[tokio::test]
    async fn test_write_then_read_with_provenance() {
        let mut fx = fixture();
        let write_token = token_for(&mut fx.issuer, &["fs:write"]);
        let write = Action::WriteFile { path: "notes/a.txt".into(), contents: "hello".into() };
        let written = fx
            .executor
            .run(&write_token, &write, &ResourceLimits::default(), CancellationToken::new())
            .await
            .unwrap();
        assert!(written.success);
        assert!(written.provenance.sandboxed);
        assert_eq!(written.provenance.capabilities_exercised, CapabilitySet::parse(["fs:write"]).unwrap());
        assert_eq!(written.provenance.action_digest, write.digest());

        let read_token = token_for(&mut fx.issuer, &["fs:read"]);
        let read = Action::ReadFile { path: "notes/a.txt".into() };
        let result = fx
            .executor
            .run(&read_token, &read, &ResourceLimits::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.output["contents"], "hello");
        assert_eq!(result.output_text(), "hello");
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let mut fx = fixture();
        let token = token_for(&mut fx.issuer, &["fs:read"]);
        let action = Action::ReadFile { path: "../../etc/passwd".into() };
        let err = fx
            .executor
            .run(&token, &action, &ResourceLimits::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::PathEscape(_)));
    }

    #[tokio::test]
    async fn test_invoke_is_not_sandboxed() {
        let mut fx = fixture();
        let token = token_for(&mut fx.issuer, &["skill:plan"]);
        let action = Action::Invoke { operation: "plan".into(), payload: serde_json::Value::Null };
        assert!(matches!(
            fx.executor
                .run(&token, &action, &ResourceLimits::default(), CancellationToken::new())
                .await,
            Err(ExecutionError::Failure(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runs_in_root_with_cleared_env() {
        let mut fx = fixture();
        let token = token_for(&mut fx.issuer, EXEC);
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/tmp/evil".to_string());
        env.insert("GREETING".to_string(), "hi".to_string());
        let action = Action::Command {
            program: "sh".into(),
            args: vec!["-c".into(), "echo \"$GREETING $PATH\"; pwd".into()],
            env,
        };
        let result = fx
            .executor
            .run(&token, &action, &ResourceLimits::default(), CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        let stdout = result.output_text();
        let mut lines = stdout.lines();
        assert_eq!(lines.next(), Some("hi /usr/local/bin:/usr/bin:/bin"));
        let cwd = std::path::PathBuf::from(lines.next().unwrap());
        assert_eq!(cwd.canonicalize().unwrap(), fx.executor.root().canonicalize().unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_only_token_cannot_run_commands() {
        let mut fx = fixture();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("escaped.txt");
        let token = token_for(&mut fx.issuer, &["process:exec"]);
        let script = format!("echo leaked > '{}'", target.display());
        let err = fx
            .executor
            .run(&token, &command("sh", &["-c", &script]), &ResourceLimits::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::CapabilityViolation(TokenError::ScopeInsufficient { .. })
        ));
        assert!(!target.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_provenance_reports_file_access() {
        let mut fx = fixture();
        let token = token_for(&mut fx.issuer, EXEC);
        let result = fx
            .executor
            .run(&token, &command("sh", &["-c", "echo ok > out.txt"]), &ResourceLimits::default(), CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(
            result.provenance.capabilities_exercised,
            CapabilitySet::parse(EXEC.iter().copied()).unwrap()
        );
        assert!(fx.executor.root().join("out.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_unsuccessful_result() {
        let mut fx = fixture();
        let token = token_for(&mut fx.issuer, EXEC);
        let result = fx
            .executor
            .run(&token, &command("sh", &["-c", "exit 3"]), &ResourceLimits::default(), CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let mut fx = fixture();
        let token = token_for(&mut fx.issuer, EXEC);
        let limits = ResourceLimits::default().with_wall_clock(Duration::from_millis(200));
        let started = Instant::now();
        let err = fx
            .executor
            .run(&token, &command("sleep", &["10"]), &limits, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionError::Timeout { after: Duration::from_millis(200) });
        assert_eq!(err.kind(), FailureKind::ExecutionTimeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_is_capped() {
        let mut fx = fixture();
        let token = token_for(&mut fx.issuer, EXEC);
        let limits = ResourceLimits::default().with_max_output_bytes(1000);
        let result = fx
            .executor
            .run(
                &token,
                &command("sh", &["-c", "i=0; while [ $i -lt 500 ]; do echo 0123456789; i=$((i+1)); done"]),
                &limits,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.output["stdout"].as_str().unwrap().len(), 1000);
        assert_eq!(result.output["truncated"], true);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let mut fx = fixture();
        let token = token_for(&mut fx.issuer, EXEC);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = fx
            .executor
            .run(&token, &command("sleep", &["10"]), &ResourceLimits::default(), cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionError::Cancelled);
    }
}
