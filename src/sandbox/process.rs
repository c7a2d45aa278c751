//! Process execution inside the sandbox root.
//!
//! Each command runs as its own process group with a cleared environment,
//! optional rlimits, and a wall-clock limit. On timeout or cancellation the
//! whole group is killed so grandchildren do not outlive the attempt.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::{ExecutionError, ResourceLimits};
use crate::config::SandboxConfig;

/// Variables an action may never set.
const DENIED_ENV: &[&str] = &["PATH", "LD_PRELOAD", "LD_LIBRARY_PATH", "DYLD_INSERT_LIBRARIES"];

const IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

pub(crate) async fn run_command(
    config: &SandboxConfig,
    program: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    limits: &ResourceLimits,
    cancel: &CancellationToken,
) -> Result<CommandOutput, ExecutionError> {
    let mut cmd = build_command(config, program, args, env, limits, &config.root);
    let mut child = cmd
        .spawn()
        .map_err(|e| ExecutionError::Failure(format!("failed to spawn '{}': {}", program, e)))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let cap = limits.max_output_bytes;
    let mut stdout_handle = tokio::spawn(read_capped(stdout, cap));
    let mut stderr_handle = tokio::spawn(read_capped(stderr, cap));

    let status = tokio::select! {
        status = child.wait() => status
            .map_err(|e| ExecutionError::Failure(format!("failed to wait for '{}': {}", program, e)))?,
        _ = tokio::time::sleep(limits.wall_clock) => {
            kill_process_group(&mut child);
            let _ = child.wait().await;
            stdout_handle.abort();
            stderr_handle.abort();
            tracing::warn!(program, wall_clock_ms = limits.wall_clock.as_millis() as u64, "Sandboxed command timed out");
            return Err(ExecutionError::Timeout { after: limits.wall_clock });
        }
        _ = cancel.cancelled() => {
            kill_process_group(&mut child);
            let _ = child.wait().await;
            stdout_handle.abort();
            stderr_handle.abort();
            return Err(ExecutionError::Cancelled);
        }
    };

    let (stdout, stdout_truncated) = drain(&mut stdout_handle).await;
    let (stderr, stderr_truncated) = drain(&mut stderr_handle).await;

    Ok(CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        truncated: stdout_truncated || stderr_truncated,
    })
}

fn build_command(
    config: &SandboxConfig,
    program: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    limits: &ResourceLimits,
    cwd: &Path,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .env_clear()
        .env("PATH", &config.path_env)
        .env("HOME", cwd)
        .envs(
            env.iter()
                .filter(|(key, _)| !DENIED_ENV.contains(&key.as_str())),
        )
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        cmd.process_group(0);
        let max_memory = limits.max_memory_bytes;
        let max_cpu = limits.max_cpu_secs;
        if max_memory.is_some() || max_cpu.is_some() {
            // SAFETY: the closure only calls async-signal-safe setrlimit.
            unsafe {
                cmd.pre_exec(move || {
                    if let Some(bytes) = max_memory {
                        let limit = libc::rlimit {
                            rlim_cur: bytes as libc::rlim_t,
                            rlim_max: bytes as libc::rlim_t,
                        };
                        if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                    }
                    if let Some(secs) = max_cpu {
                        let limit = libc::rlimit {
                            rlim_cur: secs as libc::rlim_t,
                            rlim_max: secs as libc::rlim_t,
                        };
                        if libc::setrlimit(libc::RLIMIT_CPU, &limit) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                    }
                    Ok(())
                });
            }
        }
    }
    #[cfg(not(unix))]
    let _ = limits;

    cmd
}

/// Read to EOF, keeping at most `cap` bytes.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (kept, truncated)
}

async fn drain(handle: &mut tokio::task::JoinHandle<(Vec<u8>, bool)>) -> (Vec<u8>, bool) {
    match tokio::time::timeout(IO_DRAIN_TIMEOUT, &mut *handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => (Vec::new(), false),
        Err(_) => {
            // A grandchild may still hold the pipe open.
            handle.abort();
            (Vec::new(), true)
        }
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        // The child leads its own group (process_group(0)).
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.start_kill();
}
