//! Runs a single command chrooted into the sandbox root, dropped to a
//! fixed uid/gid, with a minimal non-inherited environment and bounded
//! output.
//!
//! This is the *second*, in-guest jail: the host already runs the whole
//! microVM through Firecracker's `jailer`. Path confinement to
//! `/workspace` is [`PathPolicy`](crate::path_policy::PathPolicy)'s job,
//! enforced before a request ever reaches here; this module's chroot and
//! uid/gid drop exist so a jailed command can never regain root even if
//! it escapes the paths it was given.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Sandbox uid/gid per spec.
pub const JAIL_UID: u32 = 1000;
pub const JAIL_GID: u32 = 1000;

/// Default timeout for jailed commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Each output stream is capped at this many bytes; excess is silently
/// truncated.
pub const OUTPUT_CAP_BYTES: usize = 1_000_000;

#[derive(Debug, Error)]
pub enum JailError {
    #[error("failed to spawn jailed command: {0}")]
    Spawn(std::io::Error),

    #[error("failed to wait for jailed command: {0}")]
    Wait(std::io::Error),

    #[error("chroot setup failed: {0}")]
    Chroot(String),
}

/// Result of a jailed command invocation.
#[derive(Debug, Clone)]
pub struct JailOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// One jailed command invocation.
#[derive(Debug, Clone)]
pub struct JailRequest {
    /// Shell command, run via `/bin/sh -c`.
    pub command: String,
    /// In-chroot working directory (already canonicalized by PathPolicy).
    pub cwd: Option<String>,
    /// Extra environment variables layered on top of the minimal base set.
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

impl JailRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Runs commands chrooted into `sandbox_root`.
pub struct JailRunner {
    sandbox_root: String,
}

impl JailRunner {
    pub fn new(sandbox_root: impl Into<String>) -> Self {
        Self {
            sandbox_root: sandbox_root.into(),
        }
    }

    pub async fn run(&self, req: JailRequest) -> Result<JailOutput, JailError> {
        debug!(command = %req.command, cwd = ?req.cwd, "jail: spawning");

        let env = minimal_env(&req.env, req.cwd.as_deref());
        let sandbox_root = self.sandbox_root.clone();
        let cwd = req.cwd.clone().unwrap_or_else(|| "/workspace".to_string());

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&req.command)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // SAFETY: pre_exec runs in the forked child before exec; it only
        // calls async-signal-safe libc functions (chroot/chdir/setgroups/
        // setgid/setuid).
        unsafe {
            cmd.pre_exec(move || {
                let root = CString::new(sandbox_root.clone())
                    .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?;
                if libc::chroot(root.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                let cwd_c = CString::new(cwd.clone())
                    .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?;
                if libc::chdir(cwd_c.as_ptr()) != 0 {
                    // Fall back to the chroot root if the requested cwd is gone.
                    let root_c = CString::new("/").unwrap();
                    if libc::chdir(root_c.as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if libc::setgroups(0, std::ptr::null()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setgid(JAIL_GID) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setuid(JAIL_UID) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(JailError::Spawn)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(capped_read(stdout));
        let stderr_task = tokio::spawn(capped_read(stderr));

        match tokio::time::timeout(req.timeout, child.wait()).await {
            Ok(status) => {
                let status = status.map_err(JailError::Wait)?;
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                Ok(JailOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                })
            }
            Err(_) => {
                kill_child(&mut child).await;
                let stdout = stdout_task.await.unwrap_or_default();
                let mut stderr = stderr_task.await.unwrap_or_default();
                stderr.push_str("Timeout exceeded");
                Ok(JailOutput {
                    exit_code: -1,
                    stdout,
                    stderr,
                })
            }
        }
    }
}

async fn kill_child(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to SIGKILL jailed command after timeout");
    }
}

async fn capped_read<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < OUTPUT_CAP_BYTES {
                    let remaining = OUTPUT_CAP_BYTES - buf.len();
                    buf.extend_from_slice(&chunk[..n.min(remaining)]);
                }
                // Keep draining the pipe even once the cap is hit so the
                // child never blocks on a full pipe buffer.
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Minimal, non-inherited environment: PATH/HOME/USER/LOGNAME/SHELL/LANG/
/// TMPDIR plus caller-supplied entries.
fn minimal_env(extra: &HashMap<String, String>, _cwd: Option<&str>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(
        "PATH".to_string(),
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
    );
    env.insert("HOME".to_string(), "/workspace".to_string());
    env.insert("USER".to_string(), "sandbox".to_string());
    env.insert("LOGNAME".to_string(), "sandbox".to_string());
    env.insert("SHELL".to_string(), "/bin/sh".to_string());
    env.insert("LANG".to_string(), "C.UTF-8".to_string());
    env.insert("TMPDIR".to_string(), "/tmp".to_string());
    for (k, v) in extra {
        env.insert(k.clone(), v.clone());
    }
    env
}

/// Single-quote-escape a shell argument: `'` becomes `'\''`.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn minimal_env_includes_base_set_and_overrides() {
        let mut extra = HashMap::new();
        extra.insert("FOO".to_string(), "bar".to_string());
        let env = minimal_env(&extra, None);
        assert_eq!(env.get("SHELL").unwrap(), "/bin/sh");
        assert_eq!(env.get("FOO").unwrap(), "bar");
        assert_eq!(env.get("LANG").unwrap(), "C.UTF-8");
    }
}
