//! Platform guest init — PID 1 for Firecracker microVMs.
//!
//! This binary runs as PID 1 inside every microVM and is responsible
//! for:
//! - Reaping zombie child processes (the canonical PID 1 duty)
//! - Serving the Guest Agent HTTP surface over a fixed VSOCK port:
//!   health, network configuration, outbound allowlist, exec, run-ts,
//!   run-js, file upload/download
//!
//! There is no boot-time handshake: the host dials in over vsock once
//! the guest reports healthy, rather than the guest dialing out.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

mod agent_server;
mod error;
mod exec_runner;
mod jail;
mod logging;
mod network;
mod path_policy;

#[path = "../../../agent_protocol.rs"]
mod agent_protocol;

/// Guest init version (semver).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Boot log path.
pub const BOOT_LOG_PATH: &str = "/run/platform/guest-init.log";

/// Default CA bundle made available to run-ts/run-js invocations.
const DEFAULT_CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    if let Err(e) = logging::init(BOOT_LOG_PATH) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    info!(version = VERSION, "guest-init starting");

    match run().await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            error!(error = %e, "guest-init failed");
            let mut source = e.source();
            while let Some(cause) = source {
                error!(cause = %cause, "caused by");
                source = cause.source();
            }
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<()> {
    let reaper = tokio::spawn(reap_loop());

    let state = Arc::new(agent_server::AgentState::new("/", DEFAULT_CA_BUNDLE));
    let server = agent_server::run(agent_protocol::AGENT_VSOCK_PORT, state);

    tokio::select! {
        result = server => {
            result.map_err(|e| anyhow::anyhow!(e))?;
        }
        _ = reaper => {
            warn!("zombie reaper task exited unexpectedly");
        }
    }

    Ok(())
}

/// PID 1's canonical duty: reap every child whose parent process has
/// exited, so they never accumulate as zombies. Runs for the lifetime
/// of the guest.
async fn reap_loop() {
    let mut sigchld = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGCHLD handler");
            return;
        }
    };

    loop {
        sigchld.recv().await;
        reap_zombies();
    }
}

fn reap_zombies() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                debug!(pid = pid.as_raw(), code, "reaped zombie");
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                debug!(pid = pid.as_raw(), signal = ?sig, "reaped signaled zombie");
            }
            Ok(WaitStatus::StillAlive) => break,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => {
                warn!(error = %e, "waitpid error");
                break;
            }
            _ => {}
        }
    }
}
