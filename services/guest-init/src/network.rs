//! Network configuration inside the guest.
//!
//! Applies the `{iface, ip, cidr, gateway, mac}` payload delivered over
//! the `/network` agent endpoint to the virtio-net device.

use std::net::Ipv4Addr;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::error::InitError;

/// Default virtio-net interface name (first device), used if the request
/// omits `iface`.
pub const DEFAULT_INTERFACE: &str = "eth0";

pub async fn configure(req: &crate::agent_protocol::NetworkConfigRequest) -> Result<()> {
    let iface = if req.iface.is_empty() {
        DEFAULT_INTERFACE
    } else {
        req.iface.as_str()
    };

    let _ip: Ipv4Addr = req
        .ip
        .parse()
        .map_err(|e| InitError::NetConfigFailed(format!("invalid ip '{}': {}", req.ip, e)))?;
    let _gateway: Ipv4Addr = req.gateway.parse().map_err(|e| {
        InitError::NetConfigFailed(format!("invalid gateway '{}': {}", req.gateway, e))
    })?;

    if !req.mac.is_empty() {
        run_ip(&["link", "set", "dev", iface, "address", &req.mac])?;
        debug!(mac = %req.mac, "mac address set");
    }

    run_ip(&["link", "set", "dev", iface, "up"])?;
    debug!(iface, "interface up");

    let addr_with_prefix = format!("{}/{}", req.ip, req.cidr);
    run_ip(&["addr", "replace", &addr_with_prefix, "dev", iface])?;
    info!(address = %addr_with_prefix, iface, "ipv4 address configured");

    run_ip(&["route", "replace", "default", "via", &req.gateway, "dev", iface])?;
    info!(gateway = %req.gateway, "default route configured");

    Ok(())
}

/// Run an `ip` command, returning an error with stderr attached on
/// failure.
fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .context("failed to execute ip command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(InitError::NetConfigFailed(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr.trim()
        ))
        .into());
    }

    Ok(())
}

/// Install (or replace) the guest-local outbound allowlist. Mirrors the
/// host's per-VM nftables chain so a compromised guest cannot simply
/// re-point its own default route to bypass it; this is defense in
/// depth, not the primary enforcement point.
pub async fn apply_allowlist(req: &crate::agent_protocol::AllowlistRequest) -> Result<()> {
    let mut script = String::from(
        "table inet agentfw\nflush table inet agentfw\n\
         table inet agentfw {\n  chain output {\n    type filter hook output priority 0; policy drop;\n\
         \x20\x20\x20\x20ct state established,related accept\n    oif lo accept\n",
    );

    script.push_str(&format!(
        "    ip daddr {} accept\n",
        sanitize_cidr(&req.gateway)?
    ));
    for cidr in &req.cidrs {
        script.push_str(&format!("    ip daddr {} accept\n", sanitize_cidr(cidr)?));
    }

    if req.allow_outbound {
        script.push_str("    accept\n");
    } else {
        script.push_str("    drop\n");
    }

    script.push_str("  }\n}\n");

    let mut child = Command::new("nft")
        .args(["-f", "-"])
        .stdin(std::process::Stdio::piped())
        .spawn()
        .context("failed to spawn nft")?;

    {
        use std::io::Write;
        let stdin = child.stdin.as_mut().expect("piped stdin");
        stdin
            .write_all(script.as_bytes())
            .context("failed to write nft script")?;
    }

    let status = child.wait().context("failed to wait for nft")?;
    if !status.success() {
        return Err(InitError::NetConfigFailed("nft allowlist install failed".to_string()).into());
    }

    info!(count = req.cidrs.len(), allow_outbound = req.allow_outbound, "allowlist applied");
    Ok(())
}

fn sanitize_cidr(cidr: &str) -> Result<&str> {
    if cidr
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == ':' || c == '/')
    {
        Ok(cidr)
    } else {
        Err(InitError::NetConfigFailed(format!("invalid cidr: {cidr}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_cidr_rejects_shell_metacharacters() {
        assert!(sanitize_cidr("10.0.0.0/24").is_ok());
        assert!(sanitize_cidr("10.0.0.0/24; rm -rf /").is_err());
    }
}
