//! Host firewall rules: pool-wide SNAT and per-VM egress allowlists.
//!
//! Installed and torn down as whole `nft -f -` script bodies, the same
//! `std::process::Command` shelling idiom `tap.rs` uses for `ip`, so a
//! partial rule application is never observable: either the whole chain
//! lands or the command fails and nothing changes.

use std::io::Write;
use std::net::Ipv4Addr;
use std::process::{Command, Stdio};

use tracing::info;

use super::allocator::NetworkError;

const NAT_TABLE: &str = "fc_nat";

/// Name of the per-VM allowlist chain/table for a given VM id.
fn vm_table_name(vm_id: &str) -> String {
    format!("fc_{}", sanitize(vm_id))
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Install (idempotently) the pool-wide SNAT rule masquerading all traffic
/// leaving `pool_cidr` out of `egress_iface`. Called once at startup.
pub fn install_pool_nat(pool_cidr: &str, egress_iface: &str) -> Result<(), NetworkError> {
    let script = format!(
        "table ip {table}\nflush table ip {table}\n\
         table ip {table} {{\n  chain postrouting {{\n    type nat hook postrouting priority 100;\n\
         \x20\x20\x20\x20ip saddr {cidr} oifname \"{iface}\" masquerade\n  }}\n}}\n",
        table = NAT_TABLE,
        cidr = pool_cidr,
        iface = egress_iface,
    );
    run_nft(&script)?;
    info!(pool_cidr, egress_iface, "installed pool-wide SNAT rule");
    Ok(())
}

/// Install a per-VM egress allowlist chain. Accepts established/related
/// traffic and loopback, then each CIDR in `allow_ips`, plus the VM's own
/// gateway (always reachable regardless of `outbound_internet`); drops
/// everything else when `outbound_internet` is false, otherwise accepts
/// the rest too.
pub fn install_vm_allowlist(
    vm_id: &str,
    tap_name: &str,
    gateway: Ipv4Addr,
    allow_ips: &[String],
    outbound_internet: bool,
) -> Result<(), NetworkError> {
    let table = vm_table_name(vm_id);
    let mut script = format!(
        "table inet {table}\nflush table inet {table}\n\
         table inet {table} {{\n  chain forward {{\n    type filter hook forward priority 0; policy accept;\n\
         \x20\x20\x20\x20iifname \"{tap}\" ct state established,related accept\n\
         \x20\x20\x20\x20iifname \"{tap}\" ip daddr {gw} accept\n",
        table = table,
        tap = tap_name,
        gw = gateway,
    );

    for cidr in allow_ips {
        let cidr = sanitize_cidr(cidr)?;
        script.push_str(&format!(
            "    iifname \"{tap}\" ip daddr {cidr} accept\n",
            tap = tap_name,
            cidr = cidr
        ));
    }

    if outbound_internet {
        script.push_str(&format!("    iifname \"{tap}\" accept\n", tap = tap_name));
    } else {
        script.push_str(&format!("    iifname \"{tap}\" drop\n", tap = tap_name));
    }

    script.push_str("  }\n}\n");

    run_nft(&script)?;
    info!(vm_id, tap_name, count = allow_ips.len(), outbound_internet, "installed vm allowlist");
    Ok(())
}

/// Remove a per-VM allowlist chain. Idempotent: deleting an absent table
/// is not an error.
pub fn teardown_vm_allowlist(vm_id: &str) -> Result<(), NetworkError> {
    let table = vm_table_name(vm_id);
    let script = format!("table inet {table}\ndelete table inet {table}\n");
    match run_nft(&script) {
        Ok(()) => Ok(()),
        Err(NetworkError::Firewall(msg)) if msg.contains("No such file or directory") => Ok(()),
        Err(e) => Err(e),
    }
}

fn sanitize_cidr(cidr: &str) -> Result<&str, NetworkError> {
    if cidr
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '/')
        && !cidr.is_empty()
    {
        Ok(cidr)
    } else {
        Err(NetworkError::Firewall(format!("invalid cidr: {cidr}")))
    }
}

fn run_nft(script: &str) -> Result<(), NetworkError> {
    let mut child = Command::new("nft")
        .args(["-f", "-"])
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| NetworkError::Firewall(format!("failed to spawn nft: {e}")))?;

    {
        let stdin = child.stdin.as_mut().expect("piped stdin");
        stdin
            .write_all(script.as_bytes())
            .map_err(|e| NetworkError::Firewall(format!("failed to write nft script: {e}")))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| NetworkError::Firewall(format!("failed to wait for nft: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(NetworkError::Firewall(stderr));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_table_name_sanitizes_ids() {
        assert_eq!(vm_table_name("vm-01JEXAMPLE"), "fc_vm_01JEXAMPLE");
    }

    #[test]
    fn sanitize_cidr_rejects_shell_metacharacters() {
        assert!(sanitize_cidr("10.0.0.0/24").is_ok());
        assert!(sanitize_cidr("10.0.0.0/24; rm -rf /").is_err());
    }
}
