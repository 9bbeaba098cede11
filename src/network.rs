//! Local network identity.
//!
//! The registry keeps a separate address book per network. A network is
//! identified by the hardware address of its default gateway, read from the
//! kernel's routing and neighbour tables.

use anyhow::{Context, Result, anyhow};
use std::fs;
use std::net::Ipv4Addr;
use tracing::debug;

/// Kernel IPv4 routing table
const ROUTE_TABLE: &str = "/proc/net/route";
/// Kernel ARP cache
const ARP_TABLE: &str = "/proc/net/arp";

/// Resolve the current network identity
///
/// An explicit override from configuration wins over detection.
///
/// # Errors
///
/// Returns an error if no default route exists or the gateway is not in the
/// neighbour table.
pub fn network_identity(override_identity: Option<&str>) -> Result<String> {
    if let Some(identity) = override_identity.filter(|s| !s.trim().is_empty()) {
        return Ok(identity.trim().to_lowercase());
    }

    let routes = fs::read_to_string(ROUTE_TABLE)
        .with_context(|| format!("Failed to read {ROUTE_TABLE}"))?;
    let gateway = default_gateway(&routes).context("No default IPv4 route")?;

    let neighbours =
        fs::read_to_string(ARP_TABLE).with_context(|| format!("Failed to read {ARP_TABLE}"))?;
    let identity = hardware_address(&neighbours, gateway)
        .ok_or_else(|| anyhow!("Gateway {gateway} has no hardware address in {ARP_TABLE}"))?;

    debug!(%gateway, %identity, "Resolved network identity");
    Ok(identity)
}

/// Extract the default gateway from `/proc/net/route` contents
///
/// Destination and gateway columns are little-endian hexadecimal.
#[must_use]
pub fn default_gateway(routes: &str) -> Option<Ipv4Addr> {
    routes.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (destination, gateway) = (fields.get(1)?, fields.get(2)?);
        if *destination != "00000000" {
            return None;
        }
        let raw = u32::from_str_radix(gateway, 16).ok()?;
        if raw == 0 {
            return None;
        }
        Some(Ipv4Addr::from(raw.to_le_bytes()))
    })
}

/// Find the hardware address of `ip` in `/proc/net/arp` contents
#[must_use]
pub fn hardware_address(neighbours: &str, ip: Ipv4Addr) -> Option<String> {
    let wanted = ip.to_string();
    neighbours.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (addr, mac) = (fields.first()?, fields.get(3)?);
        (*addr == wanted && *mac != "00:00:00:00:00:00").then(|| mac.to_lowercase())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n\
wlp2s0\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0\n\
wlp2s0\t0001A8C0\t00000000\t0001\t0\t0\t600\t00FFFFFF\t0\t0\t0\n";

    const ARP: &str = "IP address       HW type     Flags       HW address            Mask     Device\n\
192.168.1.1      0x1         0x2         A4:91:B1:0C:22:7E     *        wlp2s0\n\
192.168.1.30     0x1         0x0         00:00:00:00:00:00     *        wlp2s0\n";

    #[test]
    fn test_default_gateway() {
        assert_eq!(default_gateway(ROUTES), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(default_gateway("Iface\tDestination\tGateway\n"), None);
    }

    #[test]
    fn test_hardware_address() {
        assert_eq!(
            hardware_address(ARP, Ipv4Addr::new(192, 168, 1, 1)).as_deref(),
            Some("a4:91:b1:0c:22:7e")
        );
        // Incomplete entries carry an all-zero address
        assert_eq!(hardware_address(ARP, Ipv4Addr::new(192, 168, 1, 30)), None);
    }

    #[test]
    fn test_override_wins() {
        assert_eq!(network_identity(Some(" Home-Net ")).unwrap(), "home-net");
    }
}
