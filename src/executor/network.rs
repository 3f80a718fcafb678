//! Outbound network policy for sandboxed containers.
//!
//! A `restricted` policy attaches the container to a dedicated bridge
//! whose egress is filtered host-side: iptables permits only TCP/443 to
//! addresses resolved through a DNS proxy restricted to the allowed
//! domains, and DNS itself only toward that proxy.  Everything else is
//! dropped.  Private ranges are rejected after resolution so an
//! attacker-controlled DNS record cannot point a container at the host
//! network.
//!
//! Rule generation is pure string assembly so it is testable without
//! touching the host firewall.

use std::net::{IpAddr, SocketAddr};

// ─── Private-range filtering ──────────────────────────────────────────────────

/// True for addresses a sandboxed container must never reach:
/// loopback, RFC 1918, link-local, CGNAT, and their IPv6 equivalents.
pub fn is_private_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // CGNAT 100.64.0.0/10.
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique-local fc00::/7.
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                // Link-local fe80::/10.
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
        }
    }
}

/// Resolve `domain` and drop private addresses.
///
/// Errors when resolution fails or every resolved address is private.
pub async fn resolve_public(domain: &str, port: u16) -> Result<Vec<SocketAddr>, String> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((domain, port))
        .await
        .map_err(|e| format!("DNS resolution failed for '{domain}': {e}"))?
        .collect();
    let public: Vec<SocketAddr> = addrs
        .into_iter()
        .filter(|a| !is_private_ip(&a.ip()))
        .collect();
    if public.is_empty() {
        return Err(format!("'{domain}' resolves only to private addresses"));
    }
    Ok(public)
}

// ─── Egress rule generation ───────────────────────────────────────────────────

/// Host-side egress filter for one restricted bridge.
#[derive(Debug, Clone)]
pub struct EgressPolicy {
    /// Bridge network the container attaches to.
    pub bridge: String,
    /// DNS proxy the container must use.
    pub dns_proxy: SocketAddr,
    /// Domains the DNS proxy will resolve.
    pub allowed_domains: Vec<String>,
}

impl EgressPolicy {
    /// iptables rules for the bridge: DNS to the proxy, TCP/443 to the
    /// resolved addresses, drop everything else.
    pub fn iptables_rules(&self, resolved: &[IpAddr]) -> Vec<String> {
        let mut rules = vec![
            // DNS only toward the filtering proxy.
            format!(
                "-A FORWARD -i {} -p udp --dport 53 -d {} -j ACCEPT",
                self.bridge,
                self.dns_proxy.ip()
            ),
            format!(
                "-A FORWARD -i {} -p tcp --dport 53 -d {} -j ACCEPT",
                self.bridge,
                self.dns_proxy.ip()
            ),
        ];
        for addr in resolved {
            rules.push(format!(
                "-A FORWARD -i {} -p tcp --dport 443 -d {addr} -j ACCEPT",
                self.bridge
            ));
        }
        // Established return traffic, then default drop.
        rules.push(format!(
            "-A FORWARD -o {} -m state --state ESTABLISHED,RELATED -j ACCEPT",
            self.bridge
        ));
        rules.push(format!("-A FORWARD -i {} -j DROP", self.bridge));
        rules
    }

    /// Allow-list configuration for the DNS proxy: one domain per line.
    pub fn dns_allowlist(&self) -> String {
        self.allowed_domains.join("\n")
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
