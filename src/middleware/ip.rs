//! Client IP resolution for client-scoped rate limits and auth brute-force
//! protection.
//!
//! # Resolution Order
//!
//! 1. If the connection's peer address is known (`ConnectInfo<SocketAddr>`,
//!    present when the server is started with
//!    `into_make_service_with_connect_info`) and trusted proxies are
//!    configured, forwarded headers are honoured only when the peer lies in a
//!    trusted CIDR range. An untrusted peer is keyed by its own address.
//! 2. `X-Forwarded-For` (first entry), then `X-Real-IP`.
//! 3. The peer address.
//! 4. [`UNKNOWN_IP`].
//!
//! # Spoofing
//!
//! Without trusted proxies configured, forwarded headers are taken at face
//! value. Behind a reverse proxy, set `TRUSTED_PROXIES` to the proxy's
//! network and make the proxy overwrite (not append to) `X-Forwarded-For`.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Key shared by all requests whose origin cannot be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Parsed CIDR network range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `"10.0.0.0/8"`, `"::1/128"` or a bare address (host route).
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = if network.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Check whether `ip` lies inside this range. Address families never mix.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0);
                (u32::from(net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Reverse proxies whose forwarded headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Parse CIDR strings; invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();
        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// `true` when `ip` is inside a trusted range, or when no ranges are set.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        !self.is_enabled() || self.ranges.iter().any(|range| range.contains(ip))
    }
}

/// First address claimed by proxy headers, if any.
fn forwarded_ip<B>(req: &Request<B>) -> Option<&str> {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next().map(str::trim)
        && !first.is_empty()
    {
        return Some(first);
    }

    req.headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolve the client IP used as a rate-limit / failure-tracking key.
pub fn client_ip<B>(req: &Request<B>, trusted: &TrustedProxyConfig) -> Cow<'static, str> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    match (peer, forwarded_ip(req)) {
        (Some(peer), Some(claimed)) if !trusted.is_trusted(&peer) => {
            debug!(
                peer = %peer,
                claimed,
                "Ignoring forwarded client IP from untrusted peer"
            );
            Cow::Owned(peer.to_string())
        }
        (_, Some(claimed)) => Cow::Owned(claimed.to_string()),
        (Some(peer), None) => Cow::Owned(peer.to_string()),
        (None, None) => Cow::Borrowed(UNKNOWN_IP),
    }
}
