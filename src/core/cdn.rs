// src/core/cdn.rs
use std::net::IpAddr;
use std::str::FromStr;
use ipnetwork::IpNetwork;
use tracing::warn;

use crate::error::{SurfaceError, SurfaceResult};

/// Published Cloudflare edge ranges
pub const CLOUDFLARE_RANGES: &[&str] = &[
    "104.16.0.0/12",
    "172.64.0.0/13",
    "173.245.48.0/20",
    "103.21.244.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "131.0.72.0/22",
];

/// Address ranges that belong to CDN edges rather than to the target itself
#[derive(Debug, Clone)]
pub struct CdnRanges {
    networks: Vec<IpNetwork>,
}

impl CdnRanges {
    /// Parse a list of CIDR strings
    pub fn from_strings(ranges: &[String]) -> SurfaceResult<Self> {
        let mut networks = Vec::with_capacity(ranges.len());
        for range in ranges {
            let network = IpNetwork::from_str(range.trim())
                .map_err(|e| SurfaceError::ConfigError(format!("Invalid CDN range {}: {}", range, e)))?;
            networks.push(network);
        }
        Ok(Self { networks })
    }

    pub fn cloudflare() -> Self {
        let networks = CLOUDFLARE_RANGES
            .iter()
            .filter_map(|range| match IpNetwork::from_str(range) {
                Ok(network) => Some(network),
                Err(e) => {
                    warn!("Skipping invalid CDN range {}: {}", range, e);
                    None
                }
            })
            .collect();
        Self { networks }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(*ip))
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

impl Default for CdnRanges {
    fn default() -> Self {
        Self::cloudflare()
    }
}
