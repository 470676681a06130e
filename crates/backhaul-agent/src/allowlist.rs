use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Allowlist errors
#[derive(Debug, Error)]
pub enum AllowlistError {
    #[error("Invalid CIDR notation '{network}': {reason}")]
    InvalidNetwork { network: String, reason: String },

    #[error("Address {0} is not in an allowed network")]
    NetworkDenied(IpAddr),

    #[error("Port {0} is not allowed")]
    PortDenied(u16),
}

/// Allowlist as written in a config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AllowlistConfig {
    /// CIDR notation strings (e.g., "192.168.0.0/16", "10.0.0.0/8")
    pub networks: Vec<String>,
    pub ports: Vec<u16>,
}

/// Network and port allowlist for dial targets
///
/// Empty lists allow everything.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    networks: Vec<IpNetwork>,
    ports: Vec<u16>,
}

impl Allowlist {
    /// Create a new allowlist from network CIDR strings and port numbers
    pub fn new(networks: Vec<String>, ports: Vec<u16>) -> Result<Self, AllowlistError> {
        let mut parsed_networks = Vec::with_capacity(networks.len());

        for network in networks {
            let parsed =
                IpNetwork::from_str(&network).map_err(|e| AllowlistError::InvalidNetwork {
                    reason: e.to_string(),
                    network,
                })?;
            parsed_networks.push(parsed);
        }

        Ok(Self {
            networks: parsed_networks,
            ports,
        })
    }

    pub fn from_config(config: &AllowlistConfig) -> Result<Self, AllowlistError> {
        Self::new(config.networks.clone(), config.ports.clone())
    }

    /// True when nothing is restricted
    pub fn allows_all(&self) -> bool {
        self.networks.is_empty() && self.ports.is_empty()
    }

    /// Check a resolved target address
    pub fn check(&self, addr: &SocketAddr) -> Result<(), AllowlistError> {
        if !self.is_ip_allowed(&addr.ip()) {
            return Err(AllowlistError::NetworkDenied(addr.ip()));
        }
        if !self.is_port_allowed(addr.port()) {
            return Err(AllowlistError::PortDenied(addr.port()));
        }
        Ok(())
    }

    pub fn is_allowed(&self, addr: &SocketAddr) -> bool {
        self.check(addr).is_ok()
    }

    fn is_ip_allowed(&self, ip: &IpAddr) -> bool {
        if self.networks.is_empty() {
            return true;
        }

        // Compare IPv4-mapped IPv6 addresses against IPv4 networks too
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(*ip),
            IpAddr::V4(_) => *ip,
        };

        self.networks.iter().any(|network| network.contains(ip))
    }

    fn is_port_allowed(&self, port: u16) -> bool {
        self.ports.is_empty() || self.ports.contains(&port)
    }
}
