//! Proxy data models

use crate::error::Error;
use crate::proxy::stats::ProxyStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Proxy scheme enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Socks4 => "socks4",
            ProxyType::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(ProxyType::Http),
            "https" => Ok(ProxyType::Https),
            "socks4" => Ok(ProxyType::Socks4),
            "socks5" => Ok(ProxyType::Socks5),
            _ => Err(Error::InvalidScheme(s.to_string())),
        }
    }
}

/// Identity triple of a proxy: scheme, IPv4 address and port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyId {
    pub scheme: ProxyType,
    pub address: Ipv4Addr,
    pub port: u16,
}

impl ProxyId {
    pub fn new(scheme: ProxyType, address: Ipv4Addr, port: u16) -> Self {
        Self {
            scheme,
            address,
            port,
        }
    }

    /// Line sent to the checker process for this proxy
    pub fn request_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.address, self.port)
    }
}

/// A stored proxy together with its rolling statistics
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRecord {
    pub id: ProxyId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stats: ProxyStats,
}

impl ProxyRecord {
    /// A freshly registered proxy that has never been checked
    pub fn new(id: ProxyId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            updated_at: now,
            stats: ProxyStats::default(),
        }
    }

    pub fn is_good(&self) -> bool {
        self.stats.is_good()
    }
}

/// One check outcome reported by the checker process.
///
/// The checker emits extra fields (exit address, error text) which are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub scheme: ProxyType,
    pub address: Ipv4Addr,
    pub port: u16,
    #[serde(alias = "good")]
    pub reachable: bool,
    #[serde(default)]
    pub speed: f64,
}

impl CheckResult {
    pub fn reachable(id: ProxyId, speed: f64) -> Self {
        Self {
            scheme: id.scheme,
            address: id.address,
            port: id.port,
            reachable: true,
            speed,
        }
    }

    pub fn unreachable(id: ProxyId) -> Self {
        Self {
            scheme: id.scheme,
            address: id.address,
            port: id.port,
            reachable: false,
            speed: 0.0,
        }
    }

    pub fn proxy_id(&self) -> ProxyId {
        ProxyId::new(self.scheme, self.address, self.port)
    }
}

/// Display form of a proxy returned by the read API
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyView {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ProxyRecord> for ProxyView {
    fn from(record: &ProxyRecord) -> Self {
        Self {
            address: record.id.to_string(),
            speed: record
                .stats
                .average_speed()
                .filter(|s| *s > 0.0)
                .map(|s| format!("{:.2}", s)),
            uptime: record.stats.average_uptime().map(|u| format!("{:.2}", u)),
            updated_at: record.updated_at,
        }
    }
}
