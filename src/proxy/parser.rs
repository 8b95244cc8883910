//! Parsing of proxy URLs, checker output lines and registration ranges

use crate::error::{Error, Result};
use crate::proxy::models::{CheckResult, ProxyId, ProxyType};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv4Addr;
use tracing::debug;

/// Upper bound on the number of proxies a single registration may expand to
pub const MAX_REGISTER_BATCH: u64 = 1 << 20;

/// Regex pattern for scheme://IPv4:PORT
static PROXY_URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?|socks[45])://(\d{1,3}(?:\.\d{1,3}){3}):(\d{1,5})/?$")
        .expect("Invalid proxy URL regex")
});

/// Parser for the textual forms proxies take on the way in and out
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a `scheme://address:port` line, the same form written to the checker
    pub fn parse_url(line: &str) -> Option<ProxyId> {
        let caps = PROXY_URL_REGEX.captures(line.trim())?;

        let scheme: ProxyType = caps[1].parse().ok()?;
        let address: Ipv4Addr = caps[2].parse().ok()?;
        let port: u16 = caps[3].parse().ok()?;
        if port == 0 {
            return None;
        }

        Some(ProxyId::new(scheme, address, port))
    }

    /// Parse one line of checker output.
    ///
    /// Blank lines and anything that is not a valid result object yield `None`.
    pub fn parse_result_line(line: &str) -> Option<CheckResult> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        match serde_json::from_str(line) {
            Ok(result) => Some(result),
            Err(err) => {
                debug!(%err, line, "discarding malformed checker line");
                None
            }
        }
    }

    /// Parse a port or an inclusive port range (`8080` or `8000-8080`)
    pub fn parse_port_range(s: &str) -> Result<(u16, u16)> {
        let invalid = || Error::InvalidRange(format!("bad port range: {}", s));
        let (first, last) = match s.split_once('-') {
            Some((first, last)) => (first.trim(), last.trim()),
            None => (s.trim(), s.trim()),
        };

        let first: u16 = first.parse().map_err(|_| invalid())?;
        let last: u16 = last.parse().map_err(|_| invalid())?;
        Ok((first, last))
    }

    /// Expand schemes × address range × port range into identity triples.
    ///
    /// Both ranges are inclusive.
    pub fn expand_range(
        schemes: &[ProxyType],
        addresses: (Ipv4Addr, Ipv4Addr),
        ports: (u16, u16),
    ) -> Result<Vec<ProxyId>> {
        let (first_addr, last_addr) = (u32::from(addresses.0), u32::from(addresses.1));
        let (first_port, last_port) = ports;

        if first_addr > last_addr {
            return Err(Error::InvalidRange(format!(
                "address range {} - {} is reversed",
                addresses.0, addresses.1
            )));
        }
        if first_port == 0 || first_port > last_port {
            return Err(Error::InvalidRange(format!(
                "port range {} - {} is invalid",
                first_port, last_port
            )));
        }

        let too_large = || {
            Error::InvalidRange(format!(
                "range expands to more than {} proxies",
                MAX_REGISTER_BATCH
            ))
        };
        let total = (schemes.len() as u64)
            .checked_mul(u64::from(last_addr - first_addr) + 1)
            .and_then(|n| n.checked_mul(u64::from(last_port - first_port) + 1))
            .ok_or_else(too_large)?;
        if total > MAX_REGISTER_BATCH {
            return Err(too_large());
        }

        let mut ids = Vec::with_capacity(total as usize);
        for &scheme in schemes {
            for port in first_port..=last_port {
                for address in first_addr..=last_addr {
                    ids.push(ProxyId::new(scheme, Ipv4Addr::from(address), port));
                }
            }
        }

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url() {
        let id = ProxyParser::parse_url("socks5://192.168.1.1:1080").unwrap();
        assert_eq!(id.scheme, ProxyType::Socks5);
        assert_eq!(id.address, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(id.port, 1080);
    }

    #[test]
    fn test_parse_url_with_newline() {
        let id = ProxyParser::parse_url("http://10.0.0.1:8080\n").unwrap();
        assert_eq!(id.to_string(), "http://10.0.0.1:8080");
    }

    #[test]
    fn test_parse_url_invalid() {
        assert!(ProxyParser::parse_url("").is_none());
        assert!(ProxyParser::parse_url("192.168.1.1:8080").is_none());
        assert!(ProxyParser::parse_url("ftp://192.168.1.1:21").is_none());
        assert!(ProxyParser::parse_url("http://999.1.1.1:80").is_none());
        assert!(ProxyParser::parse_url("http://1.1.1.1:0").is_none());
        assert!(ProxyParser::parse_url("http://1.1.1.1:70000").is_none());
    }

    #[test]
    fn test_parse_result_line() {
        let line = r#"{"scheme":"http","address":"10.0.0.1","port":8080,"reachable":true,"speed":120}"#;
        let result = ProxyParser::parse_result_line(line).unwrap();
        assert!(result.reachable);
        assert_eq!(result.speed, 120.0);
    }

    #[test]
    fn test_parse_result_line_malformed() {
        assert!(ProxyParser::parse_result_line("").is_none());
        assert!(ProxyParser::parse_result_line("   ").is_none());
        assert!(ProxyParser::parse_result_line(r#"{"scheme":"http","addr"#).is_none());
        assert!(ProxyParser::parse_result_line("not json").is_none());
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(ProxyParser::parse_port_range("8080").unwrap(), (8080, 8080));
        assert_eq!(ProxyParser::parse_port_range("8000-8080").unwrap(), (8000, 8080));
        assert!(ProxyParser::parse_port_range("80-abc").is_err());
    }

    #[test]
    fn test_expand_range() {
        let ids = ProxyParser::expand_range(
            &[ProxyType::Http, ProxyType::Socks5],
            (Ipv4Addr::new(10, 0, 0, 254), Ipv4Addr::new(10, 0, 1, 1)),
            (80, 81),
        )
        .unwrap();

        // 2 schemes × 4 addresses × 2 ports
        assert_eq!(ids.len(), 16);
        assert!(ids.contains(&ProxyId::new(
            ProxyType::Socks5,
            Ipv4Addr::new(10, 0, 1, 0),
            81
        )));
    }

    #[test]
    fn test_expand_range_rejects_reversed() {
        assert!(ProxyParser::expand_range(
            &[ProxyType::Http],
            (Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1)),
            (80, 80),
        )
        .is_err());
        assert!(ProxyParser::expand_range(
            &[ProxyType::Http],
            (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 1)),
            (90, 80),
        )
        .is_err());
        assert!(ProxyParser::expand_range(
            &[ProxyType::Http],
            (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 1)),
            (0, 80),
        )
        .is_err());
    }

    #[test]
    fn test_expand_range_product_overflow() {
        // 2^18 schemes × 2^32 addresses × 2^16 ports does not fit in a u64
        let schemes = vec![ProxyType::Http; 1 << 18];
        let result = ProxyParser::expand_range(
            &schemes,
            (Ipv4Addr::new(0, 0, 0, 0), Ipv4Addr::new(255, 255, 255, 255)),
            (1, 65535),
        );
        assert!(matches!(result, Err(Error::InvalidRange(_))));
    }

    #[test]
    fn test_expand_range_limit() {
        assert!(ProxyParser::expand_range(
            &[ProxyType::Http],
            (Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 255, 255, 255)),
            (1, 65535),
        )
        .is_err());
    }
}
