//! Proxy Monitor - Proxy Catalog and Health Checker
//!
//! Keeps a catalog of proxies, re-checks the stalest one on a fixed interval
//! through an external checker process, and ranks proxies by a rolling window
//! of daily speed and uptime.

pub mod database;
pub mod error;
pub mod logging;
pub mod proxy;

pub use error::{Error, Result};
pub use proxy::*;

use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database file path or URL
    pub database_url: String,
    /// Time between two scheduled checks
    pub check_interval: Duration,
    /// Proxies per listing page
    pub page_size: u64,
    /// Checker process settings
    pub checker: CheckerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "proxies.db".to_string(),
            check_interval: Duration::from_secs(60),
            page_size: proxy::catalog::DEFAULT_PAGE_SIZE,
            checker: CheckerConfig::default(),
        }
    }
}
