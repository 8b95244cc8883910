//! Proxy health-check engine
//!
//! This module provides:
//! - Parsing of proxy URLs, checker output and registration ranges
//! - The rolling per-day speed/uptime statistics and the engine applying them
//! - The adapter driving the external checker process
//! - The scheduler picking which proxy to re-check next
//! - The paginated read model with cached counts

pub mod catalog;
pub mod checker;
pub mod counts;
pub mod models;
pub mod parser;
pub mod scheduler;
pub mod stats;

pub use catalog::{
    ProxyCatalog, ProxyPage, RegisterRequest, RegisterSummary, Sort, SortKey, SortOrder,
};
pub use checker::{CheckDispatcher, CheckerConfig, ProxyChecker, ResultSink};
pub use counts::{CountCache, CountsGuard};
pub use models::{CheckResult, ProxyId, ProxyRecord, ProxyType, ProxyView};
pub use parser::ProxyParser;
pub use scheduler::CheckScheduler;
pub use stats::{ProxyStats, StatsEngine};
