//! Read model and bulk registration
//!
//! Results carry HTTP-style status codes so a router can pass them through
//! unchanged.

use crate::database::ProxyStore;
use crate::error::Result;
use crate::proxy::counts::CountCache;
use crate::proxy::models::{ProxyId, ProxyRecord, ProxyType, ProxyView};
use crate::proxy::parser::ProxyParser;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

/// Default number of proxies per page
pub const DEFAULT_PAGE_SIZE: u64 = 10;

/// Number of inserts in flight during registration
const REGISTER_CONCURRENCY: usize = 16;

/// Status returned for an accepted registration
pub const ACCEPTED: u16 = 202;

/// Column a listing is ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Recency,
    Speed,
    Uptime,
}

impl SortKey {
    /// Parse a sort key, falling back to the default for unknown values
    pub fn parse_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "recency" | "updated" | "updatedat" => SortKey::Recency,
            "speed" => SortKey::Speed,
            "uptime" => SortKey::Uptime,
            _ => SortKey::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "asc" => SortOrder::Asc,
            "desc" => SortOrder::Desc,
            _ => SortOrder::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sort {
    pub key: SortKey,
    pub order: SortOrder,
}

impl Sort {
    pub fn parse_or_default(key: &str, order: &str) -> Self {
        Self {
            key: SortKey::parse_or_default(key),
            order: SortOrder::parse_or_default(order),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Ok,
    NotFound,
}

impl PageStatus {
    pub fn http_status(&self) -> u16 {
        match self {
            PageStatus::Ok => 200,
            PageStatus::NotFound => 404,
        }
    }
}

/// One page of the proxy listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyPage {
    #[serde(skip)]
    pub status: PageStatus,
    pub proxies: Vec<ProxyView>,
    pub page: u64,
    pub total_pages: u64,
}

/// Register every combination of schemes, addresses and ports
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisterRequest {
    pub schemes: Vec<ProxyType>,
    /// Inclusive address range
    pub addresses: (Ipv4Addr, Ipv4Addr),
    /// Inclusive port range
    pub ports: (u16, u16),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegisterSummary {
    pub inserted: u64,
    /// Triples that already existed
    pub duplicates: u64,
    /// Triples the store failed to insert
    pub failed: u64,
}

impl RegisterSummary {
    /// Registration is always accepted, whatever was skipped
    pub fn http_status(&self) -> u16 {
        ACCEPTED
    }
}

/// Read and registration entry points over the proxy store
pub struct ProxyCatalog {
    store: Arc<dyn ProxyStore>,
    counts: Arc<CountCache>,
    page_size: u64,
}

impl ProxyCatalog {
    pub fn new(store: Arc<dyn ProxyStore>, counts: Arc<CountCache>, page_size: u64) -> Self {
        Self {
            store,
            counts,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// List one page of proxies.
    ///
    /// An empty store yields an empty page with status 200; a page past the end
    /// of a non-empty store yields an empty page with status 404.
    pub async fn list_proxies(
        &self,
        page_size: u64,
        page: u64,
        good_only: bool,
        sort: Sort,
    ) -> Result<ProxyPage> {
        let page_size = page_size.max(1);
        let total = self.counts.count(self.store.as_ref(), good_only).await?;
        let total_pages = total.div_ceil(page_size);

        if page >= total_pages {
            let status = if total_pages == 0 {
                PageStatus::Ok
            } else {
                PageStatus::NotFound
            };
            return Ok(ProxyPage {
                status,
                proxies: Vec::new(),
                page,
                total_pages,
            });
        }

        let records = self
            .store
            .list_page(good_only, sort, page * page_size, page_size)
            .await?;

        Ok(ProxyPage {
            status: PageStatus::Ok,
            proxies: records.iter().map(ProxyView::from).collect(),
            page,
            total_pages,
        })
    }

    /// List a page using the configured page size
    pub async fn get_page(&self, page: u64, good_only: bool, sort: Sort) -> Result<ProxyPage> {
        self.list_proxies(self.page_size, page, good_only, sort).await
    }

    pub async fn count(&self, good_only: bool) -> Result<u64> {
        self.counts.count(self.store.as_ref(), good_only).await
    }

    /// Insert new proxies for every triple in the request.
    ///
    /// Existing triples are skipped one by one; the batch as a whole succeeds.
    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterSummary> {
        let ids = ProxyParser::expand_range(&request.schemes, request.addresses, request.ports)?;
        Ok(self.register_ids(ids).await)
    }

    /// Insert the given proxies, skipping those already present
    pub async fn register_ids(&self, ids: Vec<ProxyId>) -> RegisterSummary {
        let now = Utc::now();
        let store = self.store.as_ref();
        let mut counts = self.counts.write().await;

        let outcomes = stream::iter(ids)
            .map(|id| async move { (id, store.insert(&ProxyRecord::new(id, now)).await) })
            .buffer_unordered(REGISTER_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let mut summary = RegisterSummary::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(true) => summary.inserted += 1,
                Ok(false) => summary.duplicates += 1,
                Err(err) => {
                    warn!(proxy = %id, %err, "failed to register proxy");
                    summary.failed += 1;
                }
            }
        }

        if summary.inserted > 0 {
            counts.adjust_total(summary.inserted as i64);
        }
        drop(counts);

        info!(
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            failed = summary.failed,
            "registered proxies"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ProxyDatabase;
    use crate::proxy::models::CheckResult;
    use crate::proxy::stats::StatsEngine;

    async fn catalog() -> (ProxyCatalog, StatsEngine) {
        let db: Arc<dyn ProxyStore> = Arc::new(ProxyDatabase::in_memory().await.unwrap());
        let counts = Arc::new(CountCache::default());
        let engine = StatsEngine::new(db.clone(), counts.clone());
        (ProxyCatalog::new(db, counts, DEFAULT_PAGE_SIZE), engine)
    }

    fn request(last: u8, ports: (u16, u16)) -> RegisterRequest {
        RegisterRequest {
            schemes: vec![ProxyType::Http],
            addresses: (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, last)),
            ports,
        }
    }

    #[test]
    fn test_sort_fallback() {
        assert_eq!(
            Sort::parse_or_default("speed", "asc"),
            Sort {
                key: SortKey::Speed,
                order: SortOrder::Asc,
            }
        );
        assert_eq!(
            Sort::parse_or_default("name; DROP TABLE", "sideways"),
            Sort::default()
        );
        assert_eq!(Sort::default().key, SortKey::Recency);
        assert_eq!(Sort::default().order, SortOrder::Desc);
    }

    #[test]
    fn test_register_request_from_json() {
        let json = r#"{"schemes":["http","socks5"],"addresses":["10.0.0.1","10.0.0.9"],"ports":[80,81]}"#;
        let request: RegisterRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.schemes, vec![ProxyType::Http, ProxyType::Socks5]);
        assert_eq!(request.addresses.1, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(request.ports, (80, 81));
    }

    #[tokio::test]
    async fn test_empty_store_page() {
        let (catalog, _) = catalog().await;
        let page = catalog.list_proxies(10, 0, false, Sort::default()).await.unwrap();

        assert_eq!(page.status, PageStatus::Ok);
        assert_eq!(page.status.http_status(), 200);
        assert!(page.proxies.is_empty());
        assert_eq!(page.total_pages, 0);
    }

    #[tokio::test]
    async fn test_page_out_of_range() {
        let (catalog, _) = catalog().await;
        catalog.register(&request(15, (8080, 8080))).await.unwrap();

        let page = catalog.list_proxies(10, 5, false, Sort::default()).await.unwrap();
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.status, PageStatus::NotFound);
        assert_eq!(page.status.http_status(), 404);
        assert!(page.proxies.is_empty());

        let last = catalog.get_page(1, false, Sort::default()).await.unwrap();
        assert_eq!(last.status, PageStatus::Ok);
        assert_eq!(last.proxies.len(), 5);
    }

    #[tokio::test]
    async fn test_register_skips_duplicates() {
        let (catalog, _) = catalog().await;

        let first = catalog.register(&request(2, (80, 81))).await.unwrap();
        assert_eq!(first, RegisterSummary {
                inserted: 4,
                duplicates: 0,
                failed: 0,
            });
        assert_eq!(catalog.count(false).await.unwrap(), 4);

        let second = catalog.register(&request(3, (80, 81))).await.unwrap();
        assert_eq!(second, RegisterSummary {
                inserted: 2,
                duplicates: 4,
                failed: 0,
            });
        assert_eq!(catalog.count(false).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_range() {
        let (catalog, _) = catalog().await;
        assert!(catalog.register(&request(1, (81, 80))).await.is_err());
        assert_eq!(catalog.count(false).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_good_only_listing() {
        let (catalog, engine) = catalog().await;
        catalog.register(&request(3, (8080, 8080))).await.unwrap();
        assert_eq!(catalog.count(true).await.unwrap(), 0);

        let good = ProxyId::new(ProxyType::Http, Ipv4Addr::new(10, 0, 0, 2), 8080);
        let bad = ProxyId::new(ProxyType::Http, Ipv4Addr::new(10, 0, 0, 3), 8080);
        engine
            .apply_check_result(&CheckResult::reachable(good, 123.456))
            .await
            .unwrap();
        engine
            .apply_check_result(&CheckResult::unreachable(bad))
            .await
            .unwrap();

        let page = catalog.get_page(0, true, Sort::default()).await.unwrap();
        assert_eq!(page.total_pages, 1);
        assert_eq!(page.proxies.len(), 1);
        let view = &page.proxies[0];
        assert_eq!(view.address, "http://10.0.0.2:8080");
        assert_eq!(view.speed.as_deref(), Some("123.46"));
        assert_eq!(view.uptime.as_deref(), Some("1.00"));

        let all = catalog.get_page(0, false, Sort::default()).await.unwrap();
        assert_eq!(all.proxies.len(), 3);
    }
}
