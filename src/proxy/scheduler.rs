//! Recurring dispatch of the stalest proxy to the checker

use crate::database::ProxyStore;
use crate::proxy::checker::CheckDispatcher;
use crate::proxy::models::ProxyId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timer that sends the least recently updated proxy to the checker once per interval
pub struct CheckScheduler {
    cancel: CancellationToken,
}

impl CheckScheduler {
    /// Start ticking. The first tick fires one interval from now.
    pub fn start(
        interval: Duration,
        store: Arc<dyn ProxyStore>,
        dispatcher: Arc<dyn CheckDispatcher>,
    ) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        tokio::spawn(run(interval, store, dispatcher, cancel.clone()));

        info!(interval_ms = interval.as_millis() as u64, "check scheduler started");
        Self { cancel }
    }

    /// Cancel future ticks. In-flight checks are not affected.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            info!("check scheduler stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for CheckScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    period: Duration,
    store: Arc<dyn ProxyStore>,
    dispatcher: Arc<dyn CheckDispatcher>,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                dispatch_next(store.as_ref(), dispatcher.as_ref()).await;
            }
        }
    }
}

/// Run one tick: look up the stalest proxy and enqueue it.
///
/// Lookup failures and an empty store skip the tick; the next one tries again.
pub async fn dispatch_next(
    store: &dyn ProxyStore,
    dispatcher: &dyn CheckDispatcher,
) -> Option<ProxyId> {
    let record = match store.find_least_recently_updated().await {
        Ok(Some(record)) => record,
        Ok(None) => {
            debug!("no proxies to check");
            return None;
        }
        Err(err) => {
            debug!(%err, "skipping check tick");
            return None;
        }
    };

    match dispatcher.enqueue(&record.id) {
        Ok(()) => {
            debug!(proxy = %record.id, "dispatched check");
            Some(record.id)
        }
        Err(err) => {
            warn!(proxy = %record.id, %err, "failed to dispatch check");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ProxyDatabase;
    use crate::error::Result;
    use crate::proxy::models::{ProxyRecord, ProxyType};
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDispatcher {
        sent: Mutex<Vec<ProxyId>>,
    }

    impl RecordingDispatcher {
        fn sent(&self) -> Vec<ProxyId> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl CheckDispatcher for RecordingDispatcher {
        fn enqueue(&self, proxy: &ProxyId) -> Result<()> {
            self.sent.lock().unwrap().push(*proxy);
            Ok(())
        }
    }

    fn sample_id() -> ProxyId {
        ProxyId::new(ProxyType::Http, Ipv4Addr::new(10, 0, 0, 1), 8080)
    }

    #[tokio::test]
    async fn test_dispatch_next_empty_store() {
        let db = ProxyDatabase::in_memory().await.unwrap();
        let dispatcher = RecordingDispatcher::default();

        assert!(dispatch_next(&db, &dispatcher).await.is_none());
        assert!(dispatcher.sent().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_next_sends_stalest() {
        let db = ProxyDatabase::in_memory().await.unwrap();
        let now = Utc::now();
        let stale = ProxyId::new(ProxyType::Socks4, Ipv4Addr::new(10, 0, 0, 2), 1080);
        db.insert(&ProxyRecord::new(sample_id(), now)).await.unwrap();
        db.insert(&ProxyRecord::new(stale, now - chrono::Duration::hours(1)))
            .await
            .unwrap();
        let dispatcher = RecordingDispatcher::default();

        assert_eq!(dispatch_next(&db, &dispatcher).await, Some(stale));
        assert_eq!(dispatcher.sent(), vec![stale]);
    }

    #[tokio::test]
    async fn test_scheduler_ticks_until_stopped() {
        let db = Arc::new(ProxyDatabase::in_memory().await.unwrap());
        db.insert(&ProxyRecord::new(sample_id(), Utc::now())).await.unwrap();
        let dispatcher = Arc::new(RecordingDispatcher::default());

        let scheduler = CheckScheduler::start(Duration::from_millis(20), db, dispatcher.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!dispatcher.sent().is_empty());
        assert!(dispatcher.sent().iter().all(|id| *id == sample_id()));

        scheduler.stop();
        scheduler.stop();
        assert!(scheduler.is_stopped());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_stop = dispatcher.sent().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.sent().len(), after_stop);
    }
}
