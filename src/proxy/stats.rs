//! Rolling per-proxy statistics
//!
//! Every proxy keeps an in-progress accumulator for the current UTC day and a
//! bounded window of finalized days. A check result is folded into today's
//! accumulator; the first result of a new day moves the previous day into the
//! window instead.

use crate::database::ProxyStore;
use crate::error::{Error, Result};
use crate::proxy::checker::ResultSink;
use crate::proxy::counts::CountCache;
use crate::proxy::models::{CheckResult, ProxyRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Number of finalized days kept per proxy
pub const HISTORY_DAYS: usize = 7;

/// A single check outcome reduced to what the statistics need
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckSample {
    /// Measured speed, `None` when the check produced no usable sample
    pub speed: Option<f64>,
    pub up: bool,
}

impl CheckSample {
    pub fn up(speed: f64) -> Self {
        Self {
            speed: (speed.is_finite() && speed > 0.0).then_some(speed),
            up: true,
        }
    }

    pub fn down() -> Self {
        Self {
            speed: None,
            up: false,
        }
    }

    pub fn from_result(result: &CheckResult) -> Self {
        if result.reachable {
            Self::up(result.speed)
        } else {
            Self::down()
        }
    }

    fn uptime(&self) -> f64 {
        if self.up {
            1.0
        } else {
            0.0
        }
    }
}

/// Accumulator and history state of one proxy
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProxyStats {
    /// Checks folded into today's accumulator; `None` until the first check
    pub today_checks: Option<u32>,
    /// Mean of today's positive speed samples
    pub today_speed: Option<f64>,
    /// Number of samples behind `today_speed`
    pub today_speed_samples: u32,
    /// Fraction of today's checks that succeeded
    pub today_uptime: f64,
    /// Finalized daily speeds, oldest first
    pub speed_history: Vec<Option<f64>>,
    /// Finalized daily uptimes, oldest first
    pub uptime_history: Vec<f64>,
}

impl ProxyStats {
    /// Fold a new sample taken at `now` into stats last written at `last_update`
    pub fn fold(
        &self,
        sample: CheckSample,
        last_update: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        match self.today_checks {
            Some(checks) if checks > 0 && same_day(last_update, now) => {
                self.fold_same_day(checks, sample)
            }
            Some(checks) if checks > 0 => self.roll_over(sample),
            _ => Self::first_of_day(sample, Vec::new(), Vec::new()),
        }
    }

    fn first_of_day(
        sample: CheckSample,
        speed_history: Vec<Option<f64>>,
        uptime_history: Vec<f64>,
    ) -> Self {
        Self {
            today_checks: Some(1),
            today_speed: sample.speed,
            today_speed_samples: u32::from(sample.speed.is_some()),
            today_uptime: sample.uptime(),
            speed_history,
            uptime_history,
        }
    }

    fn fold_same_day(&self, checks: u32, sample: CheckSample) -> Self {
        let n = f64::from(checks);
        let today_uptime = (self.today_uptime * n + sample.uptime()) / (n + 1.0);

        // A missing speed sample only counts against uptime
        let (today_speed, today_speed_samples) = match (self.today_speed, sample.speed) {
            (Some(mean), Some(speed)) if self.today_speed_samples > 0 => {
                let k = f64::from(self.today_speed_samples);
                (
                    Some((mean * k + speed) / (k + 1.0)),
                    self.today_speed_samples.saturating_add(1),
                )
            }
            (_, Some(speed)) => (Some(speed), 1),
            (mean, None) => (mean, self.today_speed_samples),
        };

        Self {
            today_checks: Some(checks.saturating_add(1)),
            today_speed,
            today_speed_samples,
            today_uptime,
            speed_history: self.speed_history.clone(),
            uptime_history: self.uptime_history.clone(),
        }
    }

    fn roll_over(&self, sample: CheckSample) -> Self {
        let mut speed_history = self.speed_history.clone();
        let mut uptime_history = self.uptime_history.clone();
        speed_history.push(self.today_speed);
        uptime_history.push(self.today_uptime);
        keep_last(&mut speed_history, HISTORY_DAYS);
        keep_last(&mut uptime_history, HISTORY_DAYS);

        Self::first_of_day(sample, speed_history, uptime_history)
    }

    /// Whether today's accumulator holds any check
    pub fn is_checked(&self) -> bool {
        self.today_checks.is_some_and(|checks| checks > 0)
    }

    fn today(&self) -> Option<(Option<f64>, f64)> {
        self.is_checked()
            .then_some((self.today_speed, self.today_uptime))
    }

    /// Mean speed over the window and today, skipping days with no speed sample
    pub fn average_speed(&self) -> Option<f64> {
        let speeds = self
            .speed_history
            .iter()
            .flatten()
            .copied()
            .chain(self.today().and_then(|(speed, _)| speed));
        mean(speeds)
    }

    /// Mean uptime over the window and today
    pub fn average_uptime(&self) -> Option<f64> {
        let uptimes = self
            .uptime_history
            .iter()
            .copied()
            .chain(self.today().map(|(_, uptime)| uptime));
        mean(uptimes)
    }

    /// A proxy is good when at least one retained check succeeded
    pub fn is_good(&self) -> bool {
        self.average_uptime().is_some_and(|uptime| uptime > 0.0)
    }
}

fn same_day(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.date_naive() == b.date_naive()
}

fn keep_last<T>(values: &mut Vec<T>, n: usize) {
    if values.len() > n {
        values.drain(..values.len() - n);
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0u32), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / f64::from(count))
}

/// Applies check results to stored proxies.
///
/// Read-modify-write cycles are serialized so two results for the same proxy
/// cannot overwrite each other.
pub struct StatsEngine {
    store: Arc<dyn ProxyStore>,
    counts: Arc<CountCache>,
    write_lock: Mutex<()>,
}

impl StatsEngine {
    pub fn new(store: Arc<dyn ProxyStore>, counts: Arc<CountCache>) -> Self {
        Self {
            store,
            counts,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn apply_check_result(&self, result: &CheckResult) -> Result<ProxyRecord> {
        self.apply_check_result_at(result, Utc::now()).await
    }

    /// Apply a result as if it arrived at `now`
    pub async fn apply_check_result_at(
        &self,
        result: &CheckResult,
        now: DateTime<Utc>,
    ) -> Result<ProxyRecord> {
        let id = result.proxy_id();
        let _guard = self.write_lock.lock().await;

        let record = self.store.find(&id).await?.ok_or(Error::NotFound(id))?;
        let was_good = record.is_good();

        let stats = record
            .stats
            .fold(CheckSample::from_result(result), record.updated_at, now);
        let updated = ProxyRecord {
            stats,
            updated_at: now,
            ..record
        };

        // A count refresh must not land between the write and the adjustment
        let mut counts = self.counts.write().await;
        self.store.update_stats(&updated).await?;

        let is_good = updated.is_good();
        if was_good != is_good {
            debug!(proxy = %id, is_good, "proxy changed good status");
            counts.adjust_good(if is_good { 1 } else { -1 });
        }

        Ok(updated)
    }
}

#[async_trait]
impl ResultSink for StatsEngine {
    async fn on_result(&self, result: CheckResult) -> Result<()> {
        self.apply_check_result(&result).await.map(|_| ())
    }
}
