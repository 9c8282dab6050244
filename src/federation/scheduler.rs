//! Retry scheduling for the delivery queue
//!
//! Decides which STANDBY rows may be attempted, claims them, delivers them
//! and records the outcome. Row state only changes through
//! `Database::claim` / `Database::complete` / `Database::delete_queue_item`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};

use super::delivery::ActivityDelivery;
use super::instance::Instance;
use crate::data::{Database, DeliveryToken, QueueItem, QueueStatus};
use crate::error::AppError;
use crate::metrics::DELIVERY_ATTEMPTS_TOTAL;

/// Host groups processed at once during a sweep.
const MAX_CONCURRENT_HOSTS: usize = 10;

/// Delay before a row with `tries` failures may be retried: `floor(tries^4 / 3)` seconds.
pub fn backoff(tries: u32) -> Duration {
    Duration::from_secs(u64::from(tries).saturating_pow(4) / 3)
}

/// Whether `item`'s backoff has elapsed at `now`.
pub fn is_eligible(item: &QueueItem, now: DateTime<Utc>) -> bool {
    let Ok(wait) = chrono::Duration::from_std(backoff(item.tries)) else {
        return false;
    };
    now.signed_duration_since(item.last) >= wait
}

/// Hosts that already failed during one processing pass.
///
/// Process-local and short-lived: one per `request()`, per token job and
/// per sweep group. It never outlives the pass that created it.
#[derive(Debug, Default)]
pub struct HostFailures {
    failed: HashSet<String>,
}

impl HostFailures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_failed(&mut self, address: &str) {
        self.failed.insert(address.to_string());
    }

    pub fn has_failed(&self, address: &str) -> bool {
        self.failed.contains(address)
    }
}

/// What happened to one row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 2xx; row is SUCCESS
    Delivered,
    /// Failed; row is back in STANDBY with one more try
    Retrying,
    /// 410; row deleted
    Gone,
    /// Host already failed in this pass; row untouched
    SkippedHost,
    /// Someone else owns the row
    Conflict,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Delivered => "delivered",
            AttemptOutcome::Retrying => "retrying",
            AttemptOutcome::Gone => "gone",
            AttemptOutcome::SkippedHost => "skipped_host",
            AttemptOutcome::Conflict => "conflict",
        }
    }
}

/// Tally of one processing pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProcessSummary {
    pub delivered: usize,
    pub retrying: usize,
    pub gone: usize,
    pub skipped: usize,
    pub conflicts: usize,
}

impl ProcessSummary {
    pub fn record(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Delivered => self.delivered += 1,
            AttemptOutcome::Retrying => self.retrying += 1,
            AttemptOutcome::Gone => self.gone += 1,
            AttemptOutcome::SkippedHost => self.skipped += 1,
            AttemptOutcome::Conflict => self.conflicts += 1,
        }
    }

    fn merge(&mut self, other: ProcessSummary) {
        self.delivered += other.delivered;
        self.retrying += other.retrying;
        self.gone += other.gone;
        self.skipped += other.skipped;
        self.conflicts += other.conflicts;
    }

    pub fn attempted(&self) -> usize {
        self.delivered + self.retrying + self.gone
    }
}

/// Retry scheduler
#[derive(Clone)]
pub struct RetryScheduler {
    db: Arc<Database>,
    delivery: ActivityDelivery,
}

impl RetryScheduler {
    pub fn new(db: Arc<Database>, delivery: ActivityDelivery) -> Self {
        Self { db, delivery }
    }

    /// Claim, deliver and settle one row.
    ///
    /// A lost claim race or a lost completion race is reported as
    /// `AttemptOutcome::Conflict`, never as an error.
    ///
    /// # Errors
    /// Only database failures.
    pub async fn attempt(
        &self,
        item: &QueueItem,
        failures: &mut HostFailures,
        timeout: Option<Duration>,
    ) -> Result<AttemptOutcome, AppError> {
        let address = item.instance.address.as_str();

        if failures.has_failed(address) {
            tracing::debug!(item_id = item.id, address, "Skipping row for failed host");
            return Ok(AttemptOutcome::SkippedHost);
        }

        match self.db.claim(item).await {
            Ok(()) => {}
            Err(AppError::QueueConflict) => {
                tracing::debug!(item_id = item.id, "Row already claimed elsewhere");
                return Ok(AttemptOutcome::Conflict);
            }
            Err(e) => return Err(e),
        }

        let outcome = match self.delivery.deliver(item, timeout).await {
            Ok(response) if response.is_success() => {
                self.settle(item, true, AttemptOutcome::Delivered).await?
            }
            Err(AppError::PermanentlyGone) => {
                self.db.delete_queue_item(item).await?;
                tracing::info!(
                    item_id = item.id,
                    uri = %item.instance.uri,
                    "Target is gone, dropped queue row"
                );
                AttemptOutcome::Gone
            }
            Ok(response) => {
                failures.mark_failed(address);
                tracing::warn!(
                    item_id = item.id,
                    address,
                    status = response.code,
                    tries = item.tries,
                    "Delivery rejected"
                );
                self.settle(item, false, AttemptOutcome::Retrying).await?
            }
            Err(AppError::Transport(e)) => {
                failures.mark_failed(address);
                tracing::warn!(
                    item_id = item.id,
                    address,
                    error = %e,
                    tries = item.tries,
                    "Delivery failed"
                );
                self.settle(item, false, AttemptOutcome::Retrying).await?
            }
            Err(e) => {
                tracing::warn!(item_id = item.id, error = %e, "Delivery could not be sent");
                self.settle(item, false, AttemptOutcome::Retrying).await?
            }
        };

        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&[item.instance.path_type.as_str(), outcome.as_str()])
            .inc();
        Ok(outcome)
    }

    async fn settle(
        &self,
        item: &QueueItem,
        success: bool,
        outcome: AttemptOutcome,
    ) -> Result<AttemptOutcome, AppError> {
        match self.db.complete(item, success).await {
            Ok(()) => Ok(outcome),
            Err(AppError::QueueConflict) => {
                tracing::debug!(item_id = item.id, "Row settled elsewhere");
                Ok(AttemptOutcome::Conflict)
            }
            Err(e) => Err(e),
        }
    }

    /// Attempt every eligible STANDBY row of one token.
    pub async fn process_token(&self, token: &DeliveryToken) -> Result<ProcessSummary, AppError> {
        let now = Utc::now();
        let rows: Vec<QueueItem> = self
            .db
            .list_by_token(token, Some(QueueStatus::Standby))
            .await?
            .into_iter()
            .filter(|item| is_eligible(item, now))
            .collect();

        let summary = self.process_rows(rows).await?;
        tracing::debug!(token = %token, ?summary, "Processed delivery token");
        Ok(summary)
    }

    /// Attempt every eligible STANDBY row in the queue.
    pub async fn process_eligible(&self) -> Result<ProcessSummary, AppError> {
        let rows = self.db.list_eligible_standby(Utc::now()).await?;
        let summary = self.process_rows(rows).await?;
        if summary.attempted() > 0 {
            tracing::info!(?summary, "Delivery sweep finished");
        }
        Ok(summary)
    }

    /// Rows are batched per host; hosts run concurrently, rows of one host
    /// run in order and stop at the first failure.
    async fn process_rows(&self, rows: Vec<QueueItem>) -> Result<ProcessSummary, AppError> {
        let instances = Instance::group(rows.iter().map(|item| item.instance.clone()));
        let mut batches: Vec<Vec<QueueItem>> = instances.iter().map(|_| Vec::new()).collect();
        for item in rows {
            if let Some(index) = instances
                .iter()
                .position(|instance| instance.address == item.instance.address)
            {
                batches[index].push(item);
            }
        }

        let results: Vec<Result<ProcessSummary, AppError>> = stream::iter(batches)
            .map(|batch| self.process_host(batch))
            .buffer_unordered(MAX_CONCURRENT_HOSTS)
            .collect()
            .await;

        let mut summary = ProcessSummary::default();
        for result in results {
            summary.merge(result?);
        }
        Ok(summary)
    }

    async fn process_host(&self, batch: Vec<QueueItem>) -> Result<ProcessSummary, AppError> {
        let mut failures = HostFailures::new();
        let mut summary = ProcessSummary::default();
        for item in &batch {
            summary.record(self.attempt(item, &mut failures, None).await?);
        }
        Ok(summary)
    }
}
