//! Background delivery workers
//!
//! The dispatcher and the async trigger endpoint push `DeliveryJob`s onto a
//! channel; a fixed pool of workers drains it through the retry scheduler.
//! A sweeper periodically releases stale claims and schedules a full pass
//! over every eligible row.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::scheduler::RetryScheduler;
use crate::data::{Database, DeliveryToken};

/// A unit of work consumed by workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryJob {
    /// Attempt the eligible rows of one token
    Token(DeliveryToken),
    /// Attempt every eligible row in the queue
    Sweep,
}

/// Sending half of the job channel
#[derive(Debug, Clone)]
pub struct DeliveryTrigger {
    tx: mpsc::UnboundedSender<DeliveryJob>,
}

impl DeliveryTrigger {
    /// Create a trigger and the receiver the workers consume.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeliveryJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Hand a token's remaining rows to the workers.
    ///
    /// Returns `false` when no worker pool is listening; the rows stay
    /// queued and the next sweep picks them up.
    pub fn trigger(&self, token: DeliveryToken) -> bool {
        self.send(DeliveryJob::Token(token))
    }

    pub fn sweep(&self) -> bool {
        self.send(DeliveryJob::Sweep)
    }

    fn send(&self, job: DeliveryJob) -> bool {
        match self.tx.send(job) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(job = ?e.0, "Delivery workers are not running");
                false
            }
        }
    }
}

/// Main worker loop.
pub async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<DeliveryJob>>>,
    scheduler: RetryScheduler,
) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(job) = job else { break };

        let result = match &job {
            DeliveryJob::Token(token) => scheduler.process_token(token).await,
            DeliveryJob::Sweep => scheduler.process_eligible().await,
        };

        if let Err(e) = result {
            tracing::error!(worker = id, ?job, error = %e, "Delivery job failed");
        }
    }

    tracing::debug!(worker = id, "Delivery worker stopped");
}

/// Spawn `count` workers sharing one receiver.
pub fn spawn_workers(
    scheduler: RetryScheduler,
    rx: mpsc::UnboundedReceiver<DeliveryJob>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    let handles = (0..count.max(1))
        .map(|id| tokio::spawn(worker_loop(id, rx.clone(), scheduler.clone())))
        .collect::<Vec<_>>();

    tracing::info!(workers = handles.len(), "Delivery workers spawned");
    handles
}

/// Spawn the periodic sweeper.
///
/// Each tick returns RUNNING rows older than `stale_after` to STANDBY and
/// then schedules a sweep.
pub fn spawn_sweeper(
    db: Arc<Database>,
    trigger: DeliveryTrigger,
    interval: Duration,
    stale_after: Duration,
) -> JoinHandle<()> {
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);

        loop {
            interval.tick().await;

            match db.release_stale(stale_after).await {
                Ok(released) if released > 0 => {
                    tracing::info!(released, "Released stale delivery claims");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Failed to release stale claims"),
            }

            if !trigger.sweep() {
                break;
            }
        }
    });

    tracing::info!("Delivery sweeper spawned");
    handle
}
