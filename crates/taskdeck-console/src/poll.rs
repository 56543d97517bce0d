use crate::api::{ApiClient, ApiError};
use crate::service::{stopped, DashboardEvent};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use taskdeck_core::{ParseReport, WireError};
use taskdeck_engine::{SnapshotBatch, Update};
use tokio::{
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollKind {
    Tasks,
    ProcessMetrics,
    Metrics,
}

impl PollKind {
    pub const ALL: [PollKind; 3] = [PollKind::Tasks, PollKind::ProcessMetrics, PollKind::Metrics];

    pub fn as_str(&self) -> &'static str {
        match self {
            PollKind::Tasks => "tasks",
            PollKind::ProcessMetrics => "process_metrics",
            PollKind::Metrics => "metrics",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub tasks: Duration,
    pub process_metrics: Duration,
    pub metrics: Duration,
}

impl PollIntervals {
    pub fn for_kind(&self, kind: PollKind) -> Duration {
        match kind {
            PollKind::Tasks => self.tasks,
            PollKind::ProcessMetrics => self.process_metrics,
            PollKind::Metrics => self.metrics,
        }
    }
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            tasks: Duration::from_secs(2),
            process_metrics: Duration::from_secs(5),
            metrics: Duration::from_secs(5),
        }
    }
}

/// Fetches full snapshots on a fixed period, one task per kind.
#[derive(Clone)]
pub struct PollingClient {
    api: ApiClient,
}

impl PollingClient {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// One authenticated fetch turned into a snapshot update.
    pub async fn poll(&self, kind: PollKind) -> Result<Update, ApiError> {
        let batch = match kind {
            PollKind::Tasks => {
                SnapshotBatch::Tasks(log_dropped(kind, self.api.fetch_tasks().await?))
            }
            PollKind::ProcessMetrics => SnapshotBatch::ProcessMetrics(log_dropped(
                kind,
                self.api.fetch_process_metrics().await?,
            )),
            PollKind::Metrics => SnapshotBatch::SystemMetrics(self.api.fetch_system_metrics().await?),
        };
        Ok(Update::Snapshot {
            batch,
            observed_at: Utc::now(),
        })
    }

    /// Polls `kind` every `period` until shutdown is signalled or the
    /// receiver goes away. A slow poll skips ticks instead of queueing them.
    ///
    /// `refresh` pulls the next poll forward. It only reaches a poller that is
    /// idle: `notify_waiters` stores no permit, so a refresh that lands while
    /// a request is in flight is dropped rather than queued.
    pub fn spawn(
        &self,
        kind: PollKind,
        period: Duration,
        tx: mpsc::Sender<DashboardEvent>,
        refresh: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = refresh.notified() => {
                        debug!(event = "poll_refresh", kind = kind.as_str());
                        ticker.reset();
                    }
                    _ = stopped(&mut shutdown) => break,
                }
                let result = tokio::select! {
                    result = client.poll(kind) => result,
                    _ = stopped(&mut shutdown) => break,
                };
                match result {
                    Ok(update) => {
                        if tx.send(DashboardEvent::Update(update)).await.is_err() {
                            break;
                        }
                    }
                    Err(ApiError::Unauthenticated) => {
                        debug!(event = "poll_skipped", kind = kind.as_str(), reason = "no_token");
                    }
                    Err(err) => {
                        warn!(event = "poll_failed", kind = kind.as_str(), error = %err);
                    }
                }
            }
            debug!(event = "poll_stopped", kind = kind.as_str());
        })
    }
}

fn log_dropped<T>(kind: PollKind, report: ParseReport<T>) -> Vec<T> {
    for err in &report.errors {
        log_wire_error(kind, err);
    }
    report.items
}

fn log_wire_error(kind: PollKind, err: &WireError) {
    warn!(event = "poll_malformed_element", kind = kind.as_str(), error = %err);
}
