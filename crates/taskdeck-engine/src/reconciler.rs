use crate::store::{ChangeEvent, PresentationStore, StoredTask};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use taskdeck_core::{MetricSample, SystemMetrics, TaskErrorEvent, TaskId, TaskRecord, UpdateSource};
use tracing::{debug, info};

pub const DEFAULT_EVICTION_MISSES: u32 = 2;
pub const DEFAULT_LOCAL_AUTHORITY_WINDOW_SECS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Consecutive task snapshots an id may be absent from before it is evicted.
    pub eviction_misses: u32,
    /// How long a local-command write outranks push and poll updates.
    pub local_authority_window: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            eviction_misses: DEFAULT_EVICTION_MISSES,
            local_authority_window: Duration::seconds(DEFAULT_LOCAL_AUTHORITY_WINDOW_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotBatch {
    Tasks(Vec<TaskRecord>),
    ProcessMetrics(Vec<MetricSample>),
    SystemMetrics(Option<SystemMetrics>),
}

impl SnapshotBatch {
    pub fn kind(&self) -> &'static str {
        match self {
            SnapshotBatch::Tasks(_) => "tasks",
            SnapshotBatch::ProcessMetrics(_) => "process_metrics",
            SnapshotBatch::SystemMetrics(_) => "metrics",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Snapshot {
        batch: SnapshotBatch,
        observed_at: DateTime<Utc>,
    },
    Delta {
        record: TaskRecord,
        source: UpdateSource,
        observed_at: DateTime<Utc>,
    },
    /// The API confirmed a delete issued from this dashboard.
    Removed {
        id: TaskId,
        observed_at: DateTime<Utc>,
    },
    TaskError(TaskErrorEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    StaleRevision,
    TerminalLocked,
    LocalAuthority,
    LowerPrecedence,
    Tombstoned,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::StaleRevision => "stale_revision",
            RejectReason::TerminalLocked => "terminal_locked",
            RejectReason::LocalAuthority => "local_authority",
            RejectReason::LowerPrecedence => "lower_precedence",
            RejectReason::Tombstoned => "tombstoned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    Unchanged,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MissingMark {
    since: DateTime<Utc>,
    misses: u32,
}

/// Decides whether `incoming` may replace `existing`. The order is
/// local-command > push > poll, then revision, then arrival.
pub fn accept(
    existing: &StoredTask,
    incoming: &TaskRecord,
    observed_at: DateTime<Utc>,
    config: &ReconcilerConfig,
) -> Result<(), RejectReason> {
    let stored = &existing.record;
    if stored.source == UpdateSource::LocalCommand
        && incoming.source != UpdateSource::LocalCommand
        && observed_at - existing.applied_at < config.local_authority_window
    {
        return Err(RejectReason::LocalAuthority);
    }
    if incoming.source == UpdateSource::LocalCommand {
        return Ok(());
    }
    if stored.is_terminal() && incoming.revision <= stored.revision {
        return Err(RejectReason::TerminalLocked);
    }
    if incoming.revision > stored.revision {
        return Ok(());
    }
    if incoming.revision < stored.revision {
        return Err(RejectReason::StaleRevision);
    }
    if incoming.source.rank() >= stored.source.rank() {
        Ok(())
    } else {
        Err(RejectReason::LowerPrecedence)
    }
}

/// Single writer of the presentation store.
#[derive(Debug, Default)]
pub struct Reconciler {
    config: ReconcilerConfig,
    store: PresentationStore,
    missing: HashMap<TaskId, MissingMark>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            store: PresentationStore::new(),
            missing: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn store(&self) -> &PresentationStore {
        &self.store
    }

    /// Applies one update and returns the change events it produced, in order.
    pub fn apply(&mut self, update: Update) -> Vec<ChangeEvent> {
        match update {
            Update::Snapshot { batch, observed_at } => self.apply_snapshot(batch, observed_at),
            Update::Delta {
                record,
                source,
                observed_at,
            } => {
                let (_, event) = self.apply_record(record, source, observed_at);
                event.into_iter().collect()
            }
            Update::Removed { id, observed_at } => {
                self.missing.remove(&id);
                let event = self.store.remove(&id);
                debug!(
                    event = "reconcile_remove",
                    task_id = %id,
                    observed_at = %observed_at,
                    removed = event.is_some(),
                );
                event.into_iter().collect()
            }
            Update::TaskError(event) => {
                debug!(event = "reconcile_task_error", task_id = %event.task_id);
                self.store.annotate_error(event).into_iter().collect()
            }
        }
    }

    /// Applies a single record through the conflict rule, stamping `source`.
    pub fn apply_record(
        &mut self,
        mut record: TaskRecord,
        source: UpdateSource,
        observed_at: DateTime<Utc>,
    ) -> (ApplyOutcome, Option<ChangeEvent>) {
        record.source = source;
        let task_id = record.id.clone();
        let revision = record.revision;

        let verdict = if self.store.is_tombstoned(&record) {
            Err(RejectReason::Tombstoned)
        } else {
            match self.store.entry(&record.id) {
                Some(existing) => accept(existing, &record, observed_at, &self.config),
                None => Ok(()),
            }
        };
        if let Err(reason) = verdict {
            debug!(
                event = "reconcile_reject",
                task_id = %task_id,
                source = %source,
                revision = %revision,
                reason = reason.as_str(),
            );
            return (ApplyOutcome::Rejected(reason), None);
        }

        let change = self.store.upsert(record, observed_at);
        let outcome = match &change {
            Some(ChangeEvent::Added(_)) => ApplyOutcome::Inserted,
            Some(_) => ApplyOutcome::Updated,
            None => ApplyOutcome::Unchanged,
        };
        debug!(
            event = "reconcile_apply",
            task_id = %task_id,
            source = %source,
            revision = %revision,
            outcome = ?outcome,
        );
        (outcome, change)
    }

    fn apply_snapshot(&mut self, batch: SnapshotBatch, observed_at: DateTime<Utc>) -> Vec<ChangeEvent> {
        match batch {
            SnapshotBatch::Tasks(records) => self.apply_task_snapshot(records, observed_at),
            SnapshotBatch::ProcessMetrics(samples) => {
                self.store.replace_process_metrics(samples).into_iter().collect()
            }
            SnapshotBatch::SystemMetrics(value) => {
                self.store.replace_system_metrics(value).into_iter().collect()
            }
        }
    }

    fn apply_task_snapshot(&mut self, records: Vec<TaskRecord>, observed_at: DateTime<Utc>) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        let seen: HashSet<TaskId> = records.iter().map(|record| record.id.clone()).collect();

        for record in records {
            self.missing.remove(&record.id);
            let (_, change) = self.apply_record(record, UpdateSource::Poll, observed_at);
            events.extend(change);
        }

        let absent: Vec<TaskId> = self
            .store
            .ids()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in absent {
            let mark = self.missing.entry(id.clone()).or_insert(MissingMark {
                since: observed_at,
                misses: 0,
            });
            mark.misses += 1;
            if mark.misses < self.config.eviction_misses.max(1) {
                debug!(event = "snapshot_missing", task_id = %id, misses = mark.misses);
                continue;
            }
            let since = mark.since;
            self.missing.remove(&id);
            if let Some(event) = self.store.remove(&id) {
                info!(
                    event = "snapshot_evict",
                    task_id = %id,
                    missing_since = %since,
                );
                events.push(event);
            }
        }

        self.missing.retain(|id, _| self.store.contains(id));
        self.store.prune_after_snapshot(&seen);
        events
    }

    /// Consecutive snapshots `id` has been absent from.
    pub fn missed_snapshots(&self, id: &TaskId) -> u32 {
        self.missing.get(id).map(|mark| mark.misses).unwrap_or(0)
    }
}
