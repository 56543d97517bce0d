use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use taskdeck_core::{MetricSample, Revision, SystemMetrics, TaskErrorEvent, TaskId, TaskRecord};
use tracing::{debug, warn};

/// Error annotations held for ids that have no live record yet.
pub const MAX_PENDING_ERRORS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Added(TaskId),
    Updated(TaskId),
    Removed(TaskId),
    MetricsReplaced,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredTask {
    pub record: TaskRecord,
    /// Observation time of the update that last wrote this record.
    pub applied_at: DateTime<Utc>,
    seq: u64,
}

impl StoredTask {
    pub fn first_seen_seq(&self) -> u64 {
        self.seq
    }
}

/// Authoritative record set read by the renderer. Mutated only through the
/// reconciler.
#[derive(Debug, Default)]
pub struct PresentationStore {
    tasks: HashMap<TaskId, StoredTask>,
    tombstones: HashMap<TaskId, Revision>,
    errors: HashMap<TaskId, TaskErrorEvent>,
    metrics: HashMap<TaskId, MetricSample>,
    system: Option<SystemMetrics>,
    next_seq: u64,
}

impl PresentationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, record: TaskRecord, applied_at: DateTime<Utc>) -> Option<ChangeEvent> {
        if self.is_tombstoned(&record) {
            warn!(
                event = "store_reject_tombstoned",
                task_id = %record.id,
                revision = %record.revision,
            );
            return None;
        }
        self.tombstones.remove(&record.id);

        match self.tasks.get_mut(&record.id) {
            Some(existing) if existing.record == record => None,
            Some(existing) => {
                let id = record.id.clone();
                existing.record = record;
                existing.applied_at = applied_at;
                Some(ChangeEvent::Updated(id))
            }
            None => {
                let id = record.id.clone();
                let seq = self.next_seq;
                self.next_seq += 1;
                self.tasks.insert(
                    id.clone(),
                    StoredTask {
                        record,
                        applied_at,
                        seq,
                    },
                );
                Some(ChangeEvent::Added(id))
            }
        }
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<ChangeEvent> {
        let removed = self.tasks.remove(id)?;
        if removed.record.is_terminal() {
            self.tombstones.insert(id.clone(), removed.record.revision);
        }
        self.errors.remove(id);
        debug!(event = "store_remove", task_id = %id, status = %removed.record.status);
        Some(ChangeEvent::Removed(id.clone()))
    }

    /// True when `record` would resurrect a removed terminal task with a stale revision.
    pub fn is_tombstoned(&self, record: &TaskRecord) -> bool {
        self.tombstones
            .get(&record.id)
            .map(|revision| record.revision <= *revision)
            .unwrap_or(false)
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.get(id).map(|stored| &stored.record)
    }

    pub fn entry(&self, id: &TaskId) -> Option<&StoredTask> {
        self.tasks.get(id)
    }

    /// Records in first-observation order.
    pub fn all(&self) -> Vec<&TaskRecord> {
        let mut stored: Vec<&StoredTask> = self.tasks.values().collect();
        stored.sort_by_key(|entry| entry.seq);
        stored.into_iter().map(|entry| &entry.record).collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks.keys()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Keeps the latest error per task. Errors for tasks not observed yet are
    /// held until the next task snapshot, up to `MAX_PENDING_ERRORS`.
    pub fn annotate_error(&mut self, event: TaskErrorEvent) -> Option<ChangeEvent> {
        if self.errors.get(&event.task_id) == Some(&event) {
            return None;
        }
        let id = event.task_id.clone();
        let live = self.tasks.contains_key(&id);
        if !live && !self.errors.contains_key(&id) && self.pending_errors() >= MAX_PENDING_ERRORS {
            debug!(event = "store_error_dropped", task_id = %id, reason = "pending_full");
            return None;
        }
        self.errors.insert(id.clone(), event);
        live.then_some(ChangeEvent::Updated(id))
    }

    pub fn pending_errors(&self) -> usize {
        self.errors
            .keys()
            .filter(|id| !self.tasks.contains_key(*id))
            .count()
    }

    /// Forgets tombstones the server no longer lists and errors for ids
    /// that are still not live after a full task snapshot.
    pub fn prune_after_snapshot(&mut self, listed: &HashSet<TaskId>) {
        let tombstones = self.tombstones.len();
        let errors = self.errors.len();
        self.tombstones.retain(|id, _| listed.contains(id));
        let tasks = &self.tasks;
        self.errors.retain(|id, _| tasks.contains_key(id));
        let pruned_tombstones = tombstones - self.tombstones.len();
        let pruned_errors = errors - self.errors.len();
        if pruned_tombstones > 0 || pruned_errors > 0 {
            debug!(event = "store_prune", tombstones = pruned_tombstones, errors = pruned_errors);
        }
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn error(&self, id: &TaskId) -> Option<&TaskErrorEvent> {
        self.errors.get(id)
    }

    /// Replaces the whole per-task metric table, keeping the newest sample per task.
    pub fn replace_process_metrics(&mut self, samples: Vec<MetricSample>) -> Option<ChangeEvent> {
        let mut table: HashMap<TaskId, MetricSample> = HashMap::with_capacity(samples.len());
        for sample in samples {
            let keep_existing = table
                .get(&sample.task_id)
                .map(|current| current.sampled_at > sample.sampled_at)
                .unwrap_or(false);
            if !keep_existing {
                table.insert(sample.task_id.clone(), sample);
            }
        }
        if table == self.metrics {
            return None;
        }
        self.metrics = table;
        Some(ChangeEvent::MetricsReplaced)
    }

    pub fn replace_system_metrics(&mut self, value: Option<SystemMetrics>) -> Option<ChangeEvent> {
        if value == self.system {
            return None;
        }
        self.system = value;
        Some(ChangeEvent::MetricsReplaced)
    }

    pub fn metric(&self, id: &TaskId) -> Option<&MetricSample> {
        self.metrics.get(id)
    }

    /// Samples ordered by task id.
    pub fn metrics(&self) -> Vec<&MetricSample> {
        let mut samples: Vec<&MetricSample> = self.metrics.values().collect();
        samples.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        samples
    }

    pub fn system_metrics(&self) -> Option<&SystemMetrics> {
        self.system.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use taskdeck_core::{TaskPriority, TaskStatus, UpdateSource};

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_770_000_000 + offset_secs, 0)
            .single()
            .expect("valid timestamp")
    }

    fn record(id: &str, status: TaskStatus, revision: u64) -> TaskRecord {
        TaskRecord {
            id: TaskId::new(id),
            name: format!("task {id}"),
            priority: TaskPriority::Medium,
            status,
            threads_needed: 1,
            command: "run".to_string(),
            description: None,
            revision: Revision(revision),
            source: UpdateSource::Poll,
        }
    }

    fn sample(id: &str, cpu: f64, at: i64) -> MetricSample {
        MetricSample {
            task_id: TaskId::new(id),
            process_name: "worker".to_string(),
            pid: None,
            cpu_usage: cpu,
            memory_usage: 64.0,
            sampled_at: Some(ts(at)),
        }
    }

    #[test]
    fn identical_upsert_emits_nothing() {
        let mut store = PresentationStore::new();
        let first = store.upsert(record("1", TaskStatus::Pending, 1), ts(0));
        let second = store.upsert(record("1", TaskStatus::Pending, 1), ts(5));

        assert_eq!(first, Some(ChangeEvent::Added(TaskId::new("1"))));
        assert_eq!(second, None);
        assert_eq!(store.entry(&TaskId::new("1")).map(|e| e.applied_at), Some(ts(0)));
    }

    #[test]
    fn all_preserves_first_observation_order() {
        let mut store = PresentationStore::new();
        store.upsert(record("b", TaskStatus::Pending, 1), ts(0));
        store.upsert(record("a", TaskStatus::Pending, 1), ts(1));
        store.upsert(record("b", TaskStatus::Running, 2), ts(2));

        let ids: Vec<&str> = store.all().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn removed_terminal_record_rejects_stale_reintroduction() {
        let mut store = PresentationStore::new();
        store.upsert(record("7", TaskStatus::Completed, 4), ts(0));
        assert_eq!(
            store.remove(&TaskId::new("7")),
            Some(ChangeEvent::Removed(TaskId::new("7")))
        );

        assert_eq!(store.upsert(record("7", TaskStatus::Completed, 4), ts(1)), None);
        assert_eq!(store.upsert(record("7", TaskStatus::Running, 3), ts(1)), None);
        assert!(store.is_empty());

        let fresh = store.upsert(record("7", TaskStatus::Pending, 5), ts(2));
        assert_eq!(fresh, Some(ChangeEvent::Added(TaskId::new("7"))));
    }

    #[test]
    fn removing_live_record_leaves_no_tombstone() {
        let mut store = PresentationStore::new();
        store.upsert(record("3", TaskStatus::Running, 9), ts(0));
        store.remove(&TaskId::new("3"));
        assert!(store
            .upsert(record("3", TaskStatus::Running, 9), ts(1))
            .is_some());
    }

    #[test]
    fn error_annotation_waits_for_task() {
        let mut store = PresentationStore::new();
        let event = TaskErrorEvent {
            task_id: TaskId::new("5"),
            error: "oom".to_string(),
        };
        assert_eq!(store.annotate_error(event.clone()), None);
        store.upsert(record("5", TaskStatus::Running, 1), ts(0));
        assert_eq!(store.error(&TaskId::new("5")), Some(&event));
        assert_eq!(store.annotate_error(event), None);

        let changed = store.annotate_error(TaskErrorEvent {
            task_id: TaskId::new("5"),
            error: "killed".to_string(),
        });
        assert_eq!(changed, Some(ChangeEvent::Updated(TaskId::new("5"))));
    }

    fn error(id: &str) -> TaskErrorEvent {
        TaskErrorEvent {
            task_id: TaskId::new(id),
            error: "exit 1".to_string(),
        }
    }

    #[test]
    fn pending_errors_are_capped() {
        let mut store = PresentationStore::new();
        for n in 0..MAX_PENDING_ERRORS + 10 {
            store.annotate_error(error(&format!("ghost-{n}")));
        }
        assert_eq!(store.pending_errors(), MAX_PENDING_ERRORS);

        store.upsert(record("live", TaskStatus::Running, 1), ts(0));
        assert_eq!(
            store.annotate_error(error("live")),
            Some(ChangeEvent::Updated(TaskId::new("live")))
        );
        assert!(store.error(&TaskId::new("live")).is_some());
    }

    #[test]
    fn snapshot_prune_drops_unlisted_tombstones_and_orphan_errors() {
        let mut store = PresentationStore::new();
        store.upsert(record("1", TaskStatus::Completed, 2), ts(0));
        store.upsert(record("2", TaskStatus::Failed, 2), ts(0));
        store.upsert(record("3", TaskStatus::Running, 1), ts(0));
        store.remove(&TaskId::new("1"));
        store.remove(&TaskId::new("2"));
        store.annotate_error(error("3"));
        store.annotate_error(error("never-seen"));
        assert_eq!(store.tombstone_count(), 2);
        assert_eq!(store.pending_errors(), 1);

        let listed: HashSet<TaskId> = [TaskId::new("2"), TaskId::new("3")].into_iter().collect();
        store.prune_after_snapshot(&listed);

        assert_eq!(store.tombstone_count(), 1);
        assert!(store.is_tombstoned(&record("2", TaskStatus::Failed, 2)));
        assert!(!store.is_tombstoned(&record("1", TaskStatus::Completed, 2)));
        assert_eq!(store.pending_errors(), 0);
        assert!(store.error(&TaskId::new("3")).is_some());
    }

    #[test]
    fn metric_table_keeps_latest_sample_per_task() {
        let mut store = PresentationStore::new();
        let event = store.replace_process_metrics(vec![
            sample("1", 10.0, 5),
            sample("1", 80.0, 1),
            sample("2", 3.0, 2),
        ]);
        assert_eq!(event, Some(ChangeEvent::MetricsReplaced));
        assert_eq!(store.metric(&TaskId::new("1")).map(|m| m.cpu_usage), Some(10.0));
        assert_eq!(store.metrics().len(), 2);

        let again = store.replace_process_metrics(vec![sample("1", 10.0, 5), sample("2", 3.0, 2)]);
        assert_eq!(again, None);

        store.replace_process_metrics(Vec::new());
        assert!(store.metrics().is_empty());
    }
}
