use crate::store::{ChangeEvent, PresentationStore};
use std::collections::HashMap;
use taskdeck_core::{
    MetricSample, Revision, SystemMetrics, TaskId, TaskPriority, TaskRecord, TaskStatus, UpdateSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    Pause,
    Resume,
    Cancel,
    Delete,
}

impl Control {
    pub fn label(&self) -> &'static str {
        match self {
            Control::Pause => "Pause",
            Control::Resume => "Resume",
            Control::Cancel => "Cancel",
            Control::Delete => "Delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskNode {
    pub key: String,
    pub task_id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub threads_needed: u32,
    pub source: UpdateSource,
    pub revision: Revision,
    pub controls: Vec<Control>,
    pub error: Option<String>,
    pub usage: Option<String>,
}

impl TaskNode {
    pub fn has_control(&self, control: Control) -> bool {
        self.controls.contains(&control)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub key: String,
    pub task_id: TaskId,
    pub process_name: String,
    pub cpu: String,
    pub memory: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    Created(String),
    Replaced(String),
    Detached(String),
    Unchanged(String),
    MetricsRebuilt,
}

/// Keyed projection of the store: one node per task id, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewTree {
    nodes: HashMap<TaskId, TaskNode>,
    order: Vec<TaskId>,
    metric_rows: Vec<MetricRow>,
    system_line: Option<String>,
}

impl ViewTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the tree from scratch; equals the incrementally patched tree.
    pub fn replay(store: &PresentationStore) -> Self {
        let mut tree = Self::new();
        for record in store.all().into_iter().rev() {
            tree.order.push(record.id.clone());
            tree.nodes.insert(record.id.clone(), project_task(record, store));
        }
        tree.rebuild_metrics(store);
        tree
    }

    pub fn apply(&mut self, event: &ChangeEvent, store: &PresentationStore) -> Vec<Patch> {
        match event {
            ChangeEvent::Added(id) | ChangeEvent::Updated(id) => {
                self.sync_task(id, store).into_iter().collect()
            }
            ChangeEvent::Removed(id) => self.detach(id).into_iter().collect(),
            ChangeEvent::MetricsReplaced => {
                self.rebuild_metrics(store);
                let mut patches = vec![Patch::MetricsRebuilt];
                let ids: Vec<TaskId> = self.order.clone();
                for id in ids {
                    if let Some(patch) = self.sync_task(&id, store) {
                        if !matches!(patch, Patch::Unchanged(_)) {
                            patches.push(patch);
                        }
                    }
                }
                patches
            }
        }
    }

    fn sync_task(&mut self, id: &TaskId, store: &PresentationStore) -> Option<Patch> {
        let Some(record) = store.get(id) else {
            return self.detach(id);
        };
        let node = project_task(record, store);
        let key = node.key.clone();
        match self.nodes.get_mut(id) {
            Some(existing) if *existing == node => Some(Patch::Unchanged(key)),
            Some(existing) => {
                *existing = node;
                Some(Patch::Replaced(key))
            }
            None => {
                self.order.insert(0, id.clone());
                self.nodes.insert(id.clone(), node);
                Some(Patch::Created(key))
            }
        }
    }

    fn detach(&mut self, id: &TaskId) -> Option<Patch> {
        let node = self.nodes.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(Patch::Detached(node.key))
    }

    fn rebuild_metrics(&mut self, store: &PresentationStore) {
        self.metric_rows = store.metrics().into_iter().map(project_metric).collect();
        self.system_line = store.system_metrics().map(format_system);
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn node(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn node_by_key(&self, key: &str) -> Option<&TaskNode> {
        self.nodes.values().find(|node| node.key == key)
    }

    pub fn node_at(&self, index: usize) -> Option<&TaskNode> {
        self.order.get(index).and_then(|id| self.nodes.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn metric_rows(&self) -> &[MetricRow] {
        &self.metric_rows
    }

    pub fn system_line(&self) -> Option<&str> {
        self.system_line.as_deref()
    }
}

pub fn project_task(record: &TaskRecord, store: &PresentationStore) -> TaskNode {
    let controls = match record.status {
        TaskStatus::Running => vec![Control::Pause, Control::Cancel],
        TaskStatus::Paused => vec![Control::Resume, Control::Cancel],
        TaskStatus::Pending => vec![Control::Cancel],
        _ => vec![Control::Delete],
    };
    TaskNode {
        key: record.id.node_key(),
        task_id: record.id.clone(),
        title: if record.name.is_empty() {
            format!("task {}", record.id)
        } else {
            record.name.clone()
        },
        status: record.status,
        priority: record.priority,
        threads_needed: record.threads_needed,
        source: record.source,
        revision: record.revision,
        controls,
        error: store.error(&record.id).map(|event| event.error.clone()),
        usage: store
            .metric(&record.id)
            .map(|sample| format!("{:.2}% cpu · {:.2} MB", sample.cpu_usage, sample.memory_usage)),
    }
}

fn project_metric(sample: &MetricSample) -> MetricRow {
    MetricRow {
        key: format!("metric-{}", sample.task_id),
        task_id: sample.task_id.clone(),
        process_name: sample.process_name.clone(),
        cpu: format!("{:.2}%", sample.cpu_usage),
        memory: format!("{:.2} MB", sample.memory_usage),
    }
}

fn format_system(metrics: &SystemMetrics) -> String {
    let mut line = format!("{} active · cpu {:.2}%", metrics.active_tasks, metrics.cpu_usage);
    if let Some(memory) = metrics.memory_usage {
        line.push_str(&format!(" · mem {memory:.2} MB"));
    }
    if let Some(queue) = metrics.queue_size {
        line.push_str(&format!(" · queue {queue}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::{Reconciler, SnapshotBatch, Update};
    use chrono::{DateTime, TimeZone, Utc};
    use taskdeck_core::TaskErrorEvent;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_770_000_000 + offset_secs, 0)
            .single()
            .expect("valid timestamp")
    }

    fn task(id: &str, status: TaskStatus, revision: u64) -> TaskRecord {
        TaskRecord {
            id: TaskId::new(id),
            name: format!("job-{id}"),
            priority: TaskPriority::Low,
            status,
            threads_needed: 1,
            command: "true".to_string(),
            description: None,
            revision: Revision(revision),
            source: UpdateSource::Poll,
        }
    }

    fn drive(reconciler: &mut Reconciler, tree: &mut ViewTree, update: Update) -> Vec<Patch> {
        let events = reconciler.apply(update);
        events
            .iter()
            .flat_map(|event| tree.apply(event, reconciler.store()))
            .collect()
    }

    fn push(record: TaskRecord, at: i64) -> Update {
        Update::Delta {
            record,
            source: UpdateSource::Push,
            observed_at: ts(at),
        }
    }

    #[test]
    fn consecutive_updates_keep_a_single_node() {
        let mut reconciler = Reconciler::default();
        let mut tree = ViewTree::new();

        let created = drive(&mut reconciler, &mut tree, push(task("T-1", TaskStatus::Pending, 1), 0));
        let replaced = drive(&mut reconciler, &mut tree, push(task("T-1", TaskStatus::Running, 2), 1));

        assert_eq!(created, vec![Patch::Created("task-T-1".to_string())]);
        assert_eq!(replaced, vec![Patch::Replaced("task-T-1".to_string())]);
        assert_eq!(tree.len(), 1);
        let keys: Vec<&str> = tree.nodes().map(|node| node.key.as_str()).collect();
        assert_eq!(keys, vec!["task-T-1"]);
        assert_eq!(
            tree.node_by_key("task-T-1").map(|node| node.status),
            Some(TaskStatus::Running)
        );
    }

    #[test]
    fn duplicate_delta_triggers_no_render() {
        let mut reconciler = Reconciler::default();
        let mut tree = ViewTree::new();
        drive(&mut reconciler, &mut tree, push(task("1", TaskStatus::Running, 2), 0));
        let patches = drive(&mut reconciler, &mut tree, push(task("1", TaskStatus::Running, 2), 1));
        assert!(patches.is_empty());
    }

    #[test]
    fn removal_detaches_node() {
        let mut reconciler = Reconciler::default();
        let mut tree = ViewTree::new();
        drive(&mut reconciler, &mut tree, push(task("1", TaskStatus::Completed, 2), 0));
        let patches = drive(
            &mut reconciler,
            &mut tree,
            Update::Removed {
                id: TaskId::new("1"),
                observed_at: ts(1),
            },
        );
        assert_eq!(patches, vec![Patch::Detached("task-1".to_string())]);
        assert!(tree.is_empty());
    }

    #[test]
    fn replay_reproduces_incremental_tree() {
        let mut reconciler = Reconciler::default();
        let mut tree = ViewTree::new();
        drive(
            &mut reconciler,
            &mut tree,
            Update::Snapshot {
                batch: SnapshotBatch::Tasks(vec![
                    task("1", TaskStatus::Running, 1),
                    task("2", TaskStatus::Pending, 1),
                    task("3", TaskStatus::Paused, 1),
                ]),
                observed_at: ts(0),
            },
        );
        drive(&mut reconciler, &mut tree, push(task("2", TaskStatus::Failed, 4), 1));
        drive(
            &mut reconciler,
            &mut tree,
            Update::TaskError(TaskErrorEvent {
                task_id: TaskId::new("2"),
                error: "exit 1".to_string(),
            }),
        );
        drive(
            &mut reconciler,
            &mut tree,
            Update::Snapshot {
                batch: SnapshotBatch::ProcessMetrics(vec![MetricSample {
                    task_id: TaskId::new("1"),
                    process_name: "java".to_string(),
                    pid: None,
                    cpu_usage: 12.345,
                    memory_usage: 100.0,
                    sampled_at: None,
                }]),
                observed_at: ts(2),
            },
        );
        drive(&mut reconciler, &mut tree, Update::Snapshot {
            batch: SnapshotBatch::Tasks(vec![task("1", TaskStatus::Running, 1), task("2", TaskStatus::Failed, 4)]),
            observed_at: ts(3),
        });
        drive(&mut reconciler, &mut tree, Update::Snapshot {
            batch: SnapshotBatch::Tasks(vec![task("1", TaskStatus::Running, 1), task("2", TaskStatus::Failed, 4)]),
            observed_at: ts(4),
        });

        let replayed = ViewTree::replay(reconciler.store());
        assert_eq!(replayed, tree);
        let keys: Vec<&str> = tree.nodes().map(|node| node.key.as_str()).collect();
        assert_eq!(keys, vec!["task-2", "task-1"]);
        assert_eq!(
            tree.node(&TaskId::new("1")).and_then(|node| node.usage.as_deref()),
            Some("12.35% cpu · 100.00 MB")
        );
        assert_eq!(
            tree.node(&TaskId::new("2")).and_then(|node| node.error.as_deref()),
            Some("exit 1")
        );
        assert_eq!(tree.metric_rows()[0].key, "metric-1");
    }

    #[test]
    fn controls_follow_status() {
        let store = PresentationStore::new();
        let running = project_task(&task("1", TaskStatus::Running, 1), &store);
        let paused = project_task(&task("1", TaskStatus::Paused, 1), &store);
        let done = project_task(&task("1", TaskStatus::Cancelled, 1), &store);

        assert_eq!(running.controls, vec![Control::Pause, Control::Cancel]);
        assert_eq!(paused.controls, vec![Control::Resume, Control::Cancel]);
        assert!(done.has_control(Control::Delete));
        assert!(!done.has_control(Control::Cancel));
    }
}
