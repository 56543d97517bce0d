use crate::api::ApiClient;
use crate::poll::{PollIntervals, PollKind, PollingClient};
use crate::push::{PushChannel, PushClient};
use chrono::Utc;
use std::{collections::HashMap, sync::Arc, time::Duration};
use taskdeck_core::{CreateTaskRequest, TaskId, TaskRecord, TaskStatus, UpdateSource};
use taskdeck_engine::{
    ApplyOutcome, ChangeEvent, Control, Patch, PresentationStore, Reconciler, ReconcilerConfig,
    TaskNode, Update, ViewTree,
};
use tokio::{
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub const UPDATE_QUEUE_CAPACITY: usize = 256;
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Connected(PushChannel),
    Disconnected(PushChannel),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Connecting,
    Live,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCommand {
    Create(CreateTaskRequest),
    SetStatus { id: TaskId, status: TaskStatus },
    Delete(TaskId),
}

impl TaskCommand {
    /// Command issued by a view control. Delete stays a delete; the rest are status changes.
    pub fn for_control(control: Control, id: TaskId) -> Self {
        let status = match control {
            Control::Pause => TaskStatus::Paused,
            Control::Resume => TaskStatus::Running,
            Control::Cancel => TaskStatus::Cancelled,
            Control::Delete => return TaskCommand::Delete(id),
        };
        TaskCommand::SetStatus { id, status }
    }

    pub fn describe(&self) -> String {
        match self {
            TaskCommand::Create(request) => format!("create {}", request.name),
            TaskCommand::SetStatus { id, status } => format!("set {id} {status}"),
            TaskCommand::Delete(id) => format!("delete {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied { command: String, task_id: TaskId },
    Failed { command: String, error: String },
}

enum CommandResponse {
    Record(TaskRecord),
    Deleted(TaskId),
}

#[derive(Debug)]
pub enum DashboardEvent {
    Update(Update),
    Push(PushStatus),
    Command(CommandOutcome),
}

pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Owns every background task the dashboard starts. Dropping the guard
/// aborts whatever is still running.
pub struct TransportGuard {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl TransportGuard {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.handles.retain(|existing| !existing.is_finished());
        self.handles.push(handle);
    }

    pub fn active(&self) -> usize {
        self.handles
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Signals shutdown and waits up to `grace` per task before aborting it.
    pub async fn shutdown(&mut self, grace: Duration) {
        let _ = self.shutdown.send(true);
        for mut handle in self.handles.drain(..) {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}

impl Default for TransportGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Single writer for the reconciler and the view tree. Transports and
/// command tasks only talk to it through the event channel.
pub struct Dashboard {
    reconciler: Reconciler,
    view: ViewTree,
    api: ApiClient,
    events_tx: mpsc::Sender<DashboardEvent>,
    events_rx: mpsc::Receiver<DashboardEvent>,
    transports: TransportGuard,
    refresh: Arc<Notify>,
    polling: bool,
    push: HashMap<PushChannel, PushState>,
    selected: usize,
    status_note: Option<String>,
}

impl Dashboard {
    pub fn new(api: ApiClient, config: ReconcilerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(UPDATE_QUEUE_CAPACITY);
        Self {
            reconciler: Reconciler::new(config),
            view: ViewTree::new(),
            api,
            events_tx,
            events_rx,
            transports: TransportGuard::new(),
            refresh: Arc::new(Notify::new()),
            polling: false,
            push: HashMap::new(),
            selected: 0,
            status_note: None,
        }
    }

    pub fn start_polling(&mut self, intervals: PollIntervals) {
        let client = PollingClient::new(self.api.clone());
        for kind in PollKind::ALL {
            let handle = client.spawn(
                kind,
                intervals.for_kind(kind),
                self.events_tx.clone(),
                self.refresh.clone(),
                self.transports.subscribe(),
            );
            self.transports.track(handle);
        }
        self.polling = true;
        info!(event = "polling_started", tasks_ms = intervals.tasks.as_millis() as u64);
    }

    pub fn start_push(&mut self, client: &PushClient, channels: &[PushChannel]) {
        for channel in channels {
            self.push.insert(*channel, PushState::Connecting);
            let handle = client.spawn(*channel, self.events_tx.clone(), self.transports.subscribe());
            self.transports.track(handle);
        }
    }

    /// Asks every idle poller to poll now. Kinds with a request in flight
    /// ignore it, so polls for one kind never overlap. Returns false when
    /// polling was never started.
    pub fn refresh(&mut self) -> bool {
        if !self.polling {
            return false;
        }
        self.refresh.notify_waiters();
        true
    }

    pub fn sender(&self) -> mpsc::Sender<DashboardEvent> {
        self.events_tx.clone()
    }

    pub async fn next_event(&mut self) -> Option<DashboardEvent> {
        self.events_rx.recv().await
    }

    pub fn handle_event(&mut self, event: DashboardEvent) -> Vec<Patch> {
        match event {
            DashboardEvent::Update(update) => self.apply_update(update),
            DashboardEvent::Push(status) => {
                let (channel, state) = match status {
                    PushStatus::Connected(channel) => (channel, PushState::Live),
                    PushStatus::Disconnected(channel) => (channel, PushState::Reconnecting),
                };
                self.push.insert(channel, state);
                Vec::new()
            }
            DashboardEvent::Command(outcome) => {
                self.status_note = Some(match &outcome {
                    CommandOutcome::Applied { command, .. } => format!("{command}: ok"),
                    CommandOutcome::Failed { command, error } => format!("{command} failed: {error}"),
                });
                Vec::new()
            }
        }
    }

    pub fn apply_update(&mut self, update: Update) -> Vec<Patch> {
        if let Update::Delta {
            record,
            source,
            observed_at,
        } = update
        {
            let (outcome, event) = self.reconciler.apply_record(record, source, observed_at);
            if let ApplyOutcome::Rejected(reason) = outcome {
                debug!(event = "delta_rejected", source = source.as_str(), reason = reason.as_str());
            }
            return self.render(event.into_iter().collect());
        }
        let events = self.reconciler.apply(update);
        self.render(events)
    }

    fn render(&mut self, events: Vec<ChangeEvent>) -> Vec<Patch> {
        let store = self.reconciler.store();
        let mut patches = Vec::new();
        for event in &events {
            patches.extend(self.view.apply(event, store));
        }
        if self.selected >= self.view.len() {
            self.selected = self.view.len().saturating_sub(1);
        }
        patches
    }

    /// Issues `command` against the API. The response re-enters through the
    /// event channel as a local-command update plus an outcome notice.
    pub fn dispatch(&mut self, command: TaskCommand) {
        let api = self.api.clone();
        let tx = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            let label = command.describe();
            let result = match command {
                TaskCommand::Create(request) => api.create_task(&request).await.map(CommandResponse::Record),
                TaskCommand::SetStatus { id, status } => {
                    api.update_status(&id, status).await.map(CommandResponse::Record)
                }
                TaskCommand::Delete(id) => api.delete_task(&id).await.map(|()| CommandResponse::Deleted(id)),
            };
            match result {
                Ok(response) => {
                    let observed_at = Utc::now();
                    let (task_id, update) = match response {
                        CommandResponse::Record(record) => (
                            record.id.clone(),
                            Update::Delta {
                                record,
                                source: UpdateSource::LocalCommand,
                                observed_at,
                            },
                        ),
                        CommandResponse::Deleted(id) => (id.clone(), Update::Removed { id, observed_at }),
                    };
                    if tx.send(DashboardEvent::Update(update)).await.is_ok() {
                        let _ = tx
                            .send(DashboardEvent::Command(CommandOutcome::Applied {
                                command: label,
                                task_id,
                            }))
                            .await;
                    }
                }
                Err(err) => {
                    warn!(event = "command_failed", command = %label, error = %err);
                    let _ = tx
                        .send(DashboardEvent::Command(CommandOutcome::Failed {
                            command: label,
                            error: err.to_string(),
                        }))
                        .await;
                }
            }
        });
        self.transports.track(handle);
    }

    /// Runs `control` on the selected node if the node offers it.
    pub fn control_selected(&mut self, control: Control) {
        let Some(node) = self.selected_node() else {
            return;
        };
        if !node.has_control(control) {
            self.status_note = Some(format!(
                "{} not available for {} task",
                control.label().to_ascii_lowercase(),
                node.status
            ));
            return;
        }
        let command = TaskCommand::for_control(control, node.task_id.clone());
        self.status_note = Some(format!("{}...", command.describe()));
        self.dispatch(command);
    }

    /// Pause for running tasks, resume for paused ones.
    pub fn toggle_selected(&mut self) {
        let control = match self.selected_node().map(|node| node.status) {
            Some(TaskStatus::Paused) => Control::Resume,
            _ => Control::Pause,
        };
        self.control_selected(control);
    }

    pub fn move_selection(&mut self, delta: isize) {
        let len = self.view.len();
        if len == 0 {
            self.selected = 0;
            return;
        }
        let next = self.selected as isize + delta;
        self.selected = next.clamp(0, len as isize - 1) as usize;
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn selected_node(&self) -> Option<&TaskNode> {
        self.view.node_at(self.selected)
    }

    pub fn view(&self) -> &ViewTree {
        &self.view
    }

    pub fn store(&self) -> &PresentationStore {
        self.reconciler.store()
    }

    pub fn status_note(&self) -> Option<&str> {
        self.status_note.as_deref()
    }

    pub fn set_status_note(&mut self, note: impl Into<String>) {
        self.status_note = Some(note.into());
    }

    pub fn push_state(&self, channel: PushChannel) -> Option<PushState> {
        self.push.get(&channel).copied()
    }

    pub fn push_summary(&self) -> &'static str {
        if self.push.is_empty() {
            return "push: off";
        }
        if self.push.values().all(|state| *state == PushState::Live) {
            return "push: live";
        }
        if self.push.values().any(|state| *state == PushState::Reconnecting) {
            return "push: reconnecting";
        }
        "push: connecting"
    }

    pub fn background_tasks(&self) -> usize {
        self.transports.active()
    }

    pub async fn shutdown(&mut self) {
        self.transports.shutdown(SHUTDOWN_GRACE).await;
        info!(event = "dashboard_stopped");
    }
}
