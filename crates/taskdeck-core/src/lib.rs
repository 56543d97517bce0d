use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod stomp;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the view node that renders this task.
    pub fn node_key(&self) -> String {
        format!("task-{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize_id(deserializer).map(TaskId)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Archived,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Archived => "ARCHIVED",
        }
    }

    /// Terminal tasks can only leave the dashboard through deletion or eviction.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Archived
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            "archived" => Ok(TaskStatus::Archived),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "LOW",
            TaskPriority::Medium => "MEDIUM",
            TaskPriority::High => "HIGH",
            TaskPriority::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(format!("Unknown priority: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for TaskPriority {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Channel that last wrote a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateSource {
    Poll,
    Push,
    LocalCommand,
}

impl UpdateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateSource::Poll => "poll",
            UpdateSource::Push => "push",
            UpdateSource::LocalCommand => "local-command",
        }
    }

    /// Tie-break precedence: local-command > push > poll.
    pub fn rank(&self) -> u8 {
        match self {
            UpdateSource::Poll => 0,
            UpdateSource::Push => 1,
            UpdateSource::LocalCommand => 2,
        }
    }
}

impl fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub threads_needed: u32,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub revision: Revision,
    pub source: UpdateSource,
}

impl TaskRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Task as the scheduler serializes it. `source` is never read from the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskWire {
    id: TaskId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    priority: Option<TaskPriority>,
    status: TaskStatus,
    #[serde(default)]
    threads_needed: Option<u32>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    revision: Option<u64>,
    #[serde(default)]
    updated_at: Option<Value>,
}

impl TaskWire {
    fn into_record(self, source: UpdateSource) -> TaskRecord {
        let revision = self
            .revision
            .or_else(|| {
                self.updated_at
                    .as_ref()
                    .and_then(timestamp_from_value)
                    .map(|at| at.timestamp_millis().max(0) as u64)
            })
            .unwrap_or(0);
        TaskRecord {
            id: self.id,
            name: self.name.unwrap_or_default(),
            priority: self.priority.unwrap_or_default(),
            status: self.status,
            threads_needed: self.threads_needed.unwrap_or(0),
            command: self.command.unwrap_or_default(),
            description: self.description,
            revision: Revision(revision),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub task_id: TaskId,
    pub process_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u64>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricWire {
    task_id: TaskId,
    #[serde(default)]
    process_name: Option<String>,
    #[serde(default)]
    pid: Option<u64>,
    cpu_usage: f64,
    memory_usage: f64,
    #[serde(default)]
    sampled_at: Option<Value>,
    #[serde(default)]
    start_time: Option<Value>,
}

impl MetricWire {
    fn into_sample(self) -> Result<MetricSample, WireError> {
        for (field, value) in [("cpuUsage", self.cpu_usage), ("memoryUsage", self.memory_usage)] {
            if !value.is_finite() || value < 0.0 {
                return Err(WireError::InvalidMetric {
                    task_id: self.task_id.to_string(),
                    reason: format!("{field} must be a non-negative number, got {value}"),
                });
            }
        }
        let sampled_at = self
            .sampled_at
            .as_ref()
            .or(self.start_time.as_ref())
            .and_then(timestamp_from_value);
        Ok(MetricSample {
            task_id: self.task_id,
            process_name: self.process_name.unwrap_or_default(),
            pid: self.pid,
            cpu_usage: self.cpu_usage,
            memory_usage: self.memory_usage,
            sampled_at,
        })
    }
}

/// Scheduler-wide aggregate from `/api/metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    #[serde(default)]
    pub active_tasks: u32,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: Option<f64>,
    #[serde(default)]
    pub thread_pool_size: Option<u32>,
    #[serde(default)]
    pub queue_size: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskErrorEvent {
    pub task_id: TaskId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub name: String,
    pub priority: TaskPriority,
    pub threads_needed: u32,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("payload decode failed: {0}")]
    Decode(String),
    #[error("expected {expected}, got {found}")]
    UnexpectedShape {
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid metric for task {task_id}: {reason}")]
    InvalidMetric { task_id: String, reason: String },
}

/// Items that parsed, plus the elements that were dropped on the way.
#[derive(Debug, Clone)]
pub struct ParseReport<T> {
    pub items: Vec<T>,
    pub errors: Vec<WireError>,
}

impl<T> Default for ParseReport<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn parse_task_record(value: Value, source: UpdateSource) -> Result<TaskRecord, WireError> {
    serde_json::from_value::<TaskWire>(value)
        .map(|wire| wire.into_record(source))
        .map_err(|err| WireError::Decode(err.to_string()))
}

pub fn parse_task_bytes(bytes: &[u8], source: UpdateSource) -> Result<TaskRecord, WireError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| WireError::Decode(err.to_string()))?;
    parse_task_record(value, source)
}

/// Parses a task list element by element so one bad row does not sink the batch.
pub fn parse_task_list(bytes: &[u8], source: UpdateSource) -> Result<ParseReport<TaskRecord>, WireError> {
    let items = parse_array(bytes)?;
    let mut report = ParseReport::default();
    for item in items {
        match parse_task_record(item, source) {
            Ok(record) => report.items.push(record),
            Err(err) => report.errors.push(err),
        }
    }
    Ok(report)
}

pub fn parse_metric_list(bytes: &[u8]) -> Result<ParseReport<MetricSample>, WireError> {
    let items = parse_array(bytes)?;
    let mut report = ParseReport::default();
    for item in items {
        let parsed = serde_json::from_value::<MetricWire>(item)
            .map_err(|err| WireError::Decode(err.to_string()))
            .and_then(MetricWire::into_sample);
        match parsed {
            Ok(sample) => report.items.push(sample),
            Err(err) => report.errors.push(err),
        }
    }
    Ok(report)
}

/// Accepts either a single aggregate or a list of recent aggregates; the newest wins.
pub fn parse_system_metrics(bytes: &[u8]) -> Result<Option<SystemMetrics>, WireError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| WireError::Decode(err.to_string()))?;
    match value {
        Value::Null => Ok(None),
        Value::Object(_) => serde_json::from_value(value)
            .map(Some)
            .map_err(|err| WireError::Decode(err.to_string())),
        Value::Array(items) => {
            let mut newest: Option<SystemMetrics> = None;
            for item in items {
                let parsed: SystemMetrics = serde_json::from_value(item)
                    .map_err(|err| WireError::Decode(err.to_string()))?;
                let replace = match &newest {
                    None => true,
                    Some(current) => parsed.timestamp >= current.timestamp,
                };
                if replace {
                    newest = Some(parsed);
                }
            }
            Ok(newest)
        }
        other => Err(WireError::UnexpectedShape {
            expected: "object or array",
            found: json_kind(&other),
        }),
    }
}

pub fn parse_task_error(bytes: &[u8]) -> Result<TaskErrorEvent, WireError> {
    serde_json::from_slice(bytes).map_err(|err| WireError::Decode(err.to_string()))
}

fn parse_array(bytes: &[u8]) -> Result<Vec<Value>, WireError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| WireError::Decode(err.to_string()))?;
    match value {
        Value::Array(items) => Ok(items),
        other => Err(WireError::UnexpectedShape {
            expected: "array",
            found: json_kind(&other),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Reads RFC 3339 strings, zone-less local date times (taken as UTC), epoch
/// milliseconds, or `[y, m, d, h, min, s, nanos]` arrays.
pub fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => parse_timestamp(raw),
        Value::Number(number) => number
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::Array(parts) => timestamp_from_parts(parts),
        _ => None,
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn timestamp_from_parts(parts: &[Value]) -> Option<DateTime<Utc>> {
    let field = |idx: usize| parts.get(idx).and_then(Value::as_i64).unwrap_or(0);
    if parts.len() < 3 {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(
        i32::try_from(field(0)).ok()?,
        u32::try_from(field(1)).ok()?,
        u32::try_from(field(2)).ok()?,
    )?;
    date.and_hms_nano_opt(
        u32::try_from(field(3)).ok()?,
        u32::try_from(field(4)).ok()?,
        u32::try_from(field(5)).ok()?,
        u32::try_from(field(6)).ok()?,
    )
    .map(|naive| naive.and_utc())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(timestamp_from_value))
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) if !s.trim().is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(de::Error::custom("expected non-empty string or number for id")),
    }
}
