//! Transports, configuration and the terminal front end for the task dashboard.
//!
//! Polling and push clients feed a [`service::Dashboard`], which reconciles
//! every update through `taskdeck-engine` and keeps the keyed view that
//! [`ui::render_ui`] draws.

pub mod api;
pub mod config;
pub mod poll;
pub mod push;
pub mod service;
pub mod ui;

pub use api::{ApiClient, ApiError};
pub use config::{ConfigArgs, ConfigError, Settings};
pub use poll::{PollIntervals, PollKind, PollingClient};
pub use push::{next_backoff, PushChannel, PushClient, PushConfig, PushError};
pub use service::{
    CommandOutcome, Dashboard, DashboardEvent, PushState, PushStatus, TaskCommand, TransportGuard,
};
