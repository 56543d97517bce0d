//! Reconciliation and presentation engine for the task dashboard.
//!
//! Transports feed [`reconciler::Update`]s into a [`reconciler::Reconciler`],
//! which owns the [`store::PresentationStore`]. Every accepted mutation yields
//! a [`store::ChangeEvent`] that the [`render::ViewTree`] projects into keyed
//! view nodes.

pub mod auth;
pub mod reconciler;
pub mod render;
pub mod store;

pub use auth::AuthContext;
pub use reconciler::{ApplyOutcome, Reconciler, ReconcilerConfig, RejectReason, SnapshotBatch, Update};
pub use render::{Control, MetricRow, Patch, TaskNode, ViewTree};
pub use store::{ChangeEvent, PresentationStore, StoredTask};
