//! pgview View Services
//!
//! Everything that touches a live connection or persisted view state:
//! - Backend/session seam with a pooled PostgreSQL implementation
//! - Append-only version history with per-view serialization
//! - Plan-only performance estimation
//! - Bounded, read-only preview execution
//! - View create/update orchestration and change events

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod estimator;
pub mod events;
pub mod introspect;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod preview;
pub mod repository;
pub mod service;
pub mod versions;

pub use backend::{BackendSession, CancelHandle, QueryRows, ViewBackend};
pub use estimator::PerformanceEstimator;
pub use events::{NoopEventSink, RecordingEventSink, ViewEvent, ViewEventSink};
pub use memory::ScriptedBackend;
pub use model::{
    CreateViewRequest, DatabaseView, DriftReport, RequestContext, SavedView, UpdateViewRequest,
    ViewDefinitionRequest,
};
pub use postgres::PgBackend;
pub use preview::{validate_read_only_sql, PreviewExecutor};
pub use repository::{InMemoryViewRepository, ViewRepository};
pub use service::ViewService;
pub use versions::{InMemoryVersionStore, VersionManager, VersionStore};
