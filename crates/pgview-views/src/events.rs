//! View change events
//!
//! The service emits one event per state change; audit and webhook fan-out
//! live behind [`ViewEventSink`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use pgview_common::types::ViewVersion;

use crate::model::DatabaseView;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewEvent {
    Created { view: DatabaseView },
    Updated { view: DatabaseView },
    VersionRecorded { version: ViewVersion },
}

impl ViewEvent {
    /// Dotted event name, e.g. `view.created`
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "view.created",
            Self::Updated { .. } => "view.updated",
            Self::VersionRecorded { .. } => "view.version_recorded",
        }
    }

    /// `schema.name` of the view for view events, the view id otherwise
    #[must_use]
    pub fn subject(&self) -> String {
        match self {
            Self::Created { view } | Self::Updated { view } => view.qualified_name(),
            Self::VersionRecorded { version } => version.view_id.to_string(),
        }
    }
}

/// Receiver of view events. Publishing must not fail the originating save.
#[async_trait]
pub trait ViewEventSink: Send + Sync {
    async fn publish(&self, event: ViewEvent);
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

#[async_trait]
impl ViewEventSink for NoopEventSink {
    async fn publish(&self, _event: ViewEvent) {}
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<ViewEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ViewEvent> {
        self.events.lock().clone()
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(ViewEvent::event_name).collect()
    }
}

#[async_trait]
impl ViewEventSink for RecordingEventSink {
    async fn publish(&self, event: ViewEvent) {
        self.events.lock().push(event);
    }
}
