//! The event-bus boundary. The pipeline only ever talks to the
//! [`EventClient`] trait; what sits behind it (a bus publisher, a log line,
//! a test recorder) is wiring.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// The announcement that one sub-suite environment exists. `event_id` equals
/// the sub-suite's environment id, which is what makes announcements
/// at-most-once: a second publish of the same environment is rejected by the
/// store before it reaches the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentDefined {
    pub event_id: Uuid,
    pub name: String,
    pub uri: String,
    /// Activity id correlating every event of one checkout.
    pub context: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conclusion {
    Successful,
    Unsuccessful,
}

#[async_trait]
pub trait EventClient: Send + Sync {
    /// Announce the start of an activity; returns the activity id used as
    /// the CONTEXT link of everything that follows.
    async fn activity_triggered(&self, name: &str, context_link: Option<&str>) -> Uuid;

    async fn activity_started(&self, activity: Uuid);

    async fn activity_finished(
        &self,
        activity: Uuid,
        conclusion: Conclusion,
        description: Option<&str>,
    );

    async fn environment_defined(&self, event: EnvironmentDefined);
}

/// Event client that writes every event to the log. Stands in wherever no
/// bus is connected.
#[derive(Debug, Default)]
pub struct LoggingEventClient;

#[async_trait]
impl EventClient for LoggingEventClient {
    async fn activity_triggered(&self, name: &str, context_link: Option<&str>) -> Uuid {
        let activity = Uuid::new_v4();
        info!(%activity, name, ?context_link, "activity triggered");
        activity
    }

    async fn activity_started(&self, activity: Uuid) {
        info!(%activity, "activity started");
    }

    async fn activity_finished(
        &self,
        activity: Uuid,
        conclusion: Conclusion,
        description: Option<&str>,
    ) {
        info!(%activity, ?conclusion, ?description, "activity finished");
    }

    async fn environment_defined(&self, event: EnvironmentDefined) {
        info!(
            event_id = %event.event_id,
            name = %event.name,
            uri = %event.uri,
            context = %event.context,
            "environment defined"
        );
    }
}

/// Test double that records everything it is handed.
#[derive(Debug, Default)]
pub struct RecordingEventClient {
    pub environments: Mutex<Vec<EnvironmentDefined>>,
    pub finished: Mutex<Vec<(Uuid, Conclusion)>>,
}

#[async_trait]
impl EventClient for RecordingEventClient {
    async fn activity_triggered(&self, _name: &str, _context_link: Option<&str>) -> Uuid {
        Uuid::new_v4()
    }

    async fn activity_started(&self, _activity: Uuid) {}

    async fn activity_finished(
        &self,
        activity: Uuid,
        conclusion: Conclusion,
        _description: Option<&str>,
    ) {
        self.finished.lock().unwrap_or_else(|e| e.into_inner()).push((activity, conclusion));
    }

    async fn environment_defined(&self, event: EnvironmentDefined) {
        self.environments.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}
