//! Job lifecycle notifications for live subscribers.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Kind of a job lifecycle event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JobEventType {
    JobCreated,
    JobStarted,
    JobStopRequested,
    ItemStarted,
    ItemProgress,
    ItemCompleted,
    ItemFailed,
    JobCompleted,
    JobStopped,
    JobFailed,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::JobCreated => "job-created",
            JobEventType::JobStarted => "job-started",
            JobEventType::JobStopRequested => "job-stop-requested",
            JobEventType::ItemStarted => "item-started",
            JobEventType::ItemProgress => "item-progress",
            JobEventType::ItemCompleted => "item-completed",
            JobEventType::ItemFailed => "item-failed",
            JobEventType::JobCompleted => "job-completed",
            JobEventType::JobStopped => "job-stopped",
            JobEventType::JobFailed => "job-failed",
        }
    }
}

impl fmt::Display for JobEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub event_type: JobEventType,
    pub job_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Fire-and-forget fan-out of job events.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publishes an event. Never blocks and never fails.
    pub fn publish(
        &self,
        event_type: JobEventType,
        job_id: &str,
        message: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) {
        let event = JobEvent {
            event_type,
            job_id: job_id.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
            payload,
        };
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(JobEventType::JobCreated, "j1", "created", None);
    }

    #[test]
    fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(JobEventType::JobStarted, "j1", "started", None);
        bus.publish(
            JobEventType::ItemProgress,
            "j1",
            "page 1/3",
            Some(serde_json::json!({"imageDone": 1, "imageTotal": 3})),
        );

        let first = rx.try_recv().unwrap();
        assert_eq!(first.event_type, JobEventType::JobStarted);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.payload.unwrap()["imageDone"], 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_serializes_kebab_type() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        bus.publish(JobEventType::JobStopRequested, "j9", "stop", None);
        let json = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["type"], "job-stop-requested");
        assert_eq!(json["jobId"], "j9");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_slow_subscriber_does_not_block_publisher() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..10 {
            bus.publish(JobEventType::ItemProgress, "j", format!("{}", i), None);
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }
}
