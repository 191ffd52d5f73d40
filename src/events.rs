//! Push channel keyed by task id; fan-out to subscribers; at-least-once
//! delivery of status/progress/completion events (spec §4.8).
//!
//! Grounded in `tokio::sync::broadcast`, the same fan-out primitive the
//! `hydai-murmur` pipeline orchestrator uses for its own event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::task::Status;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Status { status: Box<Status> },
    Progress {
        step_name: String,
        progress: u8,
        current_segment: Option<usize>,
        total_segments: Option<usize>,
    },
    ResynthesizeComplete { segment_id: usize },
    RegenerateComplete,
    Error { kind: String, message: String },
    Backpressure,
}

/// The envelope published on every event (spec §3 EventBus envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

struct TaskChannel {
    sender: broadcast::Sender<Event>,
    last_status: Option<Status>,
}

/// Keyed broadcast fan-out with snapshot-on-subscribe (spec §4.8).
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<Mutex<HashMap<String, TaskChannel>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    async fn channel_for(&self, task_id: &str) -> broadcast::Sender<Event> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| TaskChannel {
                sender: broadcast::channel(self.capacity).0,
                last_status: None,
            })
            .sender
            .clone()
    }

    /// Non-blocking publish; if every subscriber's queue is saturated
    /// the oldest events are dropped for them automatically by
    /// `broadcast`'s lagging-receiver semantics (spec §4.8).
    pub async fn publish(&self, task_id: &str, payload: EventPayload) {
        if let EventPayload::Status { status } = &payload {
            let mut channels = self.channels.lock().await;
            let entry = channels.entry(task_id.to_string()).or_insert_with(|| TaskChannel {
                sender: broadcast::channel(self.capacity).0,
                last_status: None,
            });
            entry.last_status = Some((**status).clone());
        }

        let sender = self.channel_for(task_id).await;
        let event = Event {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            payload,
        };

        match sender.send(event) {
            Ok(_) => {}
            Err(broadcast::error::SendError(_)) => {
                debug!(task_id, "event published with no active subscribers");
            }
        }
    }

    /// Subscribes to a task's event stream. The current status, if any,
    /// is delivered first as a synthetic `Status` event (snapshot-on-
    /// subscribe, spec §4.8).
    pub async fn subscribe(&self, task_id: &str) -> (Option<Event>, broadcast::Receiver<Event>) {
        let mut channels = self.channels.lock().await;
        let entry = channels.entry(task_id.to_string()).or_insert_with(|| TaskChannel {
            sender: broadcast::channel(self.capacity).0,
            last_status: None,
        });

        let snapshot = entry.last_status.clone().map(|status| Event {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            payload: EventPayload::Status { status: Box::new(status) },
        });

        (snapshot, entry.sender.subscribe())
    }
}

/// Drains a receiver until it catches up, surfacing a `Backpressure`
/// marker for the events it skipped (spec §4.8: "oldest event is dropped
/// and a backpressure marker is sent"). Intended for use by transports
/// (the WebSocket boundary) that want an explicit signal rather than
/// silently resuming after a `Lagged` error.
pub async fn recv_or_backpressure(receiver: &mut broadcast::Receiver<Event>) -> Option<Event> {
    loop {
        match receiver.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "subscriber lagged, events dropped");
                return Some(Event {
                    task_id: String::new(),
                    timestamp: Utc::now(),
                    payload: EventPayload::Backpressure,
                });
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{PauseAfter, StartRequest, TaskStatus};

    fn sample_status() -> Status {
        let req = StartRequest {
            source_media_path: "/tmp/x.mp4".into(),
            source_lang: "en".to_string(),
            target_lang: "es".to_string(),
            single_speaker: true,
            pause_after: Some(PauseAfter::Step4),
        };
        Status::new(&req, "t1".to_string(), Utc::now())
    }

    #[tokio::test]
    async fn test_subscribe_before_publish_yields_no_snapshot() {
        let bus = EventBus::new(8);
        let (snapshot, _rx) = bus.subscribe("t1").await;
        assert!(snapshot.is_none());
    }

    #[tokio::test]
    async fn test_late_subscriber_receives_snapshot() {
        let bus = EventBus::new(8);
        bus.publish("t1", EventPayload::Status { status: Box::new(sample_status()) }).await;

        let (snapshot, _rx) = bus.subscribe("t1").await;
        assert!(matches!(snapshot, Some(Event { payload: EventPayload::Status { .. }, .. })));
    }

    #[tokio::test]
    async fn test_publish_delivers_to_subscriber() {
        let bus = EventBus::new(8);
        let (_, mut rx) = bus.subscribe("t1").await;

        bus.publish(
            "t1",
            EventPayload::Progress {
                step_name: "transcribe".to_string(),
                progress: 50,
                current_segment: Some(2),
                total_segments: Some(10),
            },
        )
        .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, "t1");
        assert!(matches!(event.payload, EventPayload::Progress { progress: 50, .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_both_receive() {
        let bus = EventBus::new(8);
        let (_, mut rx1) = bus.subscribe("t1").await;
        let (_, mut rx2) = bus.subscribe("t1").await;

        bus.publish("t1", EventPayload::RegenerateComplete).await;

        assert!(matches!(rx1.recv().await.unwrap().payload, EventPayload::RegenerateComplete));
        assert!(matches!(rx2.recv().await.unwrap().payload, EventPayload::RegenerateComplete));
    }
}
