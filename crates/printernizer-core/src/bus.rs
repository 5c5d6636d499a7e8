// SPDX-License-Identifier: AGPL-3.0-or-later
//
// In-process topic-based publish/subscribe.
//
// Publish is fire-and-forget. Every subscriber owns an unbounded channel
// drained by its own task, so a slow or failing subscriber can never block
// the publisher or starve its peers. Delivery is best-effort at-least-once
// within one process lifetime; nothing persists across restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

/// Topics emitted by the fleet core.
pub mod topics {
    pub const PRINTER_STATUS_UPDATE: &str = "printer_status_update";
    pub const PRINTER_CONNECTED: &str = "printer_connected";
    pub const PRINTER_DISCONNECTED: &str = "printer_disconnected";
    pub const PRINTER_MONITORING_STARTED: &str = "printer_monitoring_started";
    pub const PRINTER_MONITORING_STOPPED: &str = "printer_monitoring_stopped";
    pub const PRINTER_CONNECTION_PROGRESS: &str = "printer_connection_progress";
    pub const FILES_DISCOVERED: &str = "files_discovered";
    pub const FILE_SYNC_COMPLETE: &str = "file_sync_complete";
    pub const FILE_DOWNLOAD_STARTED: &str = "file_download_started";
    pub const FILE_DOWNLOAD_COMPLETE: &str = "file_download_complete";
    pub const FILE_DOWNLOAD_FAILED: &str = "file_download_failed";
    pub const FILE_NEEDS_THUMBNAIL_PROCESSING: &str = "file_needs_thumbnail_processing";
    pub const FILE_THUMBNAILS_PROCESSED: &str = "file_thumbnails_processed";
    pub const FILE_METADATA_EXTRACTED: &str = "file_metadata_extracted";
    pub const FILE_DELETED: &str = "file_deleted";
    pub const JOB_AUTO_CREATED: &str = "job_auto_created";
    pub const LIBRARY_ADD_REQUEST: &str = "library_add_request";
    pub const SYSTEM_EVENT: &str = "system_event";
}

/// An event as delivered to subscribers. Payloads are plain structured JSON;
/// file content never rides the bus.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<Event>>>;

/// The process-internal event bus. Cheap to clone; all clones share the same
/// subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event. Never blocks and never fails from the publisher's
    /// perspective; closed subscriber channels are pruned in passing.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        let event = Event {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
        };

        let mut table = self.subscribers.lock().expect("bus lock poisoned");
        if let Some(senders) = table.get_mut(topic) {
            senders.retain(|sender| sender.send(event.clone()).is_ok());
            debug!(topic, subscribers = senders.len(), "event published");
        }
    }

    /// Subscribe to a topic, receiving events on the returned channel. The
    /// caller drains it at its own pace — queueing pressure is the
    /// subscriber's problem, not the publisher's.
    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Event> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("bus lock poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(sender);
        receiver
    }

    /// Subscribe with an async handler run in its own task. Handler errors
    /// are logged and isolated — they never reach the publisher or other
    /// subscribers.
    pub fn subscribe_handler<F, Fut>(&self, topic: &str, handler: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Event) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let mut receiver = self.subscribe(topic);
        let topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(e) = handler(event).await {
                    warn!(topic = %topic, error = %e, "event handler failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut first = bus.subscribe(topics::FILE_DOWNLOAD_COMPLETE);
        let mut second = bus.subscribe(topics::FILE_DOWNLOAD_COMPLETE);

        bus.publish(
            topics::FILE_DOWNLOAD_COMPLETE,
            serde_json::json!({"file_id": "p1_a.3mf"}),
        );

        let a = first.recv().await.expect("first subscriber");
        let b = second.recv().await.expect("second subscriber");
        assert_eq!(a.payload["file_id"], "p1_a.3mf");
        assert_eq!(b.payload["file_id"], "p1_a.3mf");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(topics::FILE_DELETED, serde_json::json!({}));
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_break_others() {
        let bus = EventBus::new();
        let dropped = bus.subscribe(topics::PRINTER_STATUS_UPDATE);
        drop(dropped);
        let mut alive = bus.subscribe(topics::PRINTER_STATUS_UPDATE);

        bus.publish(topics::PRINTER_STATUS_UPDATE, serde_json::json!({"n": 1}));
        let event = alive.recv().await.expect("still delivered");
        assert_eq!(event.payload["n"], 1);
    }

    #[tokio::test]
    async fn handler_errors_are_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_failing = Arc::clone(&seen);
        bus.subscribe_handler(topics::SYSTEM_EVENT, move |_event| {
            let seen = Arc::clone(&seen_failing);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::PrinternizerError::ProcessingFailed(
                    "boom".into(),
                ))
            }
        });

        let seen_healthy = Arc::clone(&seen);
        bus.subscribe_handler(topics::SYSTEM_EVENT, move |_event| {
            let seen = Arc::clone(&seen_healthy);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish(topics::SYSTEM_EVENT, serde_json::json!({}));
        bus.publish(topics::SYSTEM_EVENT, serde_json::json!({}));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Both handlers saw both events despite the first one failing.
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn events_are_ordered_per_subscriber() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe(topics::SYSTEM_EVENT);
        for i in 0..10 {
            bus.publish(topics::SYSTEM_EVENT, serde_json::json!({"i": i}));
        }
        for i in 0..10 {
            let event = receiver.recv().await.expect("event");
            assert_eq!(event.payload["i"], i);
        }
    }
}
