//! Per-task event fan-out.
//!
//! Subscribers get a live stream of persisted interactions and status changes
//! starting at the moment of subscription; transcript back-fill is a separate
//! query. A subscriber that falls more than the channel capacity behind is
//! dropped so the executor never blocks on a slow consumer.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::EngineError;
use crate::domain::models::{Interaction, TaskStatus};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// One event on a task's stream.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Interaction(Interaction),
    StatusChange { from: TaskStatus, to: TaskStatus },
    /// Terminal event: the task and its log are gone.
    TaskDeleted,
}

pub struct EventFanOut {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<TaskEvent>>>,
    capacity: usize,
}

impl Default for EventFanOut {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl EventFanOut {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribe to a task's live events.
    pub async fn subscribe(&self, task_id: Uuid) -> TaskEventStream {
        let mut channels = self.channels.write().await;
        let sender = channels
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        TaskEventStream {
            task_id,
            inner: BroadcastStream::new(sender.subscribe()),
            lagged: false,
        }
    }

    /// Publish an event to all live subscribers of a task.
    pub async fn publish(&self, task_id: Uuid, event: TaskEvent) {
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(&task_id) {
            // A send error just means nobody is listening.
            let _ = sender.send(event);
        }
    }

    /// Close a task's stream: deliver the terminal event and detach all
    /// subscribers.
    pub async fn close(&self, task_id: Uuid) {
        let mut channels = self.channels.write().await;
        if let Some(sender) = channels.remove(&task_id) {
            let _ = sender.send(TaskEvent::TaskDeleted);
            debug!(task_id = %task_id, "fan-out channel closed");
        }
    }

    pub async fn subscriber_count(&self, task_id: Uuid) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(&task_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

/// A single subscriber's view of a task's events.
pub struct TaskEventStream {
    task_id: Uuid,
    inner: BroadcastStream<TaskEvent>,
    lagged: bool,
}

impl TaskEventStream {
    /// Next event, or `None` once the stream ends - because the task was
    /// deleted, the engine shut down, or this subscriber lagged too far
    /// behind and was dropped.
    pub async fn next(&mut self) -> Option<TaskEvent> {
        if self.lagged {
            return None;
        }
        match self.inner.next().await {
            Some(Ok(event)) => Some(event),
            Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                warn!(
                    task_id = %self.task_id,
                    skipped,
                    error = %EngineError::SubscriberLagged,
                    "subscriber dropped"
                );
                self.lagged = true;
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Interaction;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let fanout = EventFanOut::default();
        let task_id = Uuid::new_v4();
        let mut stream = fanout.subscribe(task_id).await;

        let first = Interaction::user_request(task_id, "first");
        let second = Interaction::assistant_response(task_id, "second");
        fanout
            .publish(task_id, TaskEvent::Interaction(first.clone()))
            .await;
        fanout
            .publish(task_id, TaskEvent::Interaction(second.clone()))
            .await;

        match stream.next().await {
            Some(TaskEvent::Interaction(i)) => assert_eq!(i.content, "first"),
            other => panic!("unexpected event: {other:?}"),
        }
        match stream.next().await {
            Some(TaskEvent::Interaction(i)) => assert_eq!(i.content, "second"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_backfill_before_subscription() {
        let fanout = EventFanOut::default();
        let task_id = Uuid::new_v4();

        fanout
            .publish(
                task_id,
                TaskEvent::Interaction(Interaction::user_request(task_id, "early")),
            )
            .await;

        let mut stream = fanout.subscribe(task_id).await;
        fanout
            .publish(
                task_id,
                TaskEvent::Interaction(Interaction::user_request(task_id, "late")),
            )
            .await;

        match stream.next().await {
            Some(TaskEvent::Interaction(i)) => assert_eq!(i.content, "late"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_dropped_without_blocking_publisher() {
        let fanout = EventFanOut::new(4);
        let task_id = Uuid::new_v4();
        let mut stream = fanout.subscribe(task_id).await;

        for i in 0..32 {
            fanout
                .publish(
                    task_id,
                    TaskEvent::Interaction(Interaction::user_request(task_id, format!("m{i}"))),
                )
                .await;
        }

        // The slow subscriber is terminated instead of seeing a gap.
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_delivers_terminal_event() {
        let fanout = EventFanOut::default();
        let task_id = Uuid::new_v4();
        let mut stream = fanout.subscribe(task_id).await;

        fanout.close(task_id).await;

        assert!(matches!(stream.next().await, Some(TaskEvent::TaskDeleted)));
        assert!(stream.next().await.is_none());
        assert_eq!(fanout.subscriber_count(task_id).await, 0);
    }

    #[tokio::test]
    async fn test_status_change_events() {
        let fanout = EventFanOut::default();
        let task_id = Uuid::new_v4();
        let mut stream = fanout.subscribe(task_id).await;

        fanout
            .publish(
                task_id,
                TaskEvent::StatusChange {
                    from: TaskStatus::Pending,
                    to: TaskStatus::Running,
                },
            )
            .await;

        match stream.next().await {
            Some(TaskEvent::StatusChange { from, to }) => {
                assert_eq!(from, TaskStatus::Pending);
                assert_eq!(to, TaskStatus::Running);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
