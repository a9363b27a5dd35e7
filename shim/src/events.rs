//! Task lifecycle events and the loop that hands them to the host.

use crate::error::ShimError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prost::Message;
use prost_types::{Any, Timestamp};
use skiff_core::events::events_client::EventsClient;
use skiff_core::events::{
    Envelope, ForwardRequest, TaskCreate, TaskDelete, TaskExecAdded, TaskExit, TaskStart,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::transport::Channel;

pub const EVENT_CHANNEL_CAPACITY: usize = 128;

pub const TOPIC_TASK_CREATE: &str = "/tasks/create";
pub const TOPIC_TASK_START: &str = "/tasks/start";
pub const TOPIC_TASK_EXEC_ADDED: &str = "/tasks/exec-added";
pub const TOPIC_TASK_EXIT: &str = "/tasks/exit";
pub const TOPIC_TASK_DELETE: &str = "/tasks/delete";

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Create(TaskCreate),
    Start(TaskStart),
    ExecAdded(TaskExecAdded),
    Exit(TaskExit),
    Delete(TaskDelete),
}

impl Event {
    pub fn topic(&self) -> &'static str {
        match self {
            Event::Create(_) => TOPIC_TASK_CREATE,
            Event::Start(_) => TOPIC_TASK_START,
            Event::ExecAdded(_) => TOPIC_TASK_EXEC_ADDED,
            Event::Exit(_) => TOPIC_TASK_EXIT,
            Event::Delete(_) => TOPIC_TASK_DELETE,
        }
    }

    pub fn container_id(&self) -> &str {
        match self {
            Event::Create(e) => &e.container_id,
            Event::Start(e) => &e.container_id,
            Event::ExecAdded(e) => &e.container_id,
            Event::Exit(e) => &e.container_id,
            Event::Delete(e) => &e.container_id,
        }
    }

    /// The event packed the way the host expects it inside an envelope.
    pub fn to_any(&self) -> Any {
        let (name, value) = match self {
            Event::Create(e) => ("TaskCreate", e.encode_to_vec()),
            Event::Start(e) => ("TaskStart", e.encode_to_vec()),
            Event::ExecAdded(e) => ("TaskExecAdded", e.encode_to_vec()),
            Event::Exit(e) => ("TaskExit", e.encode_to_vec()),
            Event::Delete(e) => ("TaskDelete", e.encode_to_vec()),
        };
        Any {
            type_url: format!("skiff.events.v1.{}", name),
            value,
        }
    }
}

pub fn timestamp(t: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

/// Producer side of the events channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    /// Queues `event`, waiting while the channel is full. Events sent after
    /// the publisher loop has stopped are dropped.
    pub async fn publish(&self, event: Event) {
        let topic = event.topic();
        if self.tx.send(event).await.is_err() {
            tracing::debug!(topic, "Event channel closed, dropping event");
        }
    }
}

pub fn event_channel() -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (EventSender { tx }, rx)
}

/// The host's event sink.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, event: &Event) -> Result<(), ShimError>;

    async fn close(&self) -> Result<(), ShimError>;
}

/// Drains `events` into `publisher` until every sender is gone, then closes
/// the publisher.
pub async fn forward_events(mut events: mpsc::Receiver<Event>, publisher: Arc<dyn Publisher>) {
    while let Some(event) = events.recv().await {
        let topic = event.topic();
        if let Err(e) = publisher.publish(topic, &event).await {
            tracing::error!(
                topic,
                container_id = %event.container_id(),
                error = %e,
                "Failed to publish event"
            );
        }
    }
    if let Err(e) = publisher.close().await {
        tracing::warn!(error = %e, "Failed to close event publisher");
    }
}

/// Forwards envelopes to the host's `Events` service over a Unix socket.
pub struct GrpcPublisher {
    client: EventsClient<Channel>,
    namespace: String,
}

impl GrpcPublisher {
    pub async fn connect(address: &Path, namespace: &str) -> Result<Self, ShimError> {
        let channel = skiff_vm::connect_unix(address)
            .await
            .map_err(|e| ShimError::Transport(format!("events service: {}", e)))?;
        Ok(Self {
            client: EventsClient::new(channel),
            namespace: namespace.to_string(),
        })
    }
}

#[async_trait]
impl Publisher for GrpcPublisher {
    async fn publish(&self, topic: &str, event: &Event) -> Result<(), ShimError> {
        let envelope = Envelope {
            timestamp: Some(timestamp(Utc::now())),
            namespace: self.namespace.clone(),
            topic: topic.to_string(),
            event: Some(event.to_any()),
        };
        self.client
            .clone()
            .forward(ForwardRequest {
                envelope: Some(envelope),
            })
            .await
            .map_err(|e| ShimError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ShimError> {
        tracing::debug!(namespace = %self.namespace, "Event publisher closed");
        Ok(())
    }
}

/// Publisher used when the host gave no events address.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, topic: &str, event: &Event) -> Result<(), ShimError> {
        tracing::info!(topic, container_id = %event.container_id(), "Task event");
        Ok(())
    }

    async fn close(&self) -> Result<(), ShimError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Keeps every published event in memory.
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        events: Mutex<Vec<Event>>,
        closes: AtomicUsize,
        fail: bool,
    }

    impl RecordingPublisher {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub(crate) fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        pub(crate) fn topics(&self) -> Vec<&'static str> {
            self.events().iter().map(Event::topic).collect()
        }

        pub(crate) fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        /// Polls until `count` events have arrived.
        pub(crate) async fn wait_for(&self, count: usize) -> Vec<Event> {
            for _ in 0..200 {
                if self.events.lock().unwrap().len() >= count {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            self.events()
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, _topic: &str, event: &Event) -> Result<(), ShimError> {
            if self.fail {
                return Err(ShimError::Transport("publisher down".to_string()));
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn close(&self) -> Result<(), ShimError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn start(id: &str) -> Event {
        Event::Start(TaskStart {
            container_id: id.to_string(),
            pid: 7,
        })
    }

    #[tokio::test]
    async fn test_forward_preserves_order_and_closes_once() {
        let (sender, rx) = event_channel();
        let publisher = Arc::new(RecordingPublisher::default());
        let forwarder = tokio::spawn(forward_events(rx, publisher.clone()));

        sender
            .publish(Event::Create(TaskCreate {
                container_id: "c1".into(),
                ..Default::default()
            }))
            .await;
        sender.publish(start("c1")).await;
        sender
            .publish(Event::Exit(TaskExit {
                container_id: "c1".into(),
                exit_status: 0,
                ..Default::default()
            }))
            .await;
        drop(sender);
        forwarder.await.unwrap();

        assert_eq!(
            publisher.topics(),
            vec![TOPIC_TASK_CREATE, TOPIC_TASK_START, TOPIC_TASK_EXIT]
        );
        assert_eq!(publisher.closes(), 1);
    }

    #[tokio::test]
    async fn test_publisher_errors_are_dropped() {
        let (sender, rx) = event_channel();
        let publisher = Arc::new(RecordingPublisher::failing());
        let forwarder = tokio::spawn(forward_events(rx, publisher.clone()));
        sender.publish(start("c1")).await;
        drop(sender);
        forwarder.await.unwrap();
        assert!(publisher.events().is_empty());
        assert_eq!(publisher.closes(), 1);
    }

    #[test]
    fn test_any_round_trip() {
        let any = start("c1").to_any();
        assert_eq!(any.type_url, "skiff.events.v1.TaskStart");
        let decoded = TaskStart::decode(any.value.as_slice()).unwrap();
        assert_eq!(decoded.container_id, "c1");
        assert_eq!(decoded.pid, 7);
    }
}
