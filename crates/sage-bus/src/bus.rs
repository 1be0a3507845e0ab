use std::collections::HashMap;
use std::sync::Mutex;

use sage_models::AgentMessage;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::BusError;

/// In-process publish/subscribe transport addressed by named topics.
///
/// Each topic is a `tokio::sync::broadcast` channel created on first use.
/// Delivery is at-least-once within a connected session: a lagging receiver
/// may observe `Lagged` and must treat skipped messages as lost. There is no
/// ordering guarantee across topics.
pub struct MessageBus {
    topics: Mutex<HashMap<String, broadcast::Sender<AgentMessage>>>,
    channel_capacity: usize,
}

impl MessageBus {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            channel_capacity,
        }
    }

    /// Subscribe to a topic, creating its channel if it does not exist yet.
    pub fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<AgentMessage>, BusError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|e| BusError::Unavailable(format!("topic map poisoned: {e}")))?;

        let sender = topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic, "Creating bus topic");
            broadcast::channel(self.channel_capacity).0
        });

        Ok(sender.subscribe())
    }

    /// Publish a message to a topic.
    ///
    /// Returns the number of receivers the message was delivered to. A topic
    /// with no live subscribers is a transport failure from the publisher's
    /// point of view: the message would be lost, so the caller must know.
    pub fn publish(&self, topic: &str, message: AgentMessage) -> Result<usize, BusError> {
        let topics = self
            .topics
            .lock()
            .map_err(|e| BusError::Unavailable(format!("topic map poisoned: {e}")))?;

        let sender = topics
            .get(topic)
            .ok_or_else(|| BusError::NoSubscribers(topic.to_string()))?;

        sender
            .send(message)
            .map_err(|_| BusError::NoSubscribers(topic.to_string()))
    }
}
