//! In-process message substrate
//!
//! `MessageRouter` keeps one handler per topic and delivers inbound messages
//! to it. `OutboxSender` records outbound messages per node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{MessageHandler, MessageHandlerManager, MessageSender};
use crate::error::{MasterError, Result};
use crate::protocol::{Message, NodeId, Topic};

/// Topic-keyed handler registry with inbound delivery
#[derive(Default)]
pub struct MessageRouter {
    handlers: DashMap<Topic, Arc<dyn MessageHandler>>,
    first_error: Mutex<Option<MasterError>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` from `sender` to the handler of `topic`.
    ///
    /// A handler error is remembered and reported by `check_error`.
    pub async fn deliver(&self, sender: &str, topic: &str, message: Message) -> Result<()> {
        let handler = self
            .handlers
            .get(topic)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MasterError::Message {
                topic: topic.into(),
                reason: "no handler registered".into(),
            })?;

        debug!(topic, sender, kind = message.kind(), "Delivering message");
        if let Err(e) = handler.handle(sender.to_string(), message).await {
            warn!(topic, error = %e, "Message handler failed");
            let mut slot = self.first_error.lock();
            if slot.is_none() {
                *slot = Some(e.clone());
            }
            return Err(e);
        }
        Ok(())
    }

    /// Whether a handler is registered for `topic`
    pub fn has_handler(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait]
impl MessageHandlerManager for MessageRouter {
    async fn register_handler(
        &self,
        _ctx: &CancellationToken,
        topic: Topic,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<bool> {
        match self.handlers.entry(topic.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                info!(topic = %topic, "Registered message handler");
                Ok(true)
            }
        }
    }

    async fn check_error(&self, _ctx: &CancellationToken) -> Result<()> {
        match self.first_error.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn clean(&self, _ctx: &CancellationToken) -> Result<()> {
        let count = self.handlers.len();
        self.handlers.clear();
        *self.first_error.lock() = None;
        info!(count, "Cleaned message handlers");
        Ok(())
    }
}

/// A message recorded by `OutboxSender`
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub node_id: NodeId,
    pub topic: Topic,
    pub message: Message,
}

/// Sender that records messages instead of transmitting them
#[derive(Default)]
pub struct OutboxSender {
    sent: Mutex<Vec<SentMessage>>,
    undeliverable: AtomicBool,
    failing: AtomicBool,
}

impl OutboxSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every send as not delivered
    pub fn set_undeliverable(&self, undeliverable: bool) {
        self.undeliverable.store(undeliverable, Ordering::SeqCst);
    }

    /// Fail every send with an error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Messages sent so far
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Messages sent on `topic`
    pub fn sent_on(&self, topic: &str) -> Vec<SentMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageSender for OutboxSender {
    async fn send_to_node(
        &self,
        _ctx: &CancellationToken,
        node_id: &str,
        topic: Topic,
        message: Message,
    ) -> Result<bool> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MasterError::Message {
                topic,
                reason: format!("send to node {} failed", node_id),
            });
        }
        if self.undeliverable.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.sent.lock().push(SentMessage {
            node_id: node_id.to_string(),
            topic,
            message,
        });
        Ok(true)
    }
}
