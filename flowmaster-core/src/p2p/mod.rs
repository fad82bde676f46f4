//! Message substrate contract
//!
//! Handlers are registered per topic; outbound messages are sent to a node.
//! `router` provides in-process implementations of both sides.

pub mod router;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::{Message, NodeId, Topic};

pub use router::{MessageRouter, OutboxSender, SentMessage};

/// Callback invoked for every message delivered on a topic
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, sender: NodeId, message: Message) -> Result<()>;
}

/// Registers topic handlers and reports their health
#[async_trait]
pub trait MessageHandlerManager: Send + Sync {
    /// Register `handler` for `topic`.
    ///
    /// Returns `Ok(false)` if a handler already exists for the topic.
    async fn register_handler(
        &self,
        ctx: &CancellationToken,
        topic: Topic,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<bool>;

    /// First error raised by any registered handler
    async fn check_error(&self, ctx: &CancellationToken) -> Result<()>;

    /// Remove every handler registered through this manager
    async fn clean(&self, ctx: &CancellationToken) -> Result<()>;
}

/// Sends messages to other nodes
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Returns `Ok(false)` if the message could not be delivered right now
    async fn send_to_node(
        &self,
        ctx: &CancellationToken,
        node_id: &str,
        topic: Topic,
        message: Message,
    ) -> Result<bool>;
}
