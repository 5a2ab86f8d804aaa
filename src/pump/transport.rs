//! Messaging capability consumed by the pump.

use crate::descriptor::SubscriptionDescriptor;
use crate::error::TransportError;
use crate::types::InboundMessage;
use async_trait::async_trait;

/// Receiver settings passed to the messaging collaborator
///
/// The pump handles one message at a time and acknowledges explicitly, so
/// [`ReceiverOptions::sequential`] is the only constructor it uses.
/// Throughput is bounded to one in-flight message per subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// Handler invocations allowed at once
    pub max_concurrent_calls: u32,
    /// Whether the transport acknowledges on its own after the handler returns
    pub auto_complete: bool,
    /// Messages the transport may buffer ahead of the handler
    pub prefetch_count: u32,
}

impl ReceiverOptions {
    /// One handler at a time, explicit acknowledgment
    pub fn sequential(prefetch_count: u32) -> Self {
        Self {
            max_concurrent_calls: 1,
            auto_complete: false,
            prefetch_count,
        }
    }

    /// Whether the options satisfy the single-handler contract
    pub fn is_sequential(&self) -> bool {
        self.max_concurrent_calls == 1 && !self.auto_complete
    }
}

/// An open subscription
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Receive the next message, or `None` when nothing is waiting
    async fn receive(&self) -> Result<Option<InboundMessage>, TransportError>;

    /// Acknowledge `message`; the broker deletes it
    async fn complete(&self, message: &InboundMessage) -> Result<(), TransportError>;

    /// Return `message` to the broker for redelivery
    async fn abandon(&self, message: &InboundMessage) -> Result<(), TransportError>;

    /// Close the subscription
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens subscriptions from a connection descriptor
#[async_trait]
pub trait SubscriptionConnector: Send + Sync {
    /// Open the subscription named by `descriptor`
    async fn connect(
        &self,
        descriptor: &SubscriptionDescriptor,
        options: ReceiverOptions,
    ) -> Result<Box<dyn MessageTransport>, TransportError>;
}
