//! In-process broker for tests and local runs.
//!
//! [`InMemoryBroker`] is both the [`SubscriptionConnector`] and the shared
//! queue behind every subscription it opens. Abandoned messages go to the
//! back of the queue with their delivery count bumped. Failures can be
//! queued up to exercise the pump's recovery paths.

use super::transport::{MessageTransport, ReceiverOptions, SubscriptionConnector};
use crate::descriptor::SubscriptionDescriptor;
use crate::error::TransportError;
use crate::types::InboundMessage;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// A recorded `connect` call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRecord {
    /// Topic parsed from the descriptor
    pub topic: String,
    /// Subscription name
    pub subscription_name: String,
    /// Receiver options requested by the pump
    pub options: ReceiverOptions,
}

#[derive(Default)]
struct BrokerState {
    queue: VecDeque<InboundMessage>,
    completed: Vec<String>,
    abandoned: Vec<String>,
    connects: Vec<ConnectRecord>,
    closes: usize,
    receive_failures: VecDeque<TransportError>,
    connect_failures: VecDeque<TransportError>,
}

/// Shared in-memory topic subscription
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a message
    pub fn publish(&self, message: InboundMessage) {
        self.lock().queue.push_back(message);
    }

    /// Messages waiting for delivery
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Ids of completed messages, in order
    pub fn completed(&self) -> Vec<String> {
        self.lock().completed.clone()
    }

    /// Ids of abandoned messages, in order
    pub fn abandoned(&self) -> Vec<String> {
        self.lock().abandoned.clone()
    }

    /// Every `connect` call so far
    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.lock().connects.clone()
    }

    /// Number of closed subscriptions
    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    /// Make the next `receive` fail with `error`
    pub fn fail_next_receive(&self, error: TransportError) {
        self.lock().receive_failures.push_back(error);
    }

    /// Make the next `connect` fail with `error`
    pub fn fail_next_connect(&self, error: TransportError) {
        self.lock().connect_failures.push_back(error);
    }
}

#[async_trait]
impl SubscriptionConnector for InMemoryBroker {
    async fn connect(
        &self,
        descriptor: &SubscriptionDescriptor,
        options: ReceiverOptions,
    ) -> Result<Box<dyn MessageTransport>, TransportError> {
        if !options.is_sequential() {
            return Err(TransportError::Other(format!(
                "receiver must be sequential with explicit acknowledgment, got {options:?}"
            )));
        }
        let mut state = self.lock();
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }
        state.connects.push(ConnectRecord {
            topic: descriptor.topic.clone(),
            subscription_name: descriptor.subscription_name.clone(),
            options,
        });
        Ok(Box::new(InMemorySubscription {
            broker: self.clone(),
        }))
    }
}

struct InMemorySubscription {
    broker: InMemoryBroker,
}

#[async_trait]
impl MessageTransport for InMemorySubscription {
    async fn receive(&self) -> Result<Option<InboundMessage>, TransportError> {
        let mut state = self.broker.lock();
        if let Some(error) = state.receive_failures.pop_front() {
            return Err(error);
        }
        Ok(state.queue.pop_front())
    }

    async fn complete(&self, message: &InboundMessage) -> Result<(), TransportError> {
        self.broker.lock().completed.push(message.message_id.clone());
        Ok(())
    }

    async fn abandon(&self, message: &InboundMessage) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.abandoned.push(message.message_id.clone());
        let mut redelivery = message.clone();
        redelivery.delivery_count += 1;
        state.queue.push_back(redelivery);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.lock().closes += 1;
        Ok(())
    }
}
