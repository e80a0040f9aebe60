//! # Message Transport
//!
//! Named durable queues connecting one meter to one PV consumer.
//!
//! Delivery guarantees expected from every backend:
//! - at-least-once: a delivery that is never acknowledged is handed out again
//! - a negatively acknowledged delivery goes back to the queue for another attempt
//! - FIFO per publisher; no ordering across publishers sharing a queue
//!
//! Backends:
//! - [`MemoryBroker`]: in-process queues, used by `simulate` and in tests
//! - [`NatsTransport`]: JetStream file-backed stream with an explicit-ack durable consumer

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{TransportConfig, TransportKind};

pub use memory::{MemoryBroker, MemoryPublisher, MemorySubscriber};
#[cfg(feature = "nats")]
pub use nats::{NatsPublisher, NatsSubscriber, NatsTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("Failed to declare queue {queue}: {reason}")]
    Declare { queue: String, reason: String },
    #[error("Publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },
    #[error("Receive from {queue} failed: {reason}")]
    Receive { queue: String, reason: String },
    #[error("Acknowledge failed: {0}")]
    Ack(String),
    #[error("Failed to close {queue}: {reason}")]
    Close { queue: String, reason: String },
    #[error("Transport for {0} is closed")]
    Closed(String),
}

/// Queue (routing key) shared by the meter and PV of one site
pub fn queue_name(pv_id: &str) -> String {
    format!("home_power_data_{pv_id}")
}

#[async_trait]
pub trait Publisher: Send {
    fn queue(&self) -> &str;

    async fn publish(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Flush pending publishes and release the connection. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Subscriber: Send {
    fn queue(&self) -> &str;

    /// Wait for the next delivery. `None` once the subscription has ended.
    async fn next(&mut self) -> Option<Result<Delivery, TransportError>>;

    /// Stop receiving; unacknowledged deliveries go back to the queue. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Settles a single delivery with the backend
#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;

    /// Hand the delivery back to the queue for another attempt
    async fn nack(self: Box<Self>) -> Result<(), TransportError>;
}

/// A message handed to a subscriber, pending acknowledgement
pub struct Delivery {
    payload: Vec<u8>,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, acker: Box<dyn Acknowledge>) -> Self {
        Self { payload, acker }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    pub async fn nack(self) -> Result<(), TransportError> {
        self.acker.nack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .finish_non_exhaustive()
    }
}

/// Connected transport backend, cheap to clone
#[derive(Clone)]
pub enum Transport {
    Memory(MemoryBroker),
    #[cfg(feature = "nats")]
    Nats(NatsTransport),
}

impl Transport {
    pub async fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        match config.kind {
            TransportKind::Memory => Ok(Self::Memory(MemoryBroker::new())),
            #[cfg(feature = "nats")]
            TransportKind::Nats => Ok(Self::Nats(NatsTransport::connect(&config.url).await?)),
            #[cfg(not(feature = "nats"))]
            TransportKind::Nats => Err(TransportError::Connect {
                url: config.url.clone(),
                reason: "built without the `nats` feature".to_string(),
            }),
        }
    }

    pub async fn publisher(&self, queue: &str) -> Result<Box<dyn Publisher>, TransportError> {
        match self {
            Self::Memory(broker) => Ok(Box::new(broker.publisher(queue))),
            #[cfg(feature = "nats")]
            Self::Nats(nats) => Ok(Box::new(nats.publisher(queue).await?)),
        }
    }

    pub async fn subscriber(&self, queue: &str) -> Result<Box<dyn Subscriber>, TransportError> {
        match self {
            Self::Memory(broker) => Ok(Box::new(broker.subscriber(queue))),
            #[cfg(feature = "nats")]
            Self::Nats(nats) => Ok(Box::new(nats.subscriber(queue).await?)),
        }
    }
}
