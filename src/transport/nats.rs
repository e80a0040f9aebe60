//! NATS JetStream backend.
//!
//! Each queue maps to a file-backed stream of the same (upper-cased) name bound to the
//! queue name as its only subject. Consumers are durable pull consumers with explicit
//! acknowledgement, so anything not acked before a crash is redelivered after `ack_wait`;
//! a nak makes the server redeliver immediately.

use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use super::{Acknowledge, Delivery, Publisher, Subscriber, TransportError};

#[derive(Clone)]
pub struct NatsTransport {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        info!(%url, "connecting to NATS");
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let jetstream = jetstream::new(client.clone());
        Ok(Self { client, jetstream })
    }

    async fn declare(&self, queue: &str) -> Result<stream::Stream, TransportError> {
        let stream_name = stream_name(queue);
        if let Ok(existing) = self.jetstream.get_stream(&stream_name).await {
            return Ok(existing);
        }

        info!(stream = %stream_name, subject = %queue, "creating JetStream stream");
        self.jetstream
            .create_stream(stream::Config {
                name: stream_name,
                subjects: vec![queue.to_string()],
                storage: stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Declare {
                queue: queue.to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn publisher(&self, queue: &str) -> Result<NatsPublisher, TransportError> {
        self.declare(queue).await?;
        Ok(NatsPublisher {
            queue: queue.to_string(),
            client: self.client.clone(),
            jetstream: self.jetstream.clone(),
            closed: false,
        })
    }

    pub async fn subscriber(&self, queue: &str) -> Result<NatsSubscriber, TransportError> {
        let declare_err = |e: String| TransportError::Declare {
            queue: queue.to_string(),
            reason: e,
        };

        let stream = self.declare(queue).await?;
        let durable = format!("{}_consumer", queue);
        let consumer = stream
            .create_consumer(consumer::pull::Config {
                durable_name: Some(durable.clone()),
                filter_subject: queue.to_string(),
                ack_policy: consumer::AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .map_err(|e| declare_err(e.to_string()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| declare_err(e.to_string()))?;

        info!(%queue, consumer = %durable, "JetStream consumer bound");
        Ok(NatsSubscriber {
            queue: queue.to_string(),
            client: self.client.clone(),
            messages: Some(messages),
        })
    }
}

fn stream_name(queue: &str) -> String {
    queue.to_uppercase()
}

pub struct NatsPublisher {
    queue: String,
    client: async_nats::Client,
    jetstream: jetstream::Context,
    closed: bool,
}

#[async_trait]
impl Publisher for NatsPublisher {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn publish(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed(self.queue.clone()));
        }
        let publish_err = |reason: String| TransportError::Publish {
            queue: self.queue.clone(),
            reason,
        };

        let ack = self
            .jetstream
            .publish(self.queue.clone(), payload.into())
            .await
            .map_err(|e| publish_err(e.to_string()))?
            .await
            .map_err(|e| publish_err(e.to_string()))?;
        debug!(queue = %self.queue, sequence = ack.sequence, "published");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Close {
                queue: self.queue.clone(),
                reason: e.to_string(),
            })
    }
}

pub struct NatsSubscriber {
    queue: String,
    client: async_nats::Client,
    messages: Option<consumer::pull::Stream>,
}

#[async_trait]
impl Subscriber for NatsSubscriber {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn next(&mut self) -> Option<Result<Delivery, TransportError>> {
        let messages = self.messages.as_mut()?;
        match messages.next().await? {
            Ok(message) => {
                let payload = message.payload.to_vec();
                Some(Ok(Delivery::new(payload, Box::new(NatsAck(message)))))
            }
            Err(e) => Some(Err(TransportError::Receive {
                queue: self.queue.clone(),
                reason: e.to_string(),
            })),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.messages.take().is_none() {
            return Ok(());
        }
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Close {
                queue: self.queue.clone(),
                reason: e.to_string(),
            })
    }
}

struct NatsAck(jetstream::Message);

#[async_trait]
impl Acknowledge for NatsAck {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.0
            .ack()
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }

    async fn nack(self: Box<Self>) -> Result<(), TransportError> {
        self.0
            .ack_with(jetstream::AckKind::Nak(None))
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }
}
