//! In-process broker with named durable queues.
//!
//! Queues outlive their publishers and subscribers for as long as the broker lives.
//! Deliveries stay "in flight" until acknowledged. A negative acknowledgement puts the
//! delivery straight back at the head of the queue; closing or dropping a subscriber does the
//! same for all of its in-flight deliveries, in their original order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::{Acknowledge, Delivery, Publisher, Subscriber, TransportError};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(u64, Vec<u8>)>,
    in_flight: BTreeMap<u64, (u64, Vec<u8>)>,
    next_tag: u64,
    next_subscriber: u64,
}

#[derive(Default)]
struct Queue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl Queue {
    fn requeue_from(&self, subscriber_id: u64) -> usize {
        let mut state = self.state.lock();
        let tags: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, (owner, _))| *owner == subscriber_id)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags.iter().rev() {
            if let Some((_, payload)) = state.in_flight.remove(tag) {
                state.ready.push_front((*tag, payload));
            }
        }
        drop(state);

        if !tags.is_empty() {
            self.available.notify_one();
        }
        tags.len()
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<String, Arc<Queue>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn declare(&self, name: &str) -> Arc<Queue> {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn publisher(&self, queue: &str) -> MemoryPublisher {
        MemoryPublisher {
            name: queue.to_string(),
            queue: self.declare(queue),
            closed: false,
        }
    }

    pub fn subscriber(&self, queue: &str) -> MemorySubscriber {
        let shared = self.declare(queue);
        let id = {
            let mut state = shared.state.lock();
            state.next_subscriber += 1;
            state.next_subscriber
        };
        MemorySubscriber {
            name: queue.to_string(),
            queue: shared,
            id,
            closed: false,
        }
    }

    /// Messages waiting to be delivered
    pub fn ready_count(&self, queue: &str) -> usize {
        self.declare(queue).state.lock().ready.len()
    }

    /// Messages delivered but not yet acknowledged
    pub fn in_flight_count(&self, queue: &str) -> usize {
        self.declare(queue).state.lock().in_flight.len()
    }
}

pub struct MemoryPublisher {
    name: String,
    queue: Arc<Queue>,
    closed: bool,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    fn queue(&self) -> &str {
        &self.name
    }

    async fn publish(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed(self.name.clone()));
        }
        {
            let mut state = self.queue.state.lock();
            let tag = state.next_tag;
            state.next_tag += 1;
            state.ready.push_back((tag, payload));
        }
        self.queue.available.notify_one();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

pub struct MemorySubscriber {
    name: String,
    queue: Arc<Queue>,
    id: u64,
    closed: bool,
}

impl MemorySubscriber {
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let requeued = self.queue.requeue_from(self.id);
        if requeued > 0 {
            debug!(queue = %self.name, requeued, "returned unacknowledged deliveries");
        }
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    fn queue(&self) -> &str {
        &self.name
    }

    async fn next(&mut self) -> Option<Result<Delivery, TransportError>> {
        loop {
            if self.closed {
                return None;
            }
            {
                let mut state = self.queue.state.lock();
                if let Some((tag, payload)) = state.ready.pop_front() {
                    state.in_flight.insert(tag, (self.id, payload.clone()));
                    let acker = MemoryAck {
                        queue: self.queue.clone(),
                        tag,
                    };
                    return Some(Ok(Delivery::new(payload, Box::new(acker))));
                }
            }
            self.queue.available.notified().await;
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        self.release();
    }
}

struct MemoryAck {
    queue: Arc<Queue>,
    tag: u64,
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.queue
            .state
            .lock()
            .in_flight
            .remove(&self.tag)
            .map(|_| ())
            .ok_or_else(|| TransportError::Ack(format!("unknown delivery tag {}", self.tag)))
    }

    async fn nack(self: Box<Self>) -> Result<(), TransportError> {
        {
            let mut state = self.queue.state.lock();
            let (_, payload) = state
                .in_flight
                .remove(&self.tag)
                .ok_or_else(|| TransportError::Ack(format!("unknown delivery tag {}", self.tag)))?;
            state.ready.push_front((self.tag, payload));
        }
        self.queue.available.notify_one();
        Ok(())
    }
}
