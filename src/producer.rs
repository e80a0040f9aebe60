//! Meter side of the pipeline: generate a reading, publish it, sleep, repeat.

use std::sync::Arc;
use std::time::Duration;

use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::MeterConfig;
use crate::domain::TelemetryMessage;
use crate::error::TelemetryError;
use crate::simulation::{MeterSimulator, MeterSimulatorConfig};
use crate::transport::{queue_name, Publisher, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ProducerState {
    Init,
    Connecting,
    Streaming,
    Draining,
    Closed,
}

/// One meter streaming session; owns its simulator and publisher
pub struct MeterProducer {
    meter_id: String,
    queue: String,
    simulator: MeterSimulator,
    publisher: Option<Box<dyn Publisher>>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    state: ProducerState,
    published: u64,
}

impl MeterProducer {
    pub fn new(config: &MeterConfig, clock: Arc<dyn Clock>) -> Result<Self, TelemetryError> {
        let simulator =
            MeterSimulator::from_tag(&config.meter_type, MeterSimulatorConfig::from(config))?;
        info!(
            meter_id = %config.id,
            kind = %simulator.kind(),
            baseline_kw = config.baseline,
            min_kw = config.min_power,
            max_kw = config.max_power,
            "meter simulator ready"
        );

        Ok(Self {
            meter_id: config.id.clone(),
            queue: queue_name(&config.pv_id),
            simulator,
            publisher: None,
            interval: Duration::from_secs(config.meter_interval_sec.max(1)),
            clock,
            state: ProducerState::Init,
            published: 0,
        })
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub async fn connect(&mut self, transport: &Transport) -> Result<(), TelemetryError> {
        self.state = ProducerState::Connecting;
        let publisher = transport.publisher(&self.queue).await?;
        self.attach(publisher);
        Ok(())
    }

    /// Use an already-open publisher
    pub fn attach(&mut self, publisher: Box<dyn Publisher>) {
        info!(queue = %publisher.queue(), "meter connected");
        self.publisher = Some(publisher);
        self.state = ProducerState::Connecting;
    }

    /// Generate one reading and publish it
    pub async fn tick(&mut self) -> Result<TelemetryMessage, TelemetryError> {
        let publisher = self.publisher.as_mut().ok_or(TelemetryError::NotConnected)?;

        let power_kw = self.simulator.next_reading();
        let message = TelemetryMessage::new(
            self.meter_id.as_str(),
            self.clock.now(),
            power_kw,
            self.simulator.kind().message_type(),
        );
        publisher.publish(message.to_bytes()?).await?;
        self.published += 1;

        info!(
            meter_id = %message.meter_id,
            timestamp = %message.timestamp,
            power_kw,
            "reading published"
        );
        Ok(message)
    }

    /// Stream readings until `cancel` fires, then drain
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), TelemetryError> {
        if self.publisher.is_none() {
            return Err(TelemetryError::NotConnected);
        }
        self.state = ProducerState::Streaming;
        info!(queue = %self.queue, interval_secs = self.interval.as_secs(), "streaming meter readings");

        while !cancel.is_cancelled() {
            if let Err(e) = self.tick().await {
                warn!(error = %e, queue = %self.queue, "publish failed, reading dropped");
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop streaming and close the publisher. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.state == ProducerState::Closed {
            return;
        }
        self.state = ProducerState::Draining;
        info!(queue = %self.queue, published = self.published, "draining meter");

        if let Some(mut publisher) = self.publisher.take() {
            if let Err(e) = publisher.close().await {
                error!(error = %e, queue = %self.queue, "failed to close publisher");
            }
        }
        self.state = ProducerState::Closed;
        info!(queue = %self.queue, "meter closed");
    }
}

/// Build, connect and run a meter until `cancel` fires
pub async fn run_meter(
    config: &MeterConfig,
    transport: &Transport,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) -> Result<(), TelemetryError> {
    let mut producer = MeterProducer::new(config, clock)?;
    producer.connect(transport).await?;
    producer.run(cancel).await
}
