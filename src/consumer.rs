//! PV side of the pipeline: join each meter reading with the PV output at arrival time and
//! append the result to the session log.
//!
//! Deliveries are acknowledged only after their record has been flushed to disk. Payloads
//! that can never become a record (bad JSON, missing fields, negative power) are logged and
//! acknowledged so they do not come back. A failed write hands the delivery back to the
//! queue and the consumer pauses for [`REDELIVERY_BACKOFF`] before receiving again.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::PvConfig;
use crate::domain::{EnergyRecord, TelemetryMessage};
use crate::error::TelemetryError;
use crate::session_log::SessionLog;
use crate::simulation::{PvSimulator, PvSimulatorConfig, SolarSource};
use crate::transport::{queue_name, Delivery, Subscriber, Transport};

/// Pause after a delivery could not be persisted
pub const REDELIVERY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConsumerState {
    Init,
    Connecting,
    Listening,
    Draining,
    Closed,
}

/// What happened to a single delivery
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Appended to the log and acknowledged
    Recorded(EnergyRecord),
    /// Unusable payload, acknowledged without a record
    Rejected,
    /// Returned to the queue for another attempt
    Unsettled,
}

/// One PV consumer session; owns its solar model, subscriber and session log
pub struct PvConsumer {
    pv_id: String,
    queue: String,
    solar: Box<dyn SolarSource>,
    clock: Arc<dyn Clock>,
    log: SessionLog,
    subscriber: Option<Box<dyn Subscriber>>,
    state: ConsumerState,
}

impl PvConsumer {
    pub fn new(
        pv_id: &str,
        solar: Box<dyn SolarSource>,
        clock: Arc<dyn Clock>,
        log: SessionLog,
    ) -> Self {
        Self {
            pv_id: pv_id.to_string(),
            queue: queue_name(pv_id),
            solar,
            clock,
            log,
            subscriber: None,
            state: ConsumerState::Init,
        }
    }

    /// Build the PV simulator and create this session's log under `data_dir`
    pub fn from_config(
        config: &PvConfig,
        data_dir: &Path,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TelemetryError> {
        let path = SessionLog::session_path(data_dir, &config.id, Utc::now().timestamp());
        let log = SessionLog::create(path)?;
        let solar = PvSimulator::new(PvSimulatorConfig::from(config));
        info!(
            pv_id = %config.id,
            start = config.power_gen_start,
            stop = config.power_gen_stop,
            peak_hour = config.peak_hour,
            max_kw = config.max_power,
            "PV simulator ready"
        );
        Ok(Self::new(&config.id, Box::new(solar), clock, log))
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    pub async fn connect(&mut self, transport: &Transport) -> Result<(), TelemetryError> {
        self.state = ConsumerState::Connecting;
        let subscriber = transport.subscriber(&self.queue).await?;
        self.attach(subscriber);
        Ok(())
    }

    /// Use an already-bound subscriber
    pub fn attach(&mut self, subscriber: Box<dyn Subscriber>) {
        info!(pv_id = %self.pv_id, queue = %subscriber.queue(), "PV connected");
        self.subscriber = Some(subscriber);
        self.state = ConsumerState::Connecting;
    }

    /// Turn one payload into a persisted record
    pub fn process(&mut self, payload: &[u8]) -> Result<EnergyRecord, TelemetryError> {
        let message = TelemetryMessage::from_slice(payload)?;
        let received_at = self.clock.now();
        let pv_power_kw = self.solar.generate(received_at);
        let record = EnergyRecord::join(&message, pv_power_kw);
        self.log.append(&record)?;

        info!(
            pv_id = %self.pv_id,
            meter_id = %message.meter_id,
            meter_timestamp = %message.timestamp,
            received_at = %received_at,
            meter_kw = record.meter_power_kw,
            pv_kw = record.pv_power_kw,
            net_kw = record.net_power_kw,
            "record appended"
        );
        Ok(record)
    }

    /// Process a delivery and settle it according to the outcome
    pub async fn handle(&mut self, delivery: Delivery) -> DeliveryOutcome {
        match self.process(delivery.payload()) {
            Ok(record) => {
                if let Err(e) = delivery.ack().await {
                    warn!(error = %e, queue = %self.queue, "failed to acknowledge persisted record");
                }
                DeliveryOutcome::Recorded(record)
            }
            Err(TelemetryError::Message(e)) => {
                error!(
                    error = %e,
                    payload = %String::from_utf8_lossy(delivery.payload()),
                    "dropping malformed meter reading"
                );
                if let Err(e) = delivery.ack().await {
                    warn!(error = %e, queue = %self.queue, "failed to acknowledge rejected payload");
                }
                DeliveryOutcome::Rejected
            }
            Err(e) => {
                error!(
                    error = %e,
                    payload = %String::from_utf8_lossy(delivery.payload()),
                    "failed to persist meter reading"
                );
                if let Err(e) = delivery.nack().await {
                    warn!(error = %e, queue = %self.queue, "failed to return delivery to queue");
                }
                DeliveryOutcome::Unsettled
            }
        }
    }

    /// Consume deliveries until `cancel` fires or the subscription ends, then drain
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), TelemetryError> {
        if self.subscriber.is_none() {
            return Err(TelemetryError::NotConnected);
        }
        self.state = ConsumerState::Listening;
        info!(pv_id = %self.pv_id, queue = %self.queue, "waiting for meter readings");

        loop {
            let next = match self.subscriber.as_mut() {
                Some(subscriber) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = subscriber.next() => next,
                },
                None => break,
            };

            match next {
                Some(Ok(delivery)) => {
                    if self.handle(delivery).await == DeliveryOutcome::Unsettled {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(REDELIVERY_BACKOFF) => {}
                        }
                    }
                }
                Some(Err(e)) => warn!(error = %e, queue = %self.queue, "receive failed"),
                None => {
                    warn!(queue = %self.queue, "subscription ended");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop consuming, close the subscriber and the session log. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.state == ConsumerState::Closed {
            return;
        }
        self.state = ConsumerState::Draining;
        info!(pv_id = %self.pv_id, "draining PV consumer");

        if let Some(mut subscriber) = self.subscriber.take() {
            if let Err(e) = subscriber.close().await {
                error!(error = %e, queue = %self.queue, "failed to close subscriber");
            }
        }
        if let Err(e) = self.log.close() {
            error!(error = %e, path = %self.log.path().display(), "failed to close session log");
        }
        self.state = ConsumerState::Closed;
        info!(
            pv_id = %self.pv_id,
            records = self.log.records_written(),
            "PV consumer closed"
        );
    }
}

/// Build, connect and run a PV consumer until `cancel` fires
pub async fn run_pv(
    config: &PvConfig,
    data_dir: &Path,
    transport: &Transport,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) -> Result<(), TelemetryError> {
    let mut consumer = PvConsumer::from_config(config, data_dir, clock)?;
    consumer.connect(transport).await?;
    consumer.run(cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::{NaiveDate, NaiveDateTime};

    fn night() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(3, 0, 0)
            .unwrap()
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap()
    }

    fn reading_at(timestamp: NaiveDateTime) -> Vec<u8> {
        TelemetryMessage::new("m1", timestamp, 1.5, "residential_meter_reading")
            .to_bytes()
            .unwrap()
    }

    fn pv_config() -> PvConfig {
        PvConfig {
            id: "pv0".to_string(),
            power_gen_start: 6.0,
            power_gen_stop: 19.0,
            peak_hour: 12.5,
            max_power: 8.0,
            sigma: 3.5,
            weather_seed: Some(1),
        }
    }

    #[test]
    fn test_from_config_creates_session_log() {
        let dir = tempfile::tempdir().unwrap();
        let consumer =
            PvConsumer::from_config(&pv_config(), dir.path(), Arc::new(FixedClock(night()))).unwrap();
        assert_eq!(consumer.state(), ConsumerState::Init);
        assert_eq!(consumer.queue(), "home_power_data_pv0");
        assert!(consumer.log().path().starts_with(dir.path().join("PV0")));
        assert!(consumer.log().path().exists());
    }

    #[test]
    fn test_process_at_night_records_pure_import() {
        let dir = tempfile::tempdir().unwrap();
        let mut consumer =
            PvConsumer::from_config(&pv_config(), dir.path(), Arc::new(FixedClock(night()))).unwrap();
        let payload = br#"{"meter_id":"m1","timestamp":"2024-01-01T02:59:58","meter_power_kw":2.25,"type":"residential_meter_reading"}"#;

        let record = consumer.process(payload).unwrap();
        assert_eq!(record.pv_power_kw, 0.0);
        assert_eq!(record.net_power_kw, -2.25);
        assert_eq!(consumer.log().records_written(), 1);
    }

    #[test]
    fn test_process_rejects_garbage_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut consumer =
            PvConsumer::from_config(&pv_config(), dir.path(), Arc::new(FixedClock(night()))).unwrap();
        assert!(matches!(
            consumer.process(b"{not json"),
            Err(TelemetryError::Message(_))
        ));
        assert_eq!(consumer.log().records_written(), 0);
    }

    #[tokio::test]
    async fn test_run_without_connection_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut consumer =
            PvConsumer::from_config(&pv_config(), dir.path(), Arc::new(FixedClock(night()))).unwrap();
        assert!(matches!(
            consumer.run(CancellationToken::new()).await,
            Err(TelemetryError::NotConnected)
        ));
    }

    #[test]
    fn test_pv_output_follows_arrival_time_not_sample_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut consumer =
            PvConsumer::from_config(&pv_config(), dir.path(), Arc::new(FixedClock(noon()))).unwrap();

        let record = consumer.process(&reading_at(night())).unwrap();
        assert!(record.pv_power_kw >= 2.4, "pv {}", record.pv_power_kw);
        assert_eq!(record.timestamp, night());
        assert_eq!(
            record.net_power_kw,
            ((record.pv_power_kw - 1.5) * 100.0).round() / 100.0
        );
    }

    #[test]
    fn test_noon_sample_arriving_at_night_has_no_pv() {
        let dir = tempfile::tempdir().unwrap();
        let mut consumer =
            PvConsumer::from_config(&pv_config(), dir.path(), Arc::new(FixedClock(night()))).unwrap();

        let record = consumer.process(&reading_at(noon())).unwrap();
        assert_eq!(record.pv_power_kw, 0.0);
        assert_eq!(record.timestamp, noon());
        assert_eq!(record.net_power_kw, -1.5);
    }
}
