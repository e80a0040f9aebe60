//! End-to-end behaviour of the meter -> queue -> PV pipeline over the in-memory broker.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use home_pv_telemetry::clock::{Clock, FixedClock};
use home_pv_telemetry::config::{MeterConfig, PvConfig};
use home_pv_telemetry::consumer::{ConsumerState, DeliveryOutcome, PvConsumer};
use home_pv_telemetry::domain::{EnergyRecord, TelemetryMessage};
use home_pv_telemetry::producer::{MeterProducer, ProducerState};
use home_pv_telemetry::session_log::SessionLog;
use home_pv_telemetry::simulation::{PvSimulator, PvSimulatorConfig, SolarSource};
use home_pv_telemetry::transport::{
    queue_name, Delivery, MemoryBroker, Publisher, Subscriber, Transport, TransportError,
};
use tokio_util::sync::CancellationToken;

const QUEUE: &str = "home_power_data_pv0";

struct ConstantSolar(f64);

impl SolarSource for ConstantSolar {
    fn generate(&self, _at: NaiveDateTime) -> f64 {
        self.0
    }
}

fn noon() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(12, 30, 0)
        .unwrap()
}

fn fixed_clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock(noon()))
}

fn meter_config(interval_secs: u64) -> MeterConfig {
    MeterConfig {
        id: "meter0".to_string(),
        pv_id: "pv0".to_string(),
        meter_type: "RESIDENTIAL".to_string(),
        baseline: 1.2,
        min_power: 0.0,
        max_power: 10.0,
        meter_interval_sec: interval_secs,
        initial_variable_min: 0.5,
        initial_variable_max: 3.0,
        random_seed: Some(2024),
    }
}

fn pv_config() -> PvConfig {
    PvConfig {
        id: "pv0".to_string(),
        power_gen_start: 6.0,
        power_gen_stop: 19.0,
        peak_hour: 12.5,
        max_power: 8.0,
        sigma: 3.5,
        weather_seed: Some(2024),
    }
}

fn consumer_with(solar: Box<dyn SolarSource>, dir: &Path) -> PvConsumer {
    let log = SessionLog::create(dir.join("energy_data_0.csv")).unwrap();
    PvConsumer::new("pv0", solar, fixed_clock(), log)
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn data_rows(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}

fn spawn_consumer(
    mut consumer: PvConsumer,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<PvConsumer> {
    tokio::spawn(async move {
        consumer.run(cancel).await.unwrap();
        consumer
    })
}

#[tokio::test]
async fn test_reading_joined_with_pv_output() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let mut consumer = consumer_with(Box::new(ConstantSolar(5.0)), dir.path());
    consumer.connect(&Transport::Memory(broker.clone())).await.unwrap();
    let log_path = consumer.log().path().to_path_buf();

    let mut publisher = broker.publisher(QUEUE);
    publisher
        .publish(
            br#"{"meter_id":"m1","timestamp":"2024-01-01T12:30:00","meter_power_kw":3.5,"type":"residential_meter_reading"}"#
                .to_vec(),
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let handle = spawn_consumer(consumer, cancel.clone());
    wait_until(|| data_rows(&log_path).len() == 1).await;
    cancel.cancel();
    let consumer = handle.await.unwrap();

    assert_eq!(data_rows(&log_path), vec!["2024-01-01T12:30:00,3.5,5.0,1.5"]);
    assert_eq!(consumer.state(), ConsumerState::Closed);
    assert_eq!(broker.ready_count(QUEUE), 0);
    assert_eq!(broker.in_flight_count(QUEUE), 0);
}

#[tokio::test]
async fn test_malformed_message_is_dropped_and_listening_continues() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let mut consumer = consumer_with(Box::new(ConstantSolar(5.0)), dir.path());
    consumer.connect(&Transport::Memory(broker.clone())).await.unwrap();
    let log_path = consumer.log().path().to_path_buf();

    let mut publisher = broker.publisher(QUEUE);
    publisher
        .publish(br#"{"meter_id":"m1","timestamp":"2024-01-01T12:30:00","type":"residential_meter_reading"}"#.to_vec())
        .await
        .unwrap();
    publisher
        .publish(br#"{"meter_id":"m1","timestamp":"2024-01-01T12:30:02","meter_power_kw":2.0,"type":"residential_meter_reading"}"#.to_vec())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let handle = spawn_consumer(consumer, cancel.clone());
    wait_until(|| data_rows(&log_path).len() == 1).await;
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(data_rows(&log_path), vec!["2024-01-01T12:30:02,2.0,5.0,3.0"]);
    assert_eq!(broker.in_flight_count(QUEUE), 0);
    assert_eq!(broker.ready_count(QUEUE), 0);
}

#[tokio::test]
async fn test_malformed_delivery_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let mut consumer = consumer_with(Box::new(ConstantSolar(5.0)), dir.path());

    broker.publisher(QUEUE).publish(b"not json".to_vec()).await.unwrap();
    let mut subscriber = broker.subscriber(QUEUE);
    let delivery = subscriber.next().await.unwrap().unwrap();

    assert_eq!(consumer.handle(delivery).await, DeliveryOutcome::Rejected);
    assert_eq!(consumer.log().records_written(), 0);
    assert_eq!(broker.in_flight_count(QUEUE), 0);
}

#[tokio::test]
async fn test_failed_write_returns_delivery_to_queue() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let mut log = SessionLog::create(dir.path().join("closed.csv")).unwrap();
    log.close().unwrap();
    let mut consumer = PvConsumer::new("pv0", Box::new(ConstantSolar(1.0)), fixed_clock(), log);
    consumer.connect(&Transport::Memory(broker.clone())).await.unwrap();

    let message = TelemetryMessage::new("m1", noon(), 2.5, "residential_meter_reading");
    broker
        .publisher(QUEUE)
        .publish(message.to_bytes().unwrap())
        .await
        .unwrap();

    let mut subscriber = broker.subscriber(QUEUE);
    let delivery = subscriber.next().await.unwrap().unwrap();
    assert_eq!(consumer.handle(delivery).await, DeliveryOutcome::Unsettled);
    assert_eq!(broker.in_flight_count(QUEUE), 0);
    assert_eq!(broker.ready_count(QUEUE), 1);

    let retried = subscriber.next().await.unwrap().unwrap();
    assert_eq!(TelemetryMessage::from_slice(retried.payload()).unwrap(), message);
    subscriber.close().await.unwrap();
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_consumer_keeps_retrying_unwritable_reading() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let mut log = SessionLog::create(dir.path().join("closed.csv")).unwrap();
    log.close().unwrap();
    let mut consumer = PvConsumer::new("pv0", Box::new(ConstantSolar(1.0)), fixed_clock(), log);
    consumer.connect(&Transport::Memory(broker.clone())).await.unwrap();

    let message = TelemetryMessage::new("m1", noon(), 2.5, "residential_meter_reading");
    broker
        .publisher(QUEUE)
        .publish(message.to_bytes().unwrap())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let handle = spawn_consumer(consumer, cancel.clone());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    cancel.cancel();
    let consumer = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("consumer did not drain promptly")
        .unwrap();

    assert_eq!(consumer.state(), ConsumerState::Closed);
    assert_eq!(consumer.log().records_written(), 0);
    assert_eq!(broker.in_flight_count(QUEUE), 0);
    assert_eq!(broker.ready_count(QUEUE), 1);
}

#[tokio::test]
async fn test_producer_interrupted_while_sleeping() {
    let broker = MemoryBroker::new();
    let mut producer = MeterProducer::new(&meter_config(3600), fixed_clock()).unwrap();
    producer.connect(&Transport::Memory(broker.clone())).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = producer.run(cancel).await;
            (producer, result)
        })
    };

    wait_until(|| broker.ready_count(QUEUE) == 1).await;
    cancel.cancel();
    let (producer, result) = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("producer did not drain promptly")
        .unwrap();

    assert!(result.is_ok());
    assert_eq!(producer.state(), ProducerState::Closed);
    assert_eq!(producer.published(), 1);
    assert_eq!(broker.ready_count(QUEUE), 1);
}

#[tokio::test]
async fn test_producer_cancelled_before_start_publishes_nothing() {
    let broker = MemoryBroker::new();
    let mut producer = MeterProducer::new(&meter_config(1), fixed_clock()).unwrap();
    producer.connect(&Transport::Memory(broker.clone())).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    producer.run(cancel).await.unwrap();

    assert_eq!(producer.state(), ProducerState::Closed);
    assert_eq!(broker.ready_count(QUEUE), 0);
}

struct CountingPublisher {
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Publisher for CountingPublisher {
    fn queue(&self) -> &str {
        QUEUE
    }

    async fn publish(&mut self, _payload: Vec<u8>) -> Result<(), TransportError> {
        Err(TransportError::Publish {
            queue: QUEUE.to_string(),
            reason: "broker unavailable".to_string(),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct CountingSubscriber {
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Subscriber for CountingSubscriber {
    fn queue(&self) -> &str {
        QUEUE
    }

    async fn next(&mut self) -> Option<Result<Delivery, TransportError>> {
        std::future::pending().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Close {
            queue: QUEUE.to_string(),
            reason: "already gone".to_string(),
        })
    }
}

#[tokio::test]
async fn test_producer_shutdown_closes_once() {
    let closes = Arc::new(AtomicUsize::new(0));
    let mut producer = MeterProducer::new(&meter_config(1), fixed_clock()).unwrap();
    producer.attach(Box::new(CountingPublisher {
        closes: closes.clone(),
    }));

    producer.shutdown().await;
    producer.shutdown().await;

    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(producer.state(), ProducerState::Closed);
}

#[tokio::test]
async fn test_publish_failure_does_not_stop_streaming() {
    let closes = Arc::new(AtomicUsize::new(0));
    let mut producer = MeterProducer::new(&meter_config(1), fixed_clock()).unwrap();
    producer.attach(Box::new(CountingPublisher {
        closes: closes.clone(),
    }));

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = producer.run(cancel).await;
            (producer, result)
        })
    };
    tokio::time::sleep(Duration::from_millis(1500)).await;
    cancel.cancel();
    let (producer, result) = handle.await.unwrap();

    assert!(result.is_ok());
    assert_eq!(producer.published(), 0);
    assert_eq!(producer.state(), ProducerState::Closed);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_consumer_shutdown_closes_once_despite_errors() {
    let dir = tempfile::tempdir().unwrap();
    let closes = Arc::new(AtomicUsize::new(0));
    let mut consumer = consumer_with(Box::new(ConstantSolar(0.0)), dir.path());
    consumer.attach(Box::new(CountingSubscriber {
        closes: closes.clone(),
    }));

    let cancel = CancellationToken::new();
    let handle = spawn_consumer(consumer, cancel.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let mut consumer = handle.await.unwrap();
    consumer.shutdown().await;

    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(consumer.state(), ConsumerState::Closed);
    assert!(consumer.log().is_closed());
}

#[tokio::test]
async fn test_meter_to_pv_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let transport = Transport::Memory(broker.clone());
    assert_eq!(queue_name("pv0"), QUEUE);

    let pv = PvSimulator::new(PvSimulatorConfig::from(&pv_config()));
    let mut consumer = consumer_with(Box::new(pv), dir.path());
    consumer.connect(&transport).await.unwrap();
    let log_path = consumer.log().path().to_path_buf();

    let mut producer = MeterProducer::new(&meter_config(1), fixed_clock()).unwrap();
    producer.connect(&transport).await.unwrap();

    let cancel = CancellationToken::new();
    let consumer_handle = spawn_consumer(consumer, cancel.clone());
    let producer_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { producer.run(cancel).await })
    };

    wait_until(|| data_rows(&log_path).len() >= 2).await;
    cancel.cancel();
    producer_handle.await.unwrap().unwrap();
    let consumer = consumer_handle.await.unwrap();

    let mut reader = csv::Reader::from_path(&log_path).unwrap();
    let records: Vec<EnergyRecord> = reader.deserialize().map(|r| r.unwrap()).collect();
    assert_eq!(records.len() as u64, consumer.log().records_written());
    for record in &records {
        assert_eq!(record.timestamp, noon());
        assert!((0.0..=10.0).contains(&record.meter_power_kw));
        assert!((2.4..=9.6).contains(&record.pv_power_kw));
        let expected = ((record.pv_power_kw - record.meter_power_kw) * 100.0).round() / 100.0;
        assert_eq!(record.net_power_kw, expected);
    }
    for pair in records.windows(2) {
        assert!((pair[1].meter_power_kw - pair[0].meter_power_kw).abs() <= 0.5 + 1e-9);
    }
}
