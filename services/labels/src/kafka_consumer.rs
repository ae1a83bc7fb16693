use crate::config::KafkaConfig;
use crate::ingestion::{IngestionError, IngestionHandler};
use crate::notification::UploadNotification;
use crate::redelivery::{now_ms, RedeliveryPolicy, RedeliveryStamp};
use anyhow::{Context, Result};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Offset;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Consumes upload notifications from Kafka and feeds them to the ingestion handler.
///
/// Events that end up retry-pending are republished to the retry topic before
/// the offset is committed, so redelivery never depends on a loop in this process.
/// Republished messages carry a [`RedeliveryStamp`]; they are held until due and
/// given up once the policy's attempts are used.
///
/// A message whose handling fails (republish failed) is not committed and its
/// partition does not advance: later offsets are skipped and the consumer seeks
/// back to the failed one after the base backoff.
pub struct UploadKafkaConsumer {
    consumer: StreamConsumer,
    producer: FutureProducer,
    handler: Arc<IngestionHandler>,
    retry_topic: String,
    producer_timeout: Duration,
    policy: RedeliveryPolicy,
}

/// Per-partition offsets that have to be handled again before the partition moves on
#[derive(Debug, Default)]
struct PartitionGate {
    blocked: HashMap<(String, i32), i64>,
}

impl PartitionGate {
    /// Whether a message may be handled. Offsets past a failed one are held back.
    fn admit(&self, topic: &str, partition: i32, offset: i64) -> bool {
        self.blocked
            .get(&(topic.to_string(), partition))
            .map_or(true, |blocked| offset <= *blocked)
    }

    fn block(&mut self, topic: &str, partition: i32, offset: i64) {
        self.blocked.insert((topic.to_string(), partition), offset);
    }

    /// Unblock once the failed offset itself went through
    fn release(&mut self, topic: &str, partition: i32, offset: i64) {
        let key = (topic.to_string(), partition);
        if self.blocked.get(&key).is_some_and(|blocked| offset >= *blocked) {
            self.blocked.remove(&key);
        }
    }
}

fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.bootstrap_servers);

    // Configure SSL if enabled
    if config.ssl_enabled {
        client_config.set("security.protocol", "SASL_SSL");
        if let Some(ref ca_location) = config.ssl_ca_location {
            client_config.set("ssl.ca.location", ca_location);
        }
    }

    // Configure SASL if credentials provided
    if let (Some(ref username), Some(ref password)) =
        (&config.sasl_username, &config.sasl_password)
    {
        client_config
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    client_config
}

impl UploadKafkaConsumer {
    /// Create a new Kafka consumer for upload notifications
    pub fn new(
        config: &KafkaConfig,
        retry_topic: &str,
        producer_timeout: Duration,
        handler: Arc<IngestionHandler>,
    ) -> Result<Self> {
        let consumer: StreamConsumer = client_config(config)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string())
            .create()
            .context("Failed to create Kafka consumer")?;

        let producer: FutureProducer = client_config(config)
            .set("message.timeout.ms", producer_timeout.as_millis().to_string())
            .create()
            .context("Failed to create Kafka producer")?;

        consumer
            .subscribe(&[&config.upload_topic])
            .context("Failed to subscribe to upload topic")?;

        info!(
            topic = %config.upload_topic,
            retry_topic = %retry_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            producer,
            handler,
            retry_topic: retry_topic.to_string(),
            producer_timeout,
            policy: RedeliveryPolicy::from_config(config),
        })
    }

    /// Start consuming and processing messages
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<()> {
        info!("Starting upload notification consumer");

        let mut message_stream = self.consumer.stream();
        let mut gate = PartitionGate::default();

        while let Some(message_result) = message_stream.next().await {
            match message_result {
                Ok(message) => {
                    let topic = message.topic();
                    let partition = message.partition();
                    let offset = message.offset();

                    if !gate.admit(topic, partition, offset) {
                        debug!(partition, offset, "Skipping message behind a failed offset");
                        continue;
                    }

                    match self.process_message(&message).await {
                        Ok(()) => {
                            gate.release(topic, partition, offset);
                            if let Err(e) =
                                self.consumer.commit_message(&message, CommitMode::Async)
                            {
                                warn!(error = %e, "Failed to commit offset");
                            }
                            metrics::counter!("labels.messages.processed").increment(1);
                        }
                        Err(e) => {
                            error!(
                                error = %e,
                                partition,
                                offset,
                                "Failed to process message, rewinding partition"
                            );
                            metrics::counter!("labels.messages.failed").increment(1);

                            gate.block(topic, partition, offset);
                            tokio::time::sleep(self.policy.backoff()).await;
                            self.consumer
                                .seek(topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
                                .context("Failed to rewind partition to the failed offset")?;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("labels.kafka.errors").increment(1);
                }
            }
        }

        Ok(())
    }

    /// Process a single Kafka message
    #[instrument(skip(self, message), fields(partition = message.partition(), offset = message.offset()))]
    async fn process_message(&self, message: &BorrowedMessage<'_>) -> Result<()> {
        let Some(payload) = message.payload() else {
            warn!("Dropping message without payload");
            metrics::counter!("labels.messages.malformed").increment(1);
            return Ok(());
        };

        let notification: UploadNotification = match serde_json::from_slice(payload) {
            Ok(notification) => notification,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable upload notification");
                metrics::counter!("labels.messages.malformed").increment(1);
                return Ok(());
            }
        };

        let stamp = message
            .headers()
            .and_then(|headers| RedeliveryStamp::from_headers(headers));

        debug!(
            events = notification.len(),
            attempt = stamp.map_or(0, |s| s.attempt),
            "Received upload notification"
        );

        if let Some(stamp) = &stamp {
            let wait = self.policy.wait(stamp, now_ms());
            if !wait.is_zero() {
                debug!(wait_ms = wait.as_millis() as u64, "Holding redelivered events until due");
                tokio::time::sleep(wait).await;
            }
        }

        let report = match self.handler.handle_batch(&notification).await {
            Ok(report) => report,
            Err(e @ IngestionError::BatchFailed(_)) => {
                error!(error = %e, "Upload notification batch failed");
                e.report().clone()
            }
        };

        if let Some(redelivery) = report.redelivery(&notification) {
            match self.policy.next(stamp.as_ref(), now_ms()) {
                Some(next) => self.republish(&redelivery, &next).await?,
                None => {
                    error!(
                        events = redelivery.len(),
                        attempts = stamp.map_or(0, |s| s.attempt),
                        "Redelivery attempts exhausted, dropping events"
                    );
                    metrics::counter!("labels.events.retry_exhausted")
                        .increment(redelivery.len() as u64);
                }
            }
        }

        Ok(())
    }

    /// Send retry-pending records back through the trigger topic
    #[instrument(skip(self, notification), fields(events = notification.len(), attempt = stamp.attempt))]
    async fn republish(
        &self,
        notification: &UploadNotification,
        stamp: &RedeliveryStamp,
    ) -> Result<()> {
        let payload =
            serde_json::to_vec(notification).context("Failed to serialize redelivery batch")?;

        let record = FutureRecord::<(), [u8]>::to(&self.retry_topic)
            .payload(payload.as_slice())
            .headers(stamp.to_headers());

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.producer_timeout))
            .await
            .map_err(|(e, _)| e)
            .context("Failed to republish retry-pending events")?;

        info!(
            topic = %self.retry_topic,
            partition,
            offset,
            "Republished retry-pending events"
        );
        metrics::counter!("labels.events.redelivered").increment(notification.len() as u64);

        Ok(())
    }
}
