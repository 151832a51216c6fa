use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Message};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;

/// Yields raw log lines, one per call.
///
/// `recv` is raced against timers and completions, so implementations must
/// be cancel safe: dropping the future must not lose a line.
#[async_trait]
pub trait EventSource: Send {
    /// `None` once the source is exhausted. Unbounded sources never return it.
    async fn recv(&mut self) -> Option<String>;
}

/// Consumes gateway log lines from a single Kafka topic.
pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set(
                "max.poll.interval.ms",
                config.kafka_max_poll_interval_ms.to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.kafka_consumer_topic.as_str()])?;

        Ok(Self { consumer })
    }
}

#[async_trait]
impl EventSource for KafkaSource {
    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.consumer.recv().await {
                Ok(message) => match message.payload_view::<str>() {
                    Some(Ok(payload)) => return Some(payload.to_owned()),
                    Some(Err(error)) => {
                        warn!("skipping non utf-8 payload: {}", error);
                    }
                    None => {
                        warn!("skipping empty payload");
                    }
                },
                Err(error) => {
                    metrics::counter!("provider_source_errors_total").increment(1);
                    warn!("failed to consume from kafka: {}", error);
                }
            }
        }
    }
}

/// Lines pushed through an in-process channel, e.g. replayed from a file.
pub struct ChannelSource {
    receiver: mpsc::Receiver<String>,
}

impl ChannelSource {
    pub fn new(receiver: mpsc::Receiver<String>) -> Self {
        Self { receiver }
    }

    /// A source over a fixed set of lines, exhausted once they are consumed.
    pub fn from_lines<I>(lines: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let lines: Vec<String> = lines.into_iter().collect();
        let (sender, receiver) = mpsc::channel(lines.len().max(1));
        for line in lines {
            // Capacity matches the number of lines and the receiver is alive.
            drop(sender.try_send(line));
        }
        Self { receiver }
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}
