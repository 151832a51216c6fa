use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;

use crate::pipeline::PipelineConfig;

/// Durations above this are almost certainly a unit mistake.
const MAX_DURATION: time::Duration = time::Duration::from_secs(365 * 24 * 3600);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("CONCURRENCY must be at least 1")]
    ZeroConcurrency,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("{0} of {1:?} exceeds one year")]
    DurationOutOfRange(&'static str, time::Duration),
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "100")]
    pub concurrency: usize,

    #[envconfig(default = "100")]
    pub batch_size: usize,

    #[envconfig(default = "50")]
    pub in_flight_wait_threshold: usize,

    #[envconfig(default = "10000")]
    pub pause_duration: EnvMsDuration,

    #[envconfig(default = "86400000")]
    pub freshness_window: EnvMsDuration,

    #[envconfig(default = "43200000")]
    pub sweep_interval: EnvMsDuration,

    #[envconfig(default = "300000")]
    pub lookup_timeout: EnvMsDuration,

    /// Bounds every call to the parser service and the influx API.
    #[envconfig(default = "30000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "false")]
    pub skip_resolution: bool,

    #[envconfig(default = "http://parser:9000")]
    pub parser_url: String,

    #[envconfig(default = "http://find_providers:10000")]
    pub providers_url: String,

    #[envconfig(default = "postgres")]
    pub sink: SinkKind,

    #[envconfig(default = "postgres://postgres:postgres@db:5432/ipfs_content_location")]
    pub database_url: String,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(nested = true)]
    pub influx: InfluxConfig,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject values the pipeline cannot run with, so they fail at startup
    /// rather than inside the loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }

        for (name, duration) in [
            ("FRESHNESS_WINDOW", self.freshness_window),
            ("SWEEP_INTERVAL", self.sweep_interval),
            ("LOOKUP_TIMEOUT", self.lookup_timeout),
            ("REQUEST_TIMEOUT", self.request_timeout),
        ] {
            if duration.0.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        for (name, duration) in [
            ("PAUSE_DURATION", self.pause_duration),
            ("FRESHNESS_WINDOW", self.freshness_window),
            ("SWEEP_INTERVAL", self.sweep_interval),
            ("LOOKUP_TIMEOUT", self.lookup_timeout),
            ("REQUEST_TIMEOUT", self.request_timeout),
        ] {
            if duration.0 > MAX_DURATION {
                return Err(ConfigError::DurationOutOfRange(name, duration.0));
            }
        }

        Ok(())
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            concurrency: self.concurrency,
            batch_size: self.batch_size,
            in_flight_wait_threshold: self.in_flight_wait_threshold,
            pause_duration: self.pause_duration.0,
            freshness_window: self.freshness_window.0,
            sweep_interval: self.sweep_interval.0,
            lookup_timeout: Some(self.lookup_timeout.0),
            skip_resolution: self.skip_resolution,
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct InfluxConfig {
    #[envconfig(default = "http://db:8086")]
    pub influx_url: String,

    #[envconfig(default = "my-org")]
    pub influx_org: String,

    #[envconfig(default = "my-bucket")]
    pub influx_bucket: String,

    #[envconfig(default = "")]
    pub influx_token: String,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "kafka:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "ipfs-gateway-logs")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "ipfs-gateway-logs")]
    pub kafka_consumer_topic: String,

    // earliest, latest
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    // Lookups can stall the loop for minutes, keep the consumer in the group meanwhile.
    #[envconfig(default = "3600000")]
    pub kafka_max_poll_interval_ms: u32,
}

/// Which persistence backend the worker writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Postgres,
    Influx,
    Print,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseSinkKindError(String);

impl std::fmt::Display for ParseSinkKindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} is not a valid sink", self.0)
    }
}

impl FromStr for SinkKind {
    type Err = ParseSinkKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(SinkKind::Postgres),
            "influx" | "influxdb" => Ok(SinkKind::Influx),
            "print" => Ok(SinkKind::Print),
            invalid => Err(ParseSinkKindError(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "duration must be a number of milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
