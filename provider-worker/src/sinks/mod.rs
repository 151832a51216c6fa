use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::WrapErr;
use provider_common::model::{LogEntry, Provider};

use crate::config::{Config, SinkKind};
use crate::correlator::RequestId;
use crate::error::PersistenceError;

mod influx;
mod postgres;
mod print;

pub use influx::InfluxGateway;
pub use postgres::PostgresGateway;
pub use print::PrintGateway;

/// A geolocated resolution ready to be written.
#[derive(Debug, Clone)]
pub struct ResolutionRecord {
    pub cid: String,
    pub requested_at: DateTime<Utc>,
    pub dispatched_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Time the resolution service spent looking up providers.
    pub lookup_duration: std::time::Duration,
    pub providers: Vec<Provider>,
}

/// Where entries and resolutions end up. One implementation per backend,
/// chosen at startup.
///
/// The pipeline fires writes and forgets them: an error is logged and counted
/// by the caller, and never retried.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn write_entry(
        &self,
        entry: &LogEntry,
        request_id: &RequestId,
    ) -> Result<(), PersistenceError>;

    async fn write_resolution(&self, record: &ResolutionRecord) -> Result<(), PersistenceError>;
}

/// Build the gateway selected by `SINK`. Postgres migrations run here.
pub async fn build_gateway(
    config: &Config,
    client: reqwest::Client,
) -> eyre::Result<Arc<dyn PersistenceGateway>> {
    let gateway: Arc<dyn PersistenceGateway> = match config.sink {
        SinkKind::Postgres => {
            let gateway = PostgresGateway::new(&config.database_url, config.max_pg_connections)
                .wrap_err("failed to create postgres pool")?;
            gateway
                .migrate()
                .await
                .wrap_err("failed to run database migrations")?;
            Arc::new(gateway)
        }
        SinkKind::Influx => Arc::new(
            InfluxGateway::new(client, &config.influx).wrap_err("invalid influx url")?,
        ),
        SinkKind::Print => Arc::new(PrintGateway {}),
    };

    Ok(gateway)
}

/// `None` for empty strings: the gateway leaves unset fields empty.
fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

/// Parse a numeric field, treating empty or malformed values as missing.
fn parse_number<T: std::str::FromStr>(s: &str) -> Option<T> {
    non_empty(s.trim()).and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(""), None);
        assert_eq!(non_empty("EU"), Some("EU"));
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number::<i32>("3243"), Some(3243));
        assert_eq!(parse_number::<i32>(""), None);
        assert_eq!(parse_number::<i32>("AS3243"), None);
        assert_eq!(parse_number::<f64>("38.7"), Some(38.7));
        assert_eq!(parse_number::<f64>(" 0.5 "), Some(0.5));
    }
}
