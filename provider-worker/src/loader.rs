//! Load the lookups the find-providers service logged on its own.
//!
//! These bypass the dedup cache and the token pool: every logged lookup is
//! already complete, so each line is parsed and written as it arrives.
use std::sync::Arc;
use std::time;

use chrono::{DateTime, Utc};
use provider_common::health::HealthHandle;
use provider_common::model::ProvidersLog;
use tracing::{debug, info, warn};

use crate::clients::ProvidersLogParser;
use crate::sinks::{PersistenceGateway, ResolutionRecord};
use crate::source::EventSource;

const HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_secs(10);

pub struct LogLoader {
    parser: Arc<dyn ProvidersLogParser>,
    gateway: Arc<dyn PersistenceGateway>,
    liveness: Option<HealthHandle>,
}

impl LogLoader {
    pub fn new(parser: Arc<dyn ProvidersLogParser>, gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self {
            parser,
            gateway,
            liveness: None,
        }
    }

    pub fn with_liveness(mut self, handle: HealthHandle) -> Self {
        self.liveness = Some(handle);
        self
    }

    /// Load every line `source` yields, returning once it is exhausted.
    pub async fn run<S: EventSource>(&self, mut source: S) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                raw = source.recv() => match raw {
                    Some(raw) => self.load(&raw).await,
                    None => break,
                },
                _ = heartbeat.tick(), if self.liveness.is_some() => {
                    if let Some(liveness) = &self.liveness {
                        liveness.report_healthy();
                    }
                },
            }
        }
        info!("providers log source exhausted");
    }

    /// Parse and write one logged lookup. Failures are logged and counted.
    pub async fn load(&self, raw: &str) {
        let log = match self.parser.parse_providers_log(raw).await {
            Ok(log) => log,
            Err(error) => {
                metrics::counter!("provider_logs_failed_total", "stage" => "parse").increment(1);
                warn!("failed to parse providers log: {}", error);
                return;
            }
        };

        let record = record_from_log(log, Utc::now());
        debug!(
            "loading {} providers of cid {}",
            record.providers.len(),
            record.cid
        );

        match self.gateway.write_resolution(&record).await {
            Ok(()) => metrics::counter!("provider_logs_loaded_total").increment(1),
            Err(error) => {
                metrics::counter!("provider_logs_failed_total", "stage" => "write").increment(1);
                warn!("failed to write logged providers of {}: {}", record.cid, error);
            }
        }
    }
}

/// The lookup is dated by its log line when that carries a usable time, and
/// by `received_at` otherwise.
fn record_from_log(log: ProvidersLog, received_at: DateTime<Utc>) -> ResolutionRecord {
    let logged_at = log.logged_at().unwrap_or_else(|| {
        debug!("unusable time {:?} in providers log", log.time);
        received_at
    });

    ResolutionRecord {
        cid: log.cid,
        requested_at: logged_at,
        dispatched_at: logged_at,
        completed_at: received_at,
        lookup_duration: time::Duration::from_nanos(log.duration),
        providers: log.providers,
    }
}
