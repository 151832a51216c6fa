//! The loop turning gateway log lines into request and provider records.
//!
//! The loop sits idle until one of these happens:
//! * a raw line arrives: it takes a token, parses the line, fires the entry
//!   write and either skips the lookup (resolution disabled, cid fresh in the
//!   dedup cache) or dispatches it to a spawned task;
//! * a lookup completes: the envelope is drained, and the first non-empty
//!   resolution of a cid within the freshness window is geolocated and written;
//! * the sweep timer fires: expired cache entries are dropped.
//!
//! Tokens are permits held by whoever owns the entry at the time. Dropping the
//! permit is what releases the token, so every exit path releases exactly one.
//! The in-flight counter is incremented on dispatch and decremented when the
//! completion is drained, regardless of the outcome.
use std::sync::Arc;
use std::time;

use provider_common::health::HealthHandle;
use provider_common::model::LookupResult;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, InFlightCounter};
use crate::cache::DedupCache;
use crate::clients::{EntryParser, ProviderLocator, ProviderResolver};
use crate::correlator::{CorrelationEnvelope, RequestId};
use crate::error::{ResolutionError, WorkerError};
use crate::sinks::{PersistenceGateway, ResolutionRecord};
use crate::source::EventSource;

const HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the token pool.
    pub concurrency: usize,
    /// Dispatches between two backpressure checks. 0 disables the check.
    pub batch_size: usize,
    pub in_flight_wait_threshold: usize,
    pub pause_duration: time::Duration,
    pub freshness_window: time::Duration,
    pub sweep_interval: time::Duration,
    pub lookup_timeout: Option<time::Duration>,
    /// Persist entries only, never look providers up.
    pub skip_resolution: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 100,
            batch_size: 100,
            in_flight_wait_threshold: 50,
            pause_duration: time::Duration::from_secs(10),
            freshness_window: time::Duration::from_secs(24 * 3600),
            sweep_interval: time::Duration::from_secs(12 * 3600),
            lookup_timeout: Some(time::Duration::from_secs(300)),
            skip_resolution: false,
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    parser: Arc<dyn EntryParser>,
    resolver: Arc<dyn ProviderResolver>,
    locator: Arc<dyn ProviderLocator>,
    gateway: Arc<dyn PersistenceGateway>,
    cache: Arc<DedupCache>,
    admission: AdmissionController,
    in_flight: Arc<InFlightCounter>,
    liveness: Option<HealthHandle>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        parser: Arc<dyn EntryParser>,
        resolver: Arc<dyn ProviderResolver>,
        locator: Arc<dyn ProviderLocator>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        let admission = AdmissionController::new(
            config.concurrency,
            config.batch_size,
            config.in_flight_wait_threshold,
            config.pause_duration,
        );
        let in_flight = admission.in_flight();

        Self {
            cache: Arc::new(DedupCache::new(config.freshness_window)),
            config,
            parser,
            resolver,
            locator,
            gateway,
            admission,
            in_flight,
            liveness: None,
        }
    }

    /// Report liveness on `handle` while the loop is running.
    pub fn with_liveness(mut self, handle: HealthHandle) -> Self {
        self.liveness = Some(handle);
        self
    }

    pub fn cache(&self) -> Arc<DedupCache> {
        self.cache.clone()
    }

    pub fn in_flight(&self) -> Arc<InFlightCounter> {
        self.in_flight.clone()
    }

    /// Run until `source` is exhausted, then wait for outstanding lookups and
    /// writes. An unbounded source makes this run forever; dropping the
    /// future abandons whatever is still in flight.
    pub async fn run<S: EventSource>(mut self, mut source: S) -> Result<(), WorkerError> {
        let (completions_tx, mut completions) =
            mpsc::channel::<CorrelationEnvelope>(self.admission.capacity());
        let mut writes = JoinSet::new();

        let mut sweep = tokio::time::interval_at(
            Instant::now() + self.config.sweep_interval,
            self.config.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        let mut paused_until: Option<Instant> = None;
        let mut intake_open = true;

        info!(
            "pipeline ready, concurrency: {} batch: {}",
            self.admission.capacity(),
            self.config.batch_size
        );

        loop {
            if paused_until.is_none() {
                if let Some(pause) = self.admission.check_backpressure() {
                    warn!(
                        "{} lookups in flight, pausing intake for {:?}",
                        self.in_flight.get(),
                        pause
                    );
                    metrics::counter!("provider_intake_pauses_total").increment(1);
                    paused_until = Some(Instant::now() + pause);
                }
            }

            if !intake_open && self.in_flight.get() == 0 {
                break;
            }

            tokio::select! {
                raw = source.recv(), if intake_open && paused_until.is_none() => match raw {
                    Some(raw) => self.handle_entry(raw, &completions_tx, &mut writes).await?,
                    None => {
                        info!("event source exhausted, draining {} lookups", self.in_flight.get());
                        intake_open = false;
                    }
                },
                Some(envelope) = completions.recv() => self.drain(envelope, &mut writes),
                Some(joined) = writes.join_next(), if !writes.is_empty() => {
                    if let Err(error) = joined {
                        error!("write task failed: {}", error);
                    }
                },
                _ = tokio::time::sleep_until(paused_until.unwrap_or_else(Instant::now)), if paused_until.is_some() => {
                    debug!("resuming intake");
                    paused_until = None;
                },
                _ = sweep.tick() => self.sweep(),
                _ = heartbeat.tick(), if self.liveness.is_some() => {
                    if let Some(liveness) = &self.liveness {
                        liveness.report_healthy();
                    }
                },
            }
        }

        while let Some(joined) = writes.join_next().await {
            if let Err(error) = joined {
                error!("write task failed: {}", error);
            }
        }
        info!("pipeline stopped");

        Ok(())
    }

    /// Admit one raw line. Only blocks on the token pool and the parser.
    async fn handle_entry(
        &mut self,
        raw: String,
        completions: &mpsc::Sender<CorrelationEnvelope>,
        writes: &mut JoinSet<()>,
    ) -> Result<(), WorkerError> {
        metrics::counter!("provider_entries_received_total").increment(1);
        let permit = self.admission.acquire().await?;

        let entry = match self.parser.parse_entry(&raw).await {
            Ok(entry) => entry,
            Err(error) => {
                metrics::counter!("provider_entries_parse_failed_total").increment(1);
                warn!("failed to parse log entry: {}", error);
                return Ok(());
            }
        };
        let request_id = RequestId::from_entry(&entry);

        let gateway = self.gateway.clone();
        let written = entry.clone();
        let written_id = request_id.clone();
        writes.spawn(async move {
            if let Err(error) = gateway.write_entry(&written, &written_id).await {
                metrics::counter!("provider_persistence_failed_total", "kind" => "entry")
                    .increment(1);
                warn!("failed to write request {}: {}", written_id, error);
            }
        });

        if self.config.skip_resolution {
            return Ok(());
        }

        self.admission.record_dispatch();
        if self.cache.is_fresh(&entry.cid) {
            metrics::counter!("provider_lookups_skipped_total", "reason" => "fresh").increment(1);
            debug!("providers of {} found recently, skipping lookup", entry.cid);
            return Ok(());
        }

        let in_flight = self.in_flight.increment();
        metrics::counter!("provider_lookups_dispatched_total").increment(1);
        metrics::gauge!("provider_in_flight_lookups").set(in_flight as f64);

        let dispatch = CorrelationEnvelope::dispatch(&entry, request_id);
        let resolver = self.resolver.clone();
        let timeout = self.config.lookup_timeout;
        let completions = completions.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let result = resolve(resolver.as_ref(), &dispatch.cid, timeout).await;
            metrics::histogram!("provider_lookup_duration_seconds")
                .record(started.elapsed().as_secs_f64());
            drop(permit);

            if completions.send(dispatch.complete(result)).await.is_err() {
                debug!("pipeline stopped, discarding lookup result");
            }
        });

        Ok(())
    }

    /// Consume a completed lookup. Never blocks: geolocation and the write
    /// happen in a background task.
    fn drain(&self, envelope: CorrelationEnvelope, writes: &mut JoinSet<()>) {
        let in_flight = self.in_flight.decrement();
        metrics::gauge!("provider_in_flight_lookups").set(in_flight as f64);

        let lookup = match envelope.result {
            Ok(lookup) => lookup,
            Err(error) => {
                metrics::counter!("provider_lookups_failed_total").increment(1);
                warn!("failed to find providers: {}", error);
                return;
            }
        };
        debug!(
            "received {} providers for cid {} in {:?}",
            lookup.providers.len(),
            envelope.cid,
            lookup.elapsed
        );

        if lookup.providers.is_empty() {
            return;
        }
        if !self.cache.mark_if_stale(&envelope.cid) {
            metrics::counter!("provider_resolutions_skipped_total", "reason" => "duplicate")
                .increment(1);
            debug!("providers of {} already persisted recently", envelope.cid);
            return;
        }

        let LookupResult {
            providers, elapsed, ..
        } = lookup;
        let locator = self.locator.clone();
        let gateway = self.gateway.clone();
        let cid = envelope.cid;
        let requested_at = envelope.requested_at;
        let dispatched_at = envelope.dispatched_at;
        let completed_at = envelope.completed_at;

        writes.spawn(async move {
            let providers = match locator.locate(providers).await {
                Ok(providers) => providers,
                Err(error) => {
                    metrics::counter!("provider_enrichment_failed_total").increment(1);
                    warn!("failed to locate providers of {}: {}", cid, error);
                    return;
                }
            };

            let record = ResolutionRecord {
                cid,
                requested_at,
                dispatched_at,
                completed_at,
                lookup_duration: elapsed,
                providers,
            };
            match gateway.write_resolution(&record).await {
                Ok(()) => {
                    metrics::counter!("provider_resolutions_persisted_total").increment(1);
                }
                Err(error) => {
                    metrics::counter!("provider_persistence_failed_total", "kind" => "resolution")
                        .increment(1);
                    warn!("failed to write providers of {}: {}", record.cid, error);
                }
            }
        });
    }

    fn sweep(&self) {
        let removed = self.cache.sweep();
        let remaining = self.cache.len();
        metrics::gauge!("provider_dedup_cache_entries").set(remaining as f64);
        info!(
            "swept dedup cache, removed {} entries, {} remaining",
            removed, remaining
        );
    }
}

/// Look `cid` up, bounding the call by `timeout` whatever the resolver does with it.
async fn resolve(
    resolver: &dyn ProviderResolver,
    cid: &str,
    timeout: Option<time::Duration>,
) -> Result<LookupResult, ResolutionError> {
    let lookup = resolver.find_providers(cid, timeout);

    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, lookup)
            .await
            .unwrap_or_else(|_| {
                Err(ResolutionError::Timeout {
                    cid: cid.to_owned(),
                    timeout,
                })
            }),
        None => lookup.await,
    }
}
