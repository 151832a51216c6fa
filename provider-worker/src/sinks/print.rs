use async_trait::async_trait;
use provider_common::model::LogEntry;
use tracing::info;

use super::{PersistenceGateway, ResolutionRecord};
use crate::correlator::RequestId;
use crate::error::PersistenceError;

/// Logs every record instead of storing it. Handy to run the worker without a database.
pub struct PrintGateway {}

#[async_trait]
impl PersistenceGateway for PrintGateway {
    async fn write_entry(
        &self,
        entry: &LogEntry,
        request_id: &RequestId,
    ) -> Result<(), PersistenceError> {
        info!(
            request_id = %request_id,
            cid = %entry.cid,
            cache = %entry.cache,
            "request: {:?}",
            entry
        );
        Ok(())
    }

    async fn write_resolution(&self, record: &ResolutionRecord) -> Result<(), PersistenceError> {
        let span = tracing::span!(tracing::Level::INFO, "resolution", cid = %record.cid);
        let _enter = span.enter();

        info!(
            lookup_duration = ?record.lookup_duration,
            "{} providers",
            record.providers.len()
        );
        for provider in &record.providers {
            info!("provider: {:?}", provider);
        }
        Ok(())
    }
}
