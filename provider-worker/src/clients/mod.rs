//! The services the pipeline delegates to: log parsing, provider resolution
//! and provider geolocation. The log loader also parses find-providers logs. The pipeline only sees the traits; the HTTP
//! implementations talk to the parser and find-providers services.
use std::time;

use async_trait::async_trait;
use provider_common::model::{LogEntry, LookupResult, Provider, ProvidersLog};
use serde::Deserialize;

use crate::error::{EnrichmentError, ParseError, ResolutionError};

mod parser;
mod resolver;

pub use parser::HttpParser;
pub use resolver::HttpResolver;

#[async_trait]
pub trait EntryParser: Send + Sync {
    async fn parse_entry(&self, raw: &str) -> Result<LogEntry, ParseError>;
}

#[async_trait]
pub trait ProvidersLogParser: Send + Sync {
    async fn parse_providers_log(&self, raw: &str) -> Result<ProvidersLog, ParseError>;
}

/// Resolves which peers hold a cid. Must be callable concurrently.
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    async fn find_providers(
        &self,
        cid: &str,
        timeout: Option<time::Duration>,
    ) -> Result<LookupResult, ResolutionError>;
}

/// Attaches locations to providers.
#[async_trait]
pub trait ProviderLocator: Send + Sync {
    async fn locate(&self, providers: Vec<Provider>) -> Result<Vec<Provider>, EnrichmentError>;
}

/// Build the HTTP client shared by every service client.
///
/// `request_timeout` bounds every request. Provider lookups override it with
/// their own, longer, timeout.
pub fn build_http_client(request_timeout: time::Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("Provider Worker")
        .timeout(request_timeout)
        .build()
}

/// Error body returned by the services on non-2xx responses.
#[derive(Deserialize, Default)]
struct ServiceError {
    #[serde(default)]
    error: String,
}

impl ServiceError {
    fn from_body(body: &str) -> String {
        serde_json::from_str::<ServiceError>(body)
            .map(|e| e.error)
            .unwrap_or_else(|_| body.trim().to_owned())
    }
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}
