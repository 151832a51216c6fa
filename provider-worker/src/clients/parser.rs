use async_trait::async_trait;
use provider_common::model::{LogEntry, Provider, ProvidersLog};
use reqwest::header;
use serde::de::DeserializeOwned;

use super::{endpoint, EntryParser, ProviderLocator, ProvidersLogParser, ServiceError};
use crate::error::{EnrichmentError, ParseError};

/// Client for the parser service, which both structures raw log lines and
/// geolocates provider addresses.
#[derive(Clone)]
pub struct HttpParser {
    client: reqwest::Client,
    parse_url: String,
    parse_providers_log_url: String,
    locate_url: String,
}

impl HttpParser {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            parse_url: endpoint(base_url, "parse"),
            parse_providers_log_url: endpoint(base_url, "parse/findProvidersLog"),
            locate_url: endpoint(base_url, "locate_providers"),
        }
    }

    /// Post `raw` as text to `url` and decode the structured answer.
    async fn parse<T: DeserializeOwned>(&self, url: &str, raw: &str) -> Result<T, ParseError> {
        let response = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(raw.to_owned())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ParseError::Rejected {
                status,
                message: ServiceError::from_body(&body),
                raw: raw.to_owned(),
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl EntryParser for HttpParser {
    async fn parse_entry(&self, raw: &str) -> Result<LogEntry, ParseError> {
        self.parse(&self.parse_url, raw).await
    }
}

#[async_trait]
impl ProvidersLogParser for HttpParser {
    async fn parse_providers_log(&self, raw: &str) -> Result<ProvidersLog, ParseError> {
        self.parse(&self.parse_providers_log_url, raw).await
    }
}

#[async_trait]
impl ProviderLocator for HttpParser {
    async fn locate(&self, providers: Vec<Provider>) -> Result<Vec<Provider>, EnrichmentError> {
        let response = self
            .client
            .post(&self.locate_url)
            .json(&providers)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EnrichmentError::Service(status));
        }

        Ok(response.json::<Vec<Provider>>().await?)
    }
}
