use std::time;

use async_trait::async_trait;
use provider_common::model::{LookupResult, ProvidersAnswer};

use super::{endpoint, ProviderResolver, ServiceError};
use crate::error::ResolutionError;

/// Client for the find-providers service, which walks the DHT on our behalf.
#[derive(Clone)]
pub struct HttpResolver {
    client: reqwest::Client,
    lookup_url: String,
}

impl HttpResolver {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            lookup_url: endpoint(base_url, "findAllProviders"),
        }
    }
}

#[async_trait]
impl ProviderResolver for HttpResolver {
    async fn find_providers(
        &self,
        cid: &str,
        timeout: Option<time::Duration>,
    ) -> Result<LookupResult, ResolutionError> {
        let mut url = reqwest::Url::parse(&self.lookup_url)?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .push(cid);

        let mut request = self.client.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|error| match timeout {
            Some(timeout) if error.is_timeout() => ResolutionError::Timeout {
                cid: cid.to_owned(),
                timeout,
            },
            _ => ResolutionError::Request(error),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ResolutionError::Service {
                cid: cid.to_owned(),
                status,
                message: ServiceError::from_body(&body),
            });
        }

        let answer = response.json::<ProvidersAnswer>().await?;
        Ok(answer.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};

    #[tokio::test]
    async fn test_find_providers() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/findAllProviders/QmFound");
            then.status(200).json_body(serde_json::json!({
                "cid": "QmFound",
                "providers": [
                    {"peerId": "12D3KooWA", "maddrs": ["/ip4/203.0.113.1/tcp/4001"]},
                    {"peerId": "12D3KooWB", "maddrs": []}
                ],
                "duration": 2_000_000_000u64
            }));
        });

        let resolver = HttpResolver::new(reqwest::Client::new(), &server.base_url());
        let result = resolver
            .find_providers("QmFound", None)
            .await
            .expect("failed to find providers");

        mock.assert();
        assert_eq!(result.cid, "QmFound");
        assert_eq!(result.providers.len(), 2);
        assert_eq!(result.providers[0].peer_id, "12D3KooWA");
        assert_eq!(result.elapsed, time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_find_providers_service_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/findAllProviders/QmBroken");
            then.status(400)
                .json_body(serde_json::json!({"error": "invalid cid"}));
        });

        let resolver = HttpResolver::new(reqwest::Client::new(), &server.base_url());
        let error = resolver
            .find_providers("QmBroken", None)
            .await
            .unwrap_err();

        match error {
            ResolutionError::Service {
                cid,
                status,
                message,
            } => {
                assert_eq!(cid, "QmBroken");
                assert_eq!(status, http::StatusCode::BAD_REQUEST);
                assert_eq!(message, "invalid cid");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_find_providers_timeout() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/findAllProviders/QmSlow");
            then.status(200)
                .delay(time::Duration::from_secs(2))
                .json_body(serde_json::json!({"cid": "QmSlow", "providers": []}));
        });

        let resolver = HttpResolver::new(reqwest::Client::new(), &server.base_url());
        let error = resolver
            .find_providers("QmSlow", Some(time::Duration::from_millis(100)))
            .await
            .unwrap_err();

        assert!(matches!(error, ResolutionError::Timeout { .. }));
    }
}
