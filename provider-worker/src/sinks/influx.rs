use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provider_common::model::{Location, LogEntry};
use reqwest::header;

use super::{non_empty, parse_number, PersistenceGateway, ResolutionRecord};
use crate::config::InfluxConfig;
use crate::correlator::RequestId;
use crate::error::PersistenceError;

/// Writes points through the InfluxDB v2 HTTP API, in line protocol.
pub struct InfluxGateway {
    client: reqwest::Client,
    write_url: String,
    token: String,
}

impl InfluxGateway {
    pub fn new(client: reqwest::Client, config: &InfluxConfig) -> Result<Self, url::ParseError> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/api/v2/write", config.influx_url.trim_end_matches('/')),
            &[
                ("org", config.influx_org.as_str()),
                ("bucket", config.influx_bucket.as_str()),
                ("precision", "ns"),
            ],
        )?;

        Ok(Self {
            client,
            write_url: url.to_string(),
            token: config.influx_token.clone(),
        })
    }

    async fn write(&self, body: String) -> Result<(), PersistenceError> {
        let response = self
            .client
            .post(&self.write_url)
            .header(header::AUTHORIZATION, format!("Token {}", self.token))
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PersistenceError::InfluxRejected { status, message });
        }

        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for InfluxGateway {
    async fn write_entry(
        &self,
        entry: &LogEntry,
        request_id: &RequestId,
    ) -> Result<(), PersistenceError> {
        self.write(entry_line(entry, request_id)).await
    }

    async fn write_resolution(&self, record: &ResolutionRecord) -> Result<(), PersistenceError> {
        let lines = resolution_lines(record);
        if lines.is_empty() {
            return Ok(());
        }
        self.write(lines.join("\n")).await
    }
}

fn entry_line(entry: &LogEntry, request_id: &RequestId) -> String {
    let mut line = Line::new("requests");
    line.tag("cid", &entry.cid)
        .tag("continent", &entry.continent)
        .tag("country", &entry.country)
        .field_str("req_id", request_id.as_str());

    if let Some(region) = non_empty(&entry.region) {
        line.field_str("region", region);
    }
    if let Some(request_time) = parse_number(&entry.request_time) {
        line.field_f64("request_time", request_time);
    }
    if let Some(upstream_time) = entry
        .upstream_response_time
        .first()
        .and_then(|t| parse_number(t))
    {
        line.field_f64("upstream_time", upstream_time);
    }
    if let Some(body_bytes) = parse_number(&entry.body_bytes) {
        line.field_f64("body_bytes", body_bytes);
    }
    if let Some(user_agent) = non_empty(&entry.http_user_agent) {
        line.field_str("user_agent", user_agent);
    }
    if let Some(cache) = non_empty(&entry.cache) {
        line.field_str("cache", cache);
    }

    line.finish(entry.time)
}

/// One point per provider location.
fn resolution_lines(record: &ResolutionRecord) -> Vec<String> {
    let unknown = Location::default();
    let mut lines = Vec::new();

    for provider in &record.providers {
        let locations = if provider.locations.is_empty() {
            std::slice::from_ref(&unknown)
        } else {
            provider.locations.as_slice()
        };

        for location in locations {
            let mut line = Line::new("providers");
            line.tag("cid", &record.cid)
                .tag("continent", &location.continent)
                .tag("country", &location.country)
                .field_str("peer_id", &provider.peer_id)
                .field_i64(
                    "request_time_ms",
                    record.lookup_duration.as_millis().try_into().unwrap_or(i64::MAX),
                )
                .field_i64(
                    "dispatched_at",
                    record.dispatched_at.timestamp_nanos_opt().unwrap_or_default(),
                );
            if let Some(lat) = parse_number(&location.lat) {
                line.field_f64("lat", lat);
            }
            if let Some(long) = parse_number(&location.long) {
                line.field_f64("long", long);
            }
            lines.push(line.finish(record.requested_at));
        }
    }

    lines
}

/// Builds a single line protocol point. Tags must be added before fields.
struct Line {
    buf: String,
    fields: usize,
}

impl Line {
    fn new(measurement: &str) -> Self {
        Self {
            buf: escape(measurement, &[',', ' ']),
            fields: 0,
        }
    }

    /// Empty tag values are not allowed by influx, so they are skipped.
    fn tag(&mut self, key: &str, value: &str) -> &mut Self {
        if !value.is_empty() {
            self.buf.push(',');
            self.buf.push_str(&escape(key, &[',', '=', ' ']));
            self.buf.push('=');
            self.buf.push_str(&escape(value, &[',', '=', ' ']));
        }
        self
    }

    fn field_str(&mut self, key: &str, value: &str) -> &mut Self {
        let value = format!("\"{}\"", escape(value, &['"', '\\']));
        self.field(key, &value)
    }

    fn field_f64(&mut self, key: &str, value: f64) -> &mut Self {
        self.field(key, &value.to_string())
    }

    fn field_i64(&mut self, key: &str, value: i64) -> &mut Self {
        self.field(key, &format!("{value}i"))
    }

    fn field(&mut self, key: &str, value: &str) -> &mut Self {
        self.buf.push(if self.fields == 0 { ' ' } else { ',' });
        self.buf.push_str(&escape(key, &[',', '=', ' ']));
        self.buf.push('=');
        self.buf.push_str(value);
        self.fields += 1;
        self
    }

    fn finish(self, timestamp: DateTime<Utc>) -> String {
        match timestamp.timestamp_nanos_opt() {
            Some(nanos) => format!("{} {}", self.buf, nanos),
            None => self.buf,
        }
    }
}

/// Line protocol has no escape for line breaks, so they become spaces.
fn escape(s: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        let c = if c == '\n' || c == '\r' { ' ' } else { c };
        if special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::{Method::POST, MockServer};
    use provider_common::model::Provider;

    fn entry() -> LogEntry {
        LogEntry {
            cid: "QmEntry".to_owned(),
            continent: "EU".to_owned(),
            country: "".to_owned(),
            region: "Lisbon, PT".to_owned(),
            request_time: "0.250".to_owned(),
            body_bytes: "not-a-number".to_owned(),
            http_user_agent: "Mozilla \"5.0\"".to_owned(),
            time: Utc.timestamp_opt(1_651_399_200, 0).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_entry_line() {
        let line = entry_line(&entry(), &RequestId::from_entry(&entry()));
        let id = RequestId::from_entry(&entry());

        assert_eq!(
            line,
            format!(
                "requests,cid=QmEntry,continent=EU req_id=\"{id}\",region=\"Lisbon, PT\",\
                 request_time=0.25,user_agent=\"Mozilla \\\"5.0\\\"\" 1651399200000000000"
            )
        );
    }

    #[test]
    fn test_escape_tags() {
        let mut line = Line::new("providers");
        line.tag("country", "United States")
            .tag("region", "a,b=c")
            .field_i64("n", 1);

        assert_eq!(
            line.finish(Utc.timestamp_opt(0, 0).unwrap()),
            "providers,country=United\\ States,region=a\\,b\\=c n=1i 0"
        );
    }

    #[test]
    fn test_line_breaks_do_not_split_points() {
        let mut line = Line::new("requests");
        line.tag("region", "North\nHolland")
            .field_str("user_agent", "curl\r\n/8.0 \"x\"");

        let point = line.finish(Utc.timestamp_opt(0, 0).unwrap());

        assert!(!point.contains('\n'));
        assert!(!point.contains('\r'));
        assert_eq!(
            point,
            "requests,region=North\\ Holland user_agent=\"curl  /8.0 \\\"x\\\"\" 0"
        );
    }

    #[test]
    fn test_resolution_lines_per_location() {
        let record = ResolutionRecord {
            cid: "QmRes".to_owned(),
            requested_at: Utc.timestamp_opt(10, 0).unwrap(),
            dispatched_at: Utc.timestamp_opt(11, 0).unwrap(),
            completed_at: Utc.timestamp_opt(12, 0).unwrap(),
            lookup_duration: std::time::Duration::from_millis(1500),
            providers: vec![
                Provider {
                    peer_id: "12D3KooWA".to_owned(),
                    multiaddrs: vec![],
                    locations: vec![
                        Location {
                            continent: "EU".to_owned(),
                            lat: "38.7".to_owned(),
                            ..Default::default()
                        },
                        Location {
                            continent: "NA".to_owned(),
                            ..Default::default()
                        },
                    ],
                },
                Provider {
                    peer_id: "12D3KooWB".to_owned(),
                    multiaddrs: vec![],
                    locations: vec![],
                },
            ],
        };

        let lines = resolution_lines(&record);

        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "providers,cid=QmRes,continent=EU peer_id=\"12D3KooWA\",request_time_ms=1500i,\
             dispatched_at=11000000000i,lat=38.7 10000000000"
        );
        assert!(lines[1].starts_with("providers,cid=QmRes,continent=NA "));
        assert!(lines[2].starts_with("providers,cid=QmRes peer_id=\"12D3KooWB\""));
    }

    #[tokio::test]
    async fn test_write_entry() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v2/write")
                .query_param("org", "org")
                .query_param("bucket", "bucket")
                .query_param("precision", "ns")
                .header("authorization", "Token secret");
            then.status(204);
        });

        let config = InfluxConfig {
            influx_url: server.base_url(),
            influx_org: "org".to_owned(),
            influx_bucket: "bucket".to_owned(),
            influx_token: "secret".to_owned(),
        };
        let gateway =
            InfluxGateway::new(reqwest::Client::new(), &config).expect("invalid influx url");

        gateway
            .write_entry(&entry(), &RequestId::from_entry(&entry()))
            .await
            .expect("failed to write entry");
        mock.assert();
    }

    #[tokio::test]
    async fn test_write_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/v2/write");
            then.status(401).body("unauthorized access");
        });

        let config = InfluxConfig {
            influx_url: server.base_url(),
            influx_org: "org".to_owned(),
            influx_bucket: "bucket".to_owned(),
            influx_token: "wrong".to_owned(),
        };
        let gateway =
            InfluxGateway::new(reqwest::Client::new(), &config).expect("invalid influx url");

        let error = gateway
            .write_entry(&entry(), &RequestId::from_entry(&entry()))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            PersistenceError::InfluxRejected { status, .. } if status == http::StatusCode::UNAUTHORIZED
        ));
    }
}
