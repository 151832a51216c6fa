//! Payloads exchanged with the parser and resolution services.
//!
//! Field names follow the JSON produced by those services, which is why most
//! numeric values arrive as strings: a gateway log line may leave any of them
//! empty, and it is up to the persistence layer to decide what an empty or
//! malformed value means.
use std::time;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One gateway access log line, as structured by the parser service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub asn: String,
    #[serde(default)]
    pub aso: String,
    #[serde(default)]
    pub body_bytes: String,
    /// Upstream cache status reported by the gateway, e.g. `HIT` or `MISS`.
    #[serde(default)]
    pub cache: String,
    /// The content identifier requested. This is the key we resolve providers for.
    pub cid: String,
    #[serde(default)]
    pub continent: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub lat: String,
    #[serde(default)]
    pub long: String,
    #[serde(default)]
    pub http: String,
    #[serde(default)]
    pub http_host: String,
    #[serde(default)]
    pub http_refer: String,
    #[serde(default)]
    pub http_user_agent: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub request_length: String,
    #[serde(default)]
    pub request_time: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub target: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub upstream_header_time: Vec<String>,
    #[serde(default)]
    pub upstream_response_time: Vec<String>,
}

/// Geolocation of one of a provider's addresses.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub asn: String,
    #[serde(default)]
    pub aso: String,
    #[serde(default)]
    pub continent: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub lat: String,
    #[serde(default)]
    pub long: String,
    #[serde(default)]
    pub region: String,
}

/// A peer reported as holding a copy of some content.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Provider {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    #[serde(rename = "maddrs", default)]
    pub multiaddrs: Vec<String>,
    /// Empty until the provider went through the geolocation service.
    #[serde(default, deserialize_with = "null_as_default")]
    pub locations: Vec<Location>,
}

/// The resolution service's answer, as sent over the wire.
///
/// `duration` is expressed in nanoseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvidersAnswer {
    pub cid: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub duration: u64,
}

/// The outcome of resolving the providers of a single cid.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupResult {
    pub cid: String,
    pub providers: Vec<Provider>,
    /// Time the resolution service reported spending on the lookup.
    pub elapsed: time::Duration,
}

impl From<ProvidersAnswer> for LookupResult {
    fn from(answer: ProvidersAnswer) -> Self {
        Self {
            cid: answer.cid,
            providers: answer.providers,
            elapsed: time::Duration::from_nanos(answer.duration),
        }
    }
}

/// A lookup the find-providers service ran on its own and logged, as
/// structured by the parser service.
///
/// `time` is kept as the logged text: the loader falls back to the time it
/// received the line when it is not RFC 3339.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvidersLog {
    #[serde(default)]
    pub time: String,
    pub cid: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub duration: u64,
}

impl ProvidersLog {
    pub fn logged_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.time)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Go services encode empty slices as `null`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let value = Option::<T>::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}
