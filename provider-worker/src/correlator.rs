use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use provider_common::model::{LogEntry, LookupResult};
use sha2::{Digest, Sha256};

use crate::error::ResolutionError;

/// Identifies a gateway request across restarts, so replays of the same log
/// line collapse onto the same `requests` row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Fields hashed, in order. Each one is followed by a unit separator so
    /// that moving characters between adjacent fields changes the digest.
    pub fn from_entry(entry: &LogEntry) -> Self {
        let mut hasher = Sha256::new();
        let fields = [
            entry.time.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            entry.ip.clone(),
            entry.cid.clone(),
            entry.body_bytes.clone(),
            entry.request_time.clone(),
            entry.request_length.clone(),
            entry.http_user_agent.clone(),
        ];
        for field in &fields {
            hasher.update(field.as_bytes());
            hasher.update([0x1f]);
        }

        RequestId(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A finished lookup, with everything needed to persist it without going
/// back to the entry that triggered it.
#[derive(Debug)]
pub struct CorrelationEnvelope {
    pub request_id: RequestId,
    pub cid: String,
    /// When the gateway served the triggering request.
    pub requested_at: DateTime<Utc>,
    pub dispatched_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub result: Result<LookupResult, ResolutionError>,
}

impl CorrelationEnvelope {
    /// Stamp a dispatch. `complete` turns it into an envelope once the lookup returns.
    pub fn dispatch(entry: &LogEntry, request_id: RequestId) -> Dispatch {
        Dispatch {
            request_id,
            cid: entry.cid.clone(),
            requested_at: entry.time,
            dispatched_at: Utc::now(),
        }
    }
}

/// A lookup on its way to the resolution service.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub request_id: RequestId,
    pub cid: String,
    pub requested_at: DateTime<Utc>,
    pub dispatched_at: DateTime<Utc>,
}

impl Dispatch {
    pub fn complete(self, result: Result<LookupResult, ResolutionError>) -> CorrelationEnvelope {
        CorrelationEnvelope {
            request_id: self.request_id,
            cid: self.cid,
            requested_at: self.requested_at,
            dispatched_at: self.dispatched_at,
            completed_at: Utc::now(),
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn entry() -> LogEntry {
        LogEntry {
            cid: "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG".to_owned(),
            ip: "192.0.2.10".to_owned(),
            body_bytes: "2048".to_owned(),
            request_time: "0.120".to_owned(),
            request_length: "312".to_owned(),
            http_user_agent: "curl/8.0".to_owned(),
            cache: "MISS".to_owned(),
            time: Utc.with_ymd_and_hms(2022, 5, 1, 10, 0, 0).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_request_id_is_deterministic() {
        let id = RequestId::from_entry(&entry());

        assert_eq!(id, RequestId::from_entry(&entry()));
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_request_id_covers_every_field() {
        let base = entry();
        let variants: Vec<LogEntry> = vec![
            LogEntry {
                time: base.time + chrono::Duration::milliseconds(1),
                ..base.clone()
            },
            LogEntry {
                ip: "192.0.2.11".to_owned(),
                ..base.clone()
            },
            LogEntry {
                cid: "QmOther".to_owned(),
                ..base.clone()
            },
            LogEntry {
                body_bytes: "2049".to_owned(),
                ..base.clone()
            },
            LogEntry {
                request_time: "0.121".to_owned(),
                ..base.clone()
            },
            LogEntry {
                request_length: "313".to_owned(),
                ..base.clone()
            },
            LogEntry {
                http_user_agent: "curl/8.1".to_owned(),
                ..base.clone()
            },
            // Shifting a character across a field boundary.
            LogEntry {
                body_bytes: "204".to_owned(),
                request_time: "80.120".to_owned(),
                ..base.clone()
            },
            base.clone(),
        ];

        let ids: HashSet<RequestId> = variants.iter().map(RequestId::from_entry).collect();
        assert_eq!(ids.len(), variants.len());
    }

    #[test]
    fn test_request_id_ignores_unhashed_fields() {
        let base = entry();
        let other = LogEntry {
            cache: "HIT".to_owned(),
            country: "PT".to_owned(),
            ..base.clone()
        };

        assert_eq!(RequestId::from_entry(&base), RequestId::from_entry(&other));
    }

    #[test]
    fn test_envelope_carries_dispatch_context() {
        let entry = entry();
        let id = RequestId::from_entry(&entry);
        let dispatch = CorrelationEnvelope::dispatch(&entry, id.clone());

        let envelope = dispatch.complete(Err(ResolutionError::Timeout {
            cid: entry.cid.clone(),
            timeout: std::time::Duration::from_secs(1),
        }));

        assert_eq!(envelope.request_id, id);
        assert_eq!(envelope.cid, entry.cid);
        assert_eq!(envelope.requested_at, entry.time);
        assert!(envelope.completed_at >= envelope.dispatched_at);
        assert!(envelope.result.is_err());
    }
}
