use std::time;

use thiserror::Error;

/// A raw log line could not be turned into a `LogEntry`.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("parser rejected entry with {status}: {message}")]
    Rejected {
        status: http::StatusCode,
        message: String,
        raw: String,
    },
    #[error("failed to reach parser service: {0}")]
    Request(#[from] reqwest::Error),
    #[error("parser returned a malformed entry: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Finding the providers of a cid failed. Never retried.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("lookup for {cid} timed out after {timeout:?}")]
    Timeout { cid: String, timeout: time::Duration },
    #[error("resolution service failed for {cid} with {status}: {message}")]
    Service {
        cid: String,
        status: http::StatusCode,
        message: String,
    },
    #[error("failed to reach resolution service: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid resolution service url: {0}")]
    Url(#[from] url::ParseError),
}

/// Providers could not be geolocated; the resolution is not persisted.
#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("geolocation service failed with {0}")]
    Service(http::StatusCode),
    #[error("failed to reach geolocation service: {0}")]
    Request(#[from] reqwest::Error),
}

/// Writing a record failed. Only ever logged.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("{command} query failed with: {error}")]
    Query {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("influx write failed: {0}")]
    Influx(#[from] reqwest::Error),
    #[error("influx rejected write with {status}: {message}")]
    InfluxRejected {
        status: http::StatusCode,
        message: String,
    },
}

/// Errors that stop the pipeline loop itself.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("the token pool was closed")]
    TokenPoolClosed(#[from] tokio::sync::AcquireError),
}
