use async_trait::async_trait;
use provider_common::model::{Location, LogEntry};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::debug;

use super::{non_empty, parse_number, PersistenceGateway, ResolutionRecord};
use crate::correlator::RequestId;
use crate::error::PersistenceError;

/// Writes entries to `requests` and resolutions to `providers`.
pub struct PostgresGateway {
    pool: PgPool,
}

impl PostgresGateway {
    /// The pool connects lazily, so a database that is down at startup only
    /// shows up as failed writes.
    pub fn new(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `requests` and `providers` tables if they are missing.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../migrations").run(&self.pool).await
    }
}

#[async_trait]
impl PersistenceGateway for PostgresGateway {
    async fn write_entry(
        &self,
        entry: &LogEntry,
        request_id: &RequestId,
    ) -> Result<(), PersistenceError> {
        debug!("writing request of cid {}", entry.cid);

        let upstream_time = entry
            .upstream_response_time
            .first()
            .and_then(|t| parse_number::<f64>(t));

        sqlx::query(
            r#"
INSERT INTO requests
    (req_id, timestamp, cid, continent, country, region, lat, long, asn, aso,
    request_time, upstream_time, body_bytes, user_agent, cache, status)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
ON CONFLICT ON CONSTRAINT requests_pkey DO NOTHING
            "#,
        )
        .bind(request_id.as_str())
        .bind(entry.time)
        .bind(&entry.cid)
        .bind(non_empty(&entry.continent))
        .bind(non_empty(&entry.country))
        .bind(non_empty(&entry.region))
        .bind(parse_number::<f64>(&entry.lat))
        .bind(parse_number::<f64>(&entry.long))
        .bind(parse_number::<i32>(&entry.asn))
        .bind(non_empty(&entry.aso))
        .bind(parse_number::<f64>(&entry.request_time))
        .bind(upstream_time)
        .bind(parse_number::<f64>(&entry.body_bytes))
        .bind(non_empty(&entry.http_user_agent))
        .bind(non_empty(&entry.cache))
        .bind(parse_number::<i32>(&entry.status))
        .execute(&self.pool)
        .await
        .map_err(|error| PersistenceError::Query {
            command: "INSERT requests",
            error,
        })?;

        Ok(())
    }

    /// One row per provider. Providers that could not be located still get a
    /// row; later resolutions fill in whatever location fields they learn.
    async fn write_resolution(&self, record: &ResolutionRecord) -> Result<(), PersistenceError> {
        debug!("writing providers of cid {}", record.cid);

        let unknown = Location::default();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| PersistenceError::Query {
                command: "BEGIN",
                error,
            })?;

        for provider in &record.providers {
            let peer_id = provider.peer_id.trim_matches(|c| c == '{' || c == '}');
            let locations = if provider.locations.is_empty() {
                std::slice::from_ref(&unknown)
            } else {
                provider.locations.as_slice()
            };

            for location in locations {
                sqlx::query(
                    r#"
INSERT INTO providers
    (cid, peer_id, continent, country, region, lat, long, asn, aso,
    request_time, found_at, updated_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
ON CONFLICT ON CONSTRAINT providers_pkey DO UPDATE SET
    continent = COALESCE($3, providers.continent),
    country = COALESCE($4, providers.country),
    region = COALESCE($5, providers.region),
    lat = COALESCE($6, providers.lat),
    long = COALESCE($7, providers.long),
    asn = COALESCE($8, providers.asn),
    aso = COALESCE($9, providers.aso),
    request_time = $10,
    updated_at = $12
                    "#,
                )
                .bind(&record.cid)
                .bind(peer_id)
                .bind(non_empty(&location.continent))
                .bind(non_empty(&location.country))
                .bind(non_empty(&location.region))
                .bind(parse_number::<f64>(&location.lat))
                .bind(parse_number::<f64>(&location.long))
                .bind(parse_number::<i32>(&location.asn))
                .bind(non_empty(&location.aso))
                .bind(record.lookup_duration.as_secs_f64())
                .bind(record.dispatched_at)
                .bind(record.completed_at)
                .execute(&mut *tx)
                .await
                .map_err(|error| PersistenceError::Query {
                    command: "UPSERT providers",
                    error,
                })?;
            }
        }

        tx.commit().await.map_err(|error| PersistenceError::Query {
            command: "COMMIT",
            error,
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use provider_common::model::Provider;

    fn entry() -> LogEntry {
        LogEntry {
            cid: "QmStored".to_owned(),
            ip: "198.51.100.7".to_owned(),
            continent: "EU".to_owned(),
            country: "".to_owned(),
            asn: "AS3243".to_owned(),
            request_time: "0.250".to_owned(),
            body_bytes: "".to_owned(),
            upstream_response_time: vec!["0.040".to_owned()],
            time: Utc.with_ymd_and_hms(2022, 5, 1, 10, 0, 0).unwrap(),
            ..Default::default()
        }
    }

    fn record(providers: Vec<Provider>, completed_at: i64) -> ResolutionRecord {
        ResolutionRecord {
            cid: "QmStored".to_owned(),
            requested_at: Utc.timestamp_opt(100, 0).unwrap(),
            dispatched_at: Utc.timestamp_opt(101, 0).unwrap(),
            completed_at: Utc.timestamp_opt(completed_at, 0).unwrap(),
            lookup_duration: std::time::Duration::from_millis(1500),
            providers,
        }
    }

    fn provider(peer_id: &str, locations: Vec<Location>) -> Provider {
        Provider {
            peer_id: peer_id.to_owned(),
            multiaddrs: vec![],
            locations,
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_replayed_entry_is_stored_once(db: PgPool) {
        let gateway = PostgresGateway::new_from_pool(db.clone());
        let request_id = RequestId::from_entry(&entry());

        gateway
            .write_entry(&entry(), &request_id)
            .await
            .expect("failed to write entry");
        gateway
            .write_entry(&entry(), &request_id)
            .await
            .expect("failed to write replayed entry");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_empty_and_malformed_fields_are_null(db: PgPool) {
        let gateway = PostgresGateway::new_from_pool(db.clone());
        let request_id = RequestId::from_entry(&entry());

        gateway
            .write_entry(&entry(), &request_id)
            .await
            .expect("failed to write entry");

        let row: (
            String,
            Option<String>,
            Option<String>,
            Option<i32>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
        ) = sqlx::query_as(
            "SELECT req_id, continent, country, asn, request_time, upstream_time, body_bytes FROM requests",
        )
        .fetch_one(&db)
        .await
        .unwrap();

        assert_eq!(row.0, request_id.as_str());
        assert_eq!(row.1.as_deref(), Some("EU"));
        assert_eq!(row.2, None);
        assert_eq!(row.3, None);
        assert_eq!(row.4, Some(0.25));
        assert_eq!(row.5, Some(0.04));
        assert_eq!(row.6, None);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_unlocated_resolution_keeps_location(db: PgPool) {
        let gateway = PostgresGateway::new_from_pool(db.clone());
        let located = provider(
            "12D3KooWA",
            vec![Location {
                continent: "EU".to_owned(),
                country: "PT".to_owned(),
                asn: "3243".to_owned(),
                ..Default::default()
            }],
        );

        gateway
            .write_resolution(&record(vec![located], 102))
            .await
            .expect("failed to write located resolution");
        gateway
            .write_resolution(&record(vec![provider("12D3KooWA", vec![])], 200))
            .await
            .expect("failed to write unlocated resolution");

        type Row = (
            Option<String>,
            Option<String>,
            Option<i32>,
            f64,
            DateTime<Utc>,
            DateTime<Utc>,
        );
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT continent, country, asn, request_time, found_at, updated_at FROM providers",
        )
        .fetch_all(&db)
        .await
        .unwrap();

        assert_eq!(rows.len(), 1);
        let (continent, country, asn, request_time, found_at, updated_at) = &rows[0];
        assert_eq!(continent.as_deref(), Some("EU"));
        assert_eq!(country.as_deref(), Some("PT"));
        assert_eq!(*asn, Some(3243));
        assert_eq!(*request_time, 1.5);
        assert_eq!(*found_at, Utc.timestamp_opt(101, 0).unwrap());
        assert_eq!(*updated_at, Utc.timestamp_opt(200, 0).unwrap());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_peer_id_braces_are_trimmed(db: PgPool) {
        let gateway = PostgresGateway::new_from_pool(db.clone());

        gateway
            .write_resolution(&record(
                vec![provider("{12D3KooWA}", vec![]), provider("12D3KooWB", vec![])],
                102,
            ))
            .await
            .expect("failed to write resolution");

        let peer_ids: Vec<String> =
            sqlx::query_scalar("SELECT peer_id FROM providers ORDER BY peer_id")
                .fetch_all(&db)
                .await
                .unwrap();

        assert_eq!(peer_ids, vec!["12D3KooWA".to_owned(), "12D3KooWB".to_owned()]);
    }
}
