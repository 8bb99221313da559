//! # Event store
//! Durable, queryable set of [`EventRecord`]s keyed by identity, backed by a
//! single SQLite table.
//!
//! Writers are serialized (at most one `upsert_batch` in flight) and each
//! batch is one transaction, so readers on the WAL snapshot never observe a
//! partially applied batch. Readers do not wait for writers.
//!
//! ```no_run
//! # async fn example() -> Result<(), quake_watch::error::StoreError> {
//! use std::time::Duration;
//! let store = quake_watch::store::Store::open("quakewatch.db", Duration::from_secs(10)).await?;
//! let latest = store.query_recent(200).await?;
//! # Ok(())
//! # }
//! ```

pub mod schema;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::model::{Airport, ClosestCity, EventRecord, IdentityKey};

const DEFAULT_POOL_SIZE: u32 = 5;

const SELECT_COLUMNS: &str = "identity_key, occurred_at_ms, latitude, longitude, depth_km, \
     magnitude, location_label, provider, provider_event_id, retrieved_at_ms, \
     closest_city_name, closest_city_code, closest_city_distance_m, closest_city_population, \
     epicenter_name, airports_json";

/// Result of one `upsert_batch` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertReport {
    pub inserted: usize,
    pub duplicates: usize,
    /// Records that were actually written, in batch order.
    pub new_records: Vec<EventRecord>,
}

/// Aggregates over a time window. Empty windows have `count == 0` and `None`s.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub count: u64,
    pub mean_magnitude: Option<f64>,
    pub max_magnitude: Option<f64>,
    /// Mean over records with a known depth only.
    pub mean_depth_km: Option<f64>,
}

/// `[start, end)` over `occurred_at`; open bounds are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl StatsWindow {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// The trailing `span` up to and including `now`.
    pub fn last(span: ChronoDuration, now: DateTime<Utc>) -> Self {
        Self {
            start: Some(now - span),
            end: Some(now + ChronoDuration::milliseconds(1)),
        }
    }

    fn bounds_ms(&self) -> (i64, i64) {
        (
            self.start.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN),
            self.end.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX),
        )
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    identity_key: String,
    occurred_at_ms: i64,
    latitude: f64,
    longitude: f64,
    depth_km: Option<f64>,
    magnitude: f64,
    location_label: String,
    provider: Option<String>,
    provider_event_id: Option<String>,
    retrieved_at_ms: i64,
    closest_city_name: Option<String>,
    closest_city_code: Option<i64>,
    closest_city_distance_m: Option<f64>,
    closest_city_population: Option<i64>,
    epicenter_name: Option<String>,
    airports_json: Option<String>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let ts = |ms: i64, col: &str| {
            DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
                StoreError::SchemaMismatch(format!("{col} out of range: {ms}"))
            })
        };
        let airports: Vec<Airport> = match row.airports_json.as_deref() {
            None | Some("") => Vec::new(),
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                StoreError::SchemaMismatch(format!("airports_json is not valid: {e}"))
            })?,
        };
        let closest_city = row.closest_city_name.map(|name| ClosestCity {
            name,
            city_code: row.closest_city_code,
            distance_m: row.closest_city_distance_m,
            population: row.closest_city_population.and_then(|p| u64::try_from(p).ok()),
        });
        Ok(EventRecord {
            identity_key: IdentityKey::from_stored(row.identity_key),
            occurred_at: ts(row.occurred_at_ms, "occurred_at_ms")?,
            latitude: row.latitude,
            longitude: row.longitude,
            depth_km: row.depth_km,
            magnitude: row.magnitude,
            location_label: row.location_label,
            provider: row.provider,
            provider_event_id: row.provider_event_id,
            closest_city,
            epicenter_name: row.epicenter_name,
            airports,
            retrieved_at: ts(row.retrieved_at_ms, "retrieved_at_ms")?,
        })
    }
}

fn decode_rows(rows: Vec<EventRow>) -> Result<Vec<EventRecord>, StoreError> {
    rows.into_iter().map(EventRecord::try_from).collect()
}

#[derive(sqlx::FromRow)]
struct StatsRow {
    count: i64,
    mean_magnitude: Option<f64>,
    max_magnitude: Option<f64>,
    mean_depth_km: Option<f64>,
}

/// Handle to the event table. Cheap to clone; clones share the pool and the
/// writer lock.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
    op_timeout: Duration,
}

impl Store {
    /// Open (or create) the database file and make sure the schema matches.
    pub async fn open(path: impl AsRef<Path>, op_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(op_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_POOL_SIZE)
            .acquire_timeout(op_timeout)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::from_sqlx("open", e))?;

        schema::ensure(&pool).await?;

        tracing::info!(target: "store", path = %path.display(), "event store ready");

        Ok(Self {
            pool,
            writer: Arc::new(Mutex::new(())),
            op_timeout,
        })
    }

    /// Insert every record whose identity key is not stored yet. Existing
    /// rows are never overwritten.
    pub async fn upsert_batch(&self, records: &[EventRecord]) -> Result<InsertReport, StoreError> {
        let _writer = self.writer.lock().await;
        let report = self.bounded("upsert_batch", self.write_batch(records)).await?;
        tracing::debug!(
            target: "store",
            inserted = report.inserted,
            duplicates = report.duplicates,
            "batch committed"
        );
        Ok(report)
    }

    async fn write_batch(&self, records: &[EventRecord]) -> Result<InsertReport, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx("upsert_batch", e))?;

        let mut report = InsertReport::default();
        for r in records {
            let airports_json = if r.airports.is_empty() {
                None
            } else {
                Some(
                    serde_json::to_string(&r.airports)
                        .map_err(|e| StoreError::io("upsert_batch", e.to_string()))?,
                )
            };
            let city = r.closest_city.as_ref();
            let result = sqlx::query(
                r#"
                INSERT INTO events (
                    identity_key, occurred_at_ms, latitude, longitude, depth_km,
                    magnitude, location_label, provider, provider_event_id, retrieved_at_ms,
                    closest_city_name, closest_city_code, closest_city_distance_m,
                    closest_city_population, epicenter_name, airports_json
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(identity_key) DO NOTHING
                "#,
            )
            .bind(r.identity_key.as_str())
            .bind(r.occurred_at.timestamp_millis())
            .bind(r.latitude)
            .bind(r.longitude)
            .bind(r.depth_km)
            .bind(r.magnitude)
            .bind(r.location_label.as_str())
            .bind(r.provider.as_deref())
            .bind(r.provider_event_id.as_deref())
            .bind(r.retrieved_at.timestamp_millis())
            .bind(city.map(|c| c.name.as_str()))
            .bind(city.and_then(|c| c.city_code))
            .bind(city.and_then(|c| c.distance_m))
            .bind(city.and_then(|c| c.population).map(|p| i64::try_from(p).unwrap_or(i64::MAX)))
            .bind(r.epicenter_name.as_deref())
            .bind(airports_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx("upsert_batch", e))?;

            if result.rows_affected() == 1 {
                report.inserted += 1;
                report.new_records.push(r.clone());
            } else {
                report.duplicates += 1;
            }
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::from_sqlx("upsert_batch commit", e))?;
        Ok(report)
    }

    /// Up to `limit` records, newest first; ties by identity key ascending.
    pub async fn query_recent(&self, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM events \
             ORDER BY occurred_at_ms DESC, identity_key ASC LIMIT ?"
        );
        self.bounded("query_recent", async {
            let rows = sqlx::query_as::<_, EventRow>(&sql)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::from_sqlx("query_recent", e))?;
            decode_rows(rows)
        })
        .await
    }

    /// All records with `occurred_at >= since`, newest first.
    pub async fn query_since(&self, since: DateTime<Utc>) -> Result<Vec<EventRecord>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM events WHERE occurred_at_ms >= ? \
             ORDER BY occurred_at_ms DESC, identity_key ASC"
        );
        self.bounded("query_since", async {
            let rows = sqlx::query_as::<_, EventRow>(&sql)
                .bind(since.timestamp_millis())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::from_sqlx("query_since", e))?;
            decode_rows(rows)
        })
        .await
    }

    /// Count, mean/max magnitude and mean depth in one statement.
    pub async fn aggregate_stats(&self, window: StatsWindow) -> Result<Stats, StoreError> {
        let (start, end) = window.bounds_ms();
        self.bounded("aggregate_stats", async {
            let row = sqlx::query_as::<_, StatsRow>(
                r#"
                SELECT COUNT(*)       AS count,
                       AVG(magnitude) AS mean_magnitude,
                       MAX(magnitude) AS max_magnitude,
                       AVG(depth_km)  AS mean_depth_km
                FROM events
                WHERE occurred_at_ms >= ? AND occurred_at_ms < ?
                "#,
            )
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx("aggregate_stats", e))?;

            Ok::<_, StoreError>(Stats {
                count: u64::try_from(row.count).unwrap_or(0),
                mean_magnitude: row.mean_magnitude,
                max_magnitude: row.max_magnitude,
                mean_depth_km: row.mean_depth_km,
            })
        })
        .await
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        self.bounded("count", async {
            let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::from_sqlx("count", e))?;
            Ok::<_, StoreError>(u64::try_from(n).unwrap_or(0))
        })
        .await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn bounded<T, F>(&self, context: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::io(
                context,
                format!("timed out after {:?}", self.op_timeout),
            )),
        }
    }
}
