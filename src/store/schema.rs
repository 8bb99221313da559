//! Table layout for the event store and the startup schema check.

use sqlx::{Row, SqlitePool};

use crate::error::StoreError;

/// Bump together with the DDL below.
pub const SCHEMA_VERSION: i64 = 2;

const CREATE_EVENTS: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        identity_key      TEXT PRIMARY KEY NOT NULL,
        occurred_at_ms    INTEGER NOT NULL,
        latitude          REAL NOT NULL,
        longitude         REAL NOT NULL,
        depth_km          REAL,
        magnitude         REAL NOT NULL,
        location_label    TEXT NOT NULL DEFAULT '',
        provider          TEXT,
        provider_event_id TEXT,
        retrieved_at_ms   INTEGER NOT NULL,
        closest_city_name       TEXT,
        closest_city_code       INTEGER,
        closest_city_distance_m REAL,
        closest_city_population INTEGER,
        epicenter_name          TEXT,
        airports_json           TEXT
    )
"#;

const CREATE_OCCURRED_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_events_occurred
    ON events (occurred_at_ms DESC, identity_key ASC)
"#;

/// Columns added in version 2, appended to a version 1 table in place.
const V2_COLUMNS: &[(&str, &str)] = &[
    ("closest_city_name", "TEXT"),
    ("closest_city_code", "INTEGER"),
    ("closest_city_distance_m", "REAL"),
    ("closest_city_population", "INTEGER"),
    ("epicenter_name", "TEXT"),
    ("airports_json", "TEXT"),
];

const V1_COLUMNS: &[&str] = &[
    "identity_key",
    "occurred_at_ms",
    "latitude",
    "longitude",
    "depth_km",
    "magnitude",
    "location_label",
    "provider",
    "provider_event_id",
    "retrieved_at_ms",
];

/// Create the table on a fresh file, then verify whatever is there.
pub async fn ensure(pool: &SqlitePool) -> Result<(), StoreError> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|e| StoreError::from_sqlx("schema version", e))?;

    if version > SCHEMA_VERSION {
        return Err(StoreError::SchemaMismatch(format!(
            "database schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    if version < SCHEMA_VERSION {
        tracing::info!(target: "store", from = version, to = SCHEMA_VERSION, "migrating events schema");
        for ddl in [CREATE_EVENTS, CREATE_OCCURRED_INDEX] {
            sqlx::query(ddl)
                .execute(pool)
                .await
                .map_err(|e| StoreError::from_sqlx("schema create", e))?;
        }

        // A table we did not create must not be altered.
        let present = column_names(pool).await?;
        require(&present, V1_COLUMNS.iter().copied())?;
        for (name, ty) in V2_COLUMNS {
            if !present.iter().any(|p| p == name) {
                sqlx::query(&format!("ALTER TABLE events ADD COLUMN {name} {ty}"))
                    .execute(pool)
                    .await
                    .map_err(|e| StoreError::from_sqlx("schema migrate", e))?;
            }
        }

        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(pool)
            .await
            .map_err(|e| StoreError::from_sqlx("schema version", e))?;
    }

    let present = column_names(pool).await?;
    require(
        &present,
        V1_COLUMNS.iter().copied().chain(V2_COLUMNS.iter().map(|(n, _)| *n)),
    )
}

async fn column_names(pool: &SqlitePool) -> Result<Vec<String>, StoreError> {
    let rows = sqlx::query("PRAGMA table_info(events)")
        .fetch_all(pool)
        .await
        .map_err(|e| StoreError::from_sqlx("schema check", e))?;

    let mut present = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row
            .try_get("name")
            .map_err(|e| StoreError::from_sqlx("schema check", e))?;
        present.push(name);
    }
    Ok(present)
}

fn require<'a>(present: &[String], columns: impl Iterator<Item = &'a str>) -> Result<(), StoreError> {
    let missing: Vec<&str> = columns
        .filter(|c| !present.iter().any(|p| p == c))
        .collect();

    if !missing.is_empty() {
        return Err(StoreError::SchemaMismatch(format!(
            "events table is missing columns: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}
