//! SQLite-backed catalog.
//!
//! The `UNIQUE(location_id, digest)` constraint on `media` is the durable
//! backstop for the at-most-one-copy rule; the in-memory reservation table
//! in the deduplicator closes the race before anything hits disk.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{Catalog, CatalogError, RecordOutcome};
use crate::domain::{
    CheckLevel, ContentDigest, GeoPoint, IntegrityCheckResult, Location, LocationId,
    MediaCategory, MediaRecord,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS locations (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    root        TEXT NOT NULL UNIQUE,
    latitude    REAL,
    longitude   REAL,
    address     TEXT,
    notes       TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS media (
    location_id   TEXT NOT NULL REFERENCES locations(id),
    digest        TEXT NOT NULL,
    original_name TEXT NOT NULL,
    size          INTEGER NOT NULL,
    category      TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    imported_at   TEXT NOT NULL,
    UNIQUE (location_id, digest)
);

CREATE TABLE IF NOT EXISTS integrity_status (
    location_id     TEXT PRIMARY KEY REFERENCES locations(id),
    status          TEXT NOT NULL,
    checked_at      TEXT NOT NULL,
    last_full_check TEXT,
    result_json     TEXT NOT NULL
);
"#;

/// Catalog stored in a single SQLite file.
///
/// rusqlite is synchronous, so every statement runs on the blocking pool
/// with the connection moved in behind a shared mutex.
#[derive(Clone)]
pub struct SqliteCatalog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCatalog {
    /// Open (or create) a catalog database
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        debug!(path = %path.display(), "Catalog opened");
        Self::init(conn)
    }

    /// In-memory catalog (tests, recovery tooling)
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CatalogError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, CatalogError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, CatalogError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            // A panic while holding the guard cannot leave SQLite half-written
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| CatalogError::Task(e.to_string()))?
    }
}

type LocationRow = (
    String,
    String,
    String,
    Option<f64>,
    Option<f64>,
    Option<String>,
    Option<String>,
    String,
);

fn location_from_row(row: LocationRow) -> Result<Location, CatalogError> {
    let (id, name, root, latitude, longitude, address, notes, created_at) = row;
    let id = LocationId::parse(&id)
        .ok_or_else(|| CatalogError::Corrupt(format!("location id '{}'", id)))?;
    let geo = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(GeoPoint {
            latitude,
            longitude,
        }),
        _ => None,
    };

    Ok(Location {
        id,
        name,
        root: PathBuf::from(root),
        geo,
        address,
        notes,
        created_at: parse_time(&created_at)?,
    })
}

type MediaRow = (String, String, String, i64, String, String, String);

fn media_from_row(row: MediaRow) -> Result<MediaRecord, CatalogError> {
    let (location_id, digest, original_name, size, category, relative_path, imported_at) = row;

    Ok(MediaRecord {
        location_id: LocationId::parse(&location_id)
            .ok_or_else(|| CatalogError::Corrupt(format!("location id '{}'", location_id)))?,
        digest: ContentDigest::parse(&digest)
            .ok_or_else(|| CatalogError::Corrupt(format!("digest '{}'", digest)))?,
        original_name,
        size: u64::try_from(size)
            .map_err(|_| CatalogError::Corrupt(format!("negative size {}", size)))?,
        category: category
            .parse::<MediaCategory>()
            .map_err(|e| CatalogError::Corrupt(e.to_string()))?,
        relative_path,
        imported_at: parse_time(&imported_at)?,
    })
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, CatalogError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CatalogError::Corrupt(format!("timestamp '{}': {}", s, e)))
}

const LOCATION_COLUMNS: &str =
    "id, name, root, latitude, longitude, address, notes, created_at";

const MEDIA_COLUMNS: &str =
    "location_id, digest, original_name, size, category, relative_path, imported_at";

fn location_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<LocationRow> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
    ))
}

fn media_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<MediaRow> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
    ))
}

fn select_media(
    conn: &Connection,
    location_id: &str,
    digest: &str,
) -> Result<Option<MediaRow>, CatalogError> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM media WHERE location_id = ?1 AND digest = ?2",
                MEDIA_COLUMNS
            ),
            params![location_id, digest],
            media_row,
        )
        .optional()?)
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn insert_location(&self, location: &Location) -> Result<(), CatalogError> {
        let location = location.clone();
        self.with_conn(move |conn| {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM locations WHERE id = ?1",
                    params![location.id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(CatalogError::LocationExists(location.id.clone()));
            }

            conn.execute(
                "INSERT INTO locations (id, name, root, latitude, longitude, address, notes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    location.id.as_str(),
                    location.name,
                    location.root.to_string_lossy(),
                    location.geo.map(|g| g.latitude),
                    location.geo.map(|g| g.longitude),
                    location.address,
                    location.notes,
                    location.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_location(&self, location: &Location) -> Result<(), CatalogError> {
        let location = location.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE locations
                 SET name = ?2, latitude = ?3, longitude = ?4, address = ?5, notes = ?6
                 WHERE id = ?1",
                params![
                    location.id.as_str(),
                    location.name,
                    location.geo.map(|g| g.latitude),
                    location.geo.map(|g| g.longitude),
                    location.address,
                    location.notes,
                ],
            )?;
            if changed == 0 {
                return Err(CatalogError::LocationNotFound(location.id.clone()));
            }
            Ok(())
        })
        .await
    }

    async fn get_location(&self, id: &LocationId) -> Result<Option<Location>, CatalogError> {
        let id = id.as_str().to_string();
        self.with_conn(move |conn| {
            let row: Option<LocationRow> = conn
                .query_row(
                    &format!("SELECT {} FROM locations WHERE id = ?1", LOCATION_COLUMNS),
                    params![id],
                    location_row,
                )
                .optional()?;
            row.map(location_from_row).transpose()
        })
        .await
    }

    async fn list_locations(&self) -> Result<Vec<Location>, CatalogError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM locations ORDER BY name, id",
                LOCATION_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], location_row)?
                .collect::<Result<Vec<LocationRow>, _>>()?;
            rows.into_iter().map(location_from_row).collect()
        })
        .await
    }

    async fn find_media(
        &self,
        location_id: &LocationId,
        digest: &ContentDigest,
    ) -> Result<Option<MediaRecord>, CatalogError> {
        let location_id = location_id.as_str().to_string();
        let digest = digest.as_str().to_string();
        self.with_conn(move |conn| {
            select_media(conn, &location_id, &digest)?
                .map(media_from_row)
                .transpose()
        })
        .await
    }

    async fn record_media(&self, record: &MediaRecord) -> Result<RecordOutcome, CatalogError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO media (location_id, digest, original_name, size, category, relative_path, imported_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (location_id, digest) DO NOTHING",
                params![
                    record.location_id.as_str(),
                    record.digest.as_str(),
                    record.original_name,
                    record.size as i64,
                    record.category.dir_name(),
                    record.relative_path,
                    record.imported_at.to_rfc3339(),
                ],
            )?;

            Ok(if inserted == 0 {
                RecordOutcome::Duplicate
            } else {
                RecordOutcome::Inserted
            })
        })
        .await
    }

    async fn list_media(&self, location_id: &LocationId) -> Result<Vec<MediaRecord>, CatalogError> {
        let location_id = location_id.as_str().to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM media WHERE location_id = ?1 ORDER BY relative_path",
                MEDIA_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![location_id], media_row)?
                .collect::<Result<Vec<MediaRow>, _>>()?;
            rows.into_iter().map(media_from_row).collect()
        })
        .await
    }

    async fn remove_media(
        &self,
        location_id: &LocationId,
        digest: &ContentDigest,
    ) -> Result<Option<MediaRecord>, CatalogError> {
        let location_id = location_id.as_str().to_string();
        let digest = digest.as_str().to_string();
        self.with_conn(move |conn| {
            let Some(row) = select_media(conn, &location_id, &digest)? else {
                return Ok(None);
            };

            conn.execute(
                "DELETE FROM media WHERE location_id = ?1 AND digest = ?2",
                params![location_id, digest],
            )?;
            media_from_row(row).map(Some)
        })
        .await
    }

    async fn save_integrity(&self, result: &IntegrityCheckResult) -> Result<(), CatalogError> {
        let json = serde_json::to_string(result)?;
        let full_check = (result.level == CheckLevel::Full).then(|| result.checked_at.to_rfc3339());
        let location_id = result.location_id.as_str().to_string();
        let status = result.status.as_str();
        let checked_at = result.checked_at.to_rfc3339();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO integrity_status (location_id, status, checked_at, last_full_check, result_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (location_id) DO UPDATE SET
                    status = excluded.status,
                    checked_at = excluded.checked_at,
                    last_full_check = COALESCE(excluded.last_full_check, integrity_status.last_full_check),
                    result_json = excluded.result_json",
                params![location_id, status, checked_at, full_check, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn integrity(
        &self,
        location_id: &LocationId,
    ) -> Result<Option<IntegrityCheckResult>, CatalogError> {
        let location_id = location_id.as_str().to_string();
        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT result_json FROM integrity_status WHERE location_id = ?1",
                    params![location_id],
                    |r| r.get(0),
                )
                .optional()?;

            json.map(|j| serde_json::from_str(&j).map_err(CatalogError::from))
                .transpose()
        })
        .await
    }

    async fn last_full_check(
        &self,
        location_id: &LocationId,
    ) -> Result<Option<DateTime<Utc>>, CatalogError> {
        let location_id = location_id.as_str().to_string();
        self.with_conn(move |conn| {
            let ts: Option<Option<String>> = conn
                .query_row(
                    "SELECT last_full_check FROM integrity_status WHERE location_id = ?1",
                    params![location_id],
                    |r| r.get(0),
                )
                .optional()?;

            ts.flatten().map(|s| parse_time(&s)).transpose()
        })
        .await
    }
}
