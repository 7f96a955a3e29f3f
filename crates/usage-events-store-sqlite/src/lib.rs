#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use usage_events_core::{
    decode_metadata, format_rfc3339, metadata_decode_failure, nanos_to_timestamp, now_utc,
    timestamp_to_nanos, BoundedRetriever, EventFilter, EventInput, EventRecord, EventStore,
    EventsError, Metadata, PredicateSet, QueryArg, Retrieval, RetrievalLimits,
};

const EVENTS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_EVENTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  service TEXT NOT NULL,
  event TEXT NOT NULL,
  path TEXT NOT NULL,
  referrer TEXT,
  user_browser TEXT,
  user_device TEXT,
  timestamp INTEGER NOT NULL,
  user_ip TEXT,
  user_location TEXT,
  metadata TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_events_no_update
BEFORE UPDATE ON events
BEGIN
  SELECT RAISE(FAIL, 'events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_events_no_delete
BEFORE DELETE ON events
BEGIN
  SELECT RAISE(FAIL, 'events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_events_service ON events(service);
CREATE INDEX IF NOT EXISTS idx_events_event ON events(event);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp, id);
";

const SELECT_EVENTS_BASE: &str = "SELECT
    id, service, event, path, referrer, user_browser, user_device,
    timestamp, user_ip, user_location, metadata
 FROM events
 WHERE 1=1";

const COUNT_EVENTS_BASE: &str = "SELECT COUNT(*) FROM events WHERE 1=1";

const NEWEST_FIRST: &str = "timestamp DESC, id DESC";

pub struct SqliteEventStore {
    conn: Connection,
}

impl SqliteEventStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        // LIKE on path must be case-sensitive.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA case_sensitive_like = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_EVENTS_V1)
            .context("failed to apply events schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![EVENTS_MIGRATION_VERSION, now],
            )
            .context("failed to register events schema migration")?;

        Ok(())
    }

    /// Highest applied migration, or `None` for an unmigrated database.
    pub fn schema_version(&self) -> Result<Option<i64>> {
        let has_registry: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
                [],
                |row| row.get(0),
            )
            .context("failed to inspect sqlite_master")?;
        if !has_registry {
            return Ok(None);
        }

        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .context("failed to read schema_migrations")
    }

    #[must_use]
    pub fn target_schema_version() -> i64 {
        EVENTS_MIGRATION_VERSION
    }

    pub fn save_event(&mut self, input: &EventInput) -> Result<EventRecord> {
        input.validate().context("event validation failed")?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start event transaction")?;
        let record = insert_event(&tx, input)?;
        tx.commit().context("failed to commit event transaction")?;

        Ok(record)
    }

    /// Inserts all inputs in one transaction; nothing is stored if any
    /// input is invalid.
    pub fn save_events(&mut self, inputs: &[EventInput]) -> Result<Vec<EventRecord>> {
        for (index, input) in inputs.iter().enumerate() {
            input
                .validate()
                .with_context(|| format!("event validation failed at index {index}"))?;
        }

        let tx = self
            .conn
            .transaction()
            .context("failed to start batch transaction")?;
        let mut records = Vec::with_capacity(inputs.len());
        for input in inputs {
            records.push(insert_event(&tx, input)?);
        }
        tx.commit().context("failed to commit batch transaction")?;

        Ok(records)
    }

    pub fn get_events(&self, filter: &EventFilter) -> Result<Retrieval, EventsError> {
        BoundedRetriever::new(self).get_events(filter)
    }

    pub fn get_events_with_limits(
        &self,
        filter: &EventFilter,
        limits: RetrievalLimits,
    ) -> Result<Retrieval, EventsError> {
        BoundedRetriever::with_limits(self, limits)?.get_events(filter)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl EventStore for SqliteEventStore {
    fn count_events(&self, predicates: &PredicateSet) -> Result<u64, EventsError> {
        let query = predicates.build(COUNT_EVENTS_BASE, None, None, None);
        let count: i64 = self
            .conn
            .query_row(
                &query.sql,
                params_from_iter(query.args.iter().map(to_sql_value)),
                |row| row.get(0),
            )
            .map_err(|err| query_error("count query", &err))?;

        u64::try_from(count)
            .map_err(|_| EventsError::Query(format!("count query returned {count}")))
    }

    fn fetch_events(
        &self,
        predicates: &PredicateSet,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventsError> {
        let query = predicates.build(SELECT_EVENTS_BASE, Some(NEWEST_FIRST), Some(limit), None);
        let mut stmt = self
            .conn
            .prepare(&query.sql)
            .map_err(|err| query_error("event query", &err))?;
        let rows = stmt
            .query_map(
                params_from_iter(query.args.iter().map(to_sql_value)),
                parse_event_row,
            )
            .map_err(|err| query_error("event query", &err))?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(|err| query_error("event row scan", &err))?);
        }
        Ok(events)
    }
}

fn insert_event(conn: &Connection, input: &EventInput) -> Result<EventRecord> {
    let timestamp = timestamp_to_nanos(input.timestamp).map_err(|err| anyhow!(err.to_string()))?;
    let metadata_json = input
        .metadata
        .as_ref()
        .filter(|metadata| !metadata.is_empty())
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize metadata")?;

    conn.execute(
        "INSERT INTO events(
            service, event, path, referrer, user_browser, user_device,
            timestamp, user_ip, user_location, metadata
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            input.service,
            input.event,
            input.path,
            input.referrer,
            input.user_browser,
            input.user_device,
            timestamp,
            input.user_ip,
            input.user_location,
            metadata_json,
        ],
    )
    .context("database insert error")?;

    Ok(EventRecord {
        id: conn.last_insert_rowid(),
        service: input.service.clone(),
        event: input.event.clone(),
        path: input.path.clone(),
        referrer: input.referrer.clone(),
        user_browser: input.user_browser.clone(),
        user_device: input.user_device.clone(),
        timestamp: input.timestamp,
        user_ip: input.user_ip.clone(),
        user_location: input.user_location.clone(),
        metadata: input.metadata.clone().filter(|metadata| !metadata.is_empty()),
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    let id: i64 = row.get(0)?;
    let timestamp_nanos: i64 = row.get(7)?;
    let metadata_raw: Option<String> = row.get(10)?;

    let timestamp = nanos_to_timestamp(timestamp_nanos).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })?;

    Ok(EventRecord {
        id,
        service: row.get(1)?,
        event: row.get(2)?,
        path: row.get(3)?,
        referrer: row.get(4)?,
        user_browser: row.get(5)?,
        user_device: row.get(6)?,
        timestamp,
        user_ip: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        user_location: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        metadata: parse_metadata(id, metadata_raw.as_deref()),
    })
}

/// Null, `null` and `{}` read as absent metadata. Undecodable text yields
/// the failure marker so the rest of the row is still returned.
fn parse_metadata(id: i64, raw: Option<&str>) -> Option<Metadata> {
    let raw = raw.map(str::trim).filter(|value| !value.is_empty())?;
    if raw == "null" {
        return None;
    }

    match decode_metadata(raw) {
        Ok(metadata) if metadata.is_empty() => None,
        Ok(metadata) => Some(metadata),
        Err(err) => {
            tracing::warn!(event_id = id, error = %err, "failed to decode event metadata");
            Some(metadata_decode_failure())
        }
    }
}

fn to_sql_value(arg: &QueryArg) -> SqlValue {
    match arg {
        QueryArg::Text(text) => SqlValue::Text(text.clone()),
        QueryArg::Integer(value) => SqlValue::Integer(*value),
    }
}

fn query_error(context: &str, err: &rusqlite::Error) -> EventsError {
    EventsError::Query(format!("{context} failed: {err}"))
}
