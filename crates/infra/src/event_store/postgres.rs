//! Postgres-backed event store implementation.
//!
//! ## Schema
//!
//! | table            | key                                          | role                              |
//! |------------------|----------------------------------------------|-----------------------------------|
//! | `events`         | PK `global_sequence`, UNIQUE `(aggregate_type, aggregate_id, local_sequence)` | append-only log |
//! | `event_sequence` | PK `id` (single row)                         | global sequence allocator         |
//! | `snapshots`      | PK `(aggregate_type, aggregate_id)`          | latest snapshot per aggregate     |
//!
//! ## Global ordering
//!
//! `append` bumps `event_sequence.last_value` with `UPDATE ... RETURNING` right
//! before inserting its events. The row lock is held until commit, so
//! transactions commit in allocation order and a reader that sees global
//! sequence `n` also sees everything below it. A rolled-back append never
//! consumes a number.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `VersionConflict` (concurrent append to the same aggregate) |
//! | Database (other) | any other | `Backend` |
//! | PoolClosed / PoolTimedOut / Io / other | N/A | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use eventide_core::AggregateRef;
use eventide_events::{Event, Metadata, NewEvent};

use super::r#trait::{EventStore, Snapshot, StoreError, validate_stream};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS event_sequence (
        id SMALLINT PRIMARY KEY,
        last_value BIGINT NOT NULL
    )
    "#,
    r#"
    INSERT INTO event_sequence (id, last_value) VALUES (1, 0)
    ON CONFLICT (id) DO NOTHING
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        global_sequence BIGINT PRIMARY KEY,
        event_id UUID NOT NULL UNIQUE,
        aggregate_type TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        local_sequence BIGINT NOT NULL CHECK (local_sequence > 0),
        event_type TEXT NOT NULL,
        payload BYTEA NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        recorded_at TIMESTAMPTZ NOT NULL,
        UNIQUE (aggregate_type, aggregate_id, local_sequence)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        aggregate_type TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        version BIGINT NOT NULL,
        state_blob BYTEA NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (aggregate_type, aggregate_id)
    )
    "#,
];

const EVENT_COLUMNS: &str = "global_sequence, event_id, aggregate_type, aggregate_id, \
     local_sequence, event_type, payload, metadata, recorded_at";

/// Postgres-backed append-only event store.
///
/// Optimistic concurrency is checked inside the append transaction; if another
/// transaction slips in anyway, the unique constraint on
/// `(aggregate_type, aggregate_id, local_sequence)` rejects the insert and the
/// append reports a `VersionConflict`.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    /// Create a new PostgresEventStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Create tables if they do not exist yet. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    async fn fetch_version(&self, aggregate_ref: &AggregateRef) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(local_sequence), 0) AS current_version
            FROM events
            WHERE aggregate_type = $1 AND aggregate_id = $2
            "#,
        )
        .bind(aggregate_ref.aggregate_type())
        .bind(aggregate_ref.aggregate_id())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("current_version", e))?;
        read_version(&row)
    }
}

/// Reserve `count` global sequences; returns the first one.
///
/// Locks the allocator row until the transaction ends.
async fn allocate_sequences(
    tx: &mut Transaction<'_, Postgres>,
    count: u64,
) -> Result<u64, StoreError> {
    let row = sqlx::query(
        r#"
        UPDATE event_sequence
        SET last_value = last_value + $1
        WHERE id = 1
        RETURNING last_value
        "#,
    )
    .bind(count as i64)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("allocate_sequences", e))?;

    let last: i64 = row
        .try_get("last_value")
        .map_err(|e| StoreError::Backend(format!("failed to read last_value: {e}")))?;
    Ok(last as u64 - count + 1)
}

async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_ref: &AggregateRef,
) -> Result<u64, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(local_sequence), 0) AS current_version
        FROM events
        WHERE aggregate_type = $1 AND aggregate_id = $2
        "#,
    )
    .bind(aggregate_ref.aggregate_type())
    .bind(aggregate_ref.aggregate_id())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;
    read_version(&row)
}

fn read_version(row: &sqlx::postgres::PgRow) -> Result<u64, StoreError> {
    let version: i64 = row
        .try_get("current_version")
        .map_err(|e| StoreError::Backend(format!("failed to read current_version: {e}")))?;
    Ok(version as u64)
}

fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Arc<Event>>, StoreError> {
    rows.iter()
        .map(|row| {
            EventRow::from_row(row)
                .map_err(|e| StoreError::Backend(format!("failed to deserialize event row: {e}")))
                .and_then(Event::try_from)
                .map(Arc::new)
        })
        .collect()
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, aggregate_ref, events),
        fields(aggregate = %aggregate_ref, event_count = events.len()),
        err
    )]
    async fn append(
        &self,
        aggregate_ref: &AggregateRef,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Arc<Event>>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let actual = check_stream_version(&mut tx, aggregate_ref).await?;
        if actual != expected_version {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::VersionConflict {
                aggregate_ref: aggregate_ref.clone(),
                expected: expected_version,
                actual,
            });
        }
        if events.is_empty() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(vec![]);
        }

        let first_global = allocate_sequences(&mut tx, events.len() as u64).await?;
        let recorded_at = Utc::now();

        let mut committed = Vec::with_capacity(events.len());
        for (offset, new_event) in events.into_iter().enumerate() {
            let event = Event::commit(
                aggregate_ref.clone(),
                expected_version + offset as u64 + 1,
                first_global + offset as u64,
                new_event,
                recorded_at,
            );

            let inserted = sqlx::query(&format!(
                "INSERT INTO events ({EVENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
            ))
            .bind(event.global_sequence as i64)
            .bind(event.event_id)
            .bind(aggregate_ref.aggregate_type())
            .bind(aggregate_ref.aggregate_id())
            .bind(event.local_sequence as i64)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(Json(&event.metadata))
            .bind(event.recorded_at)
            .execute(&mut *tx)
            .await;

            if let Err(e) = inserted {
                if is_unique_violation(&e) {
                    // Another writer committed this local sequence between our
                    // version check and the insert.
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    let actual = self.fetch_version(aggregate_ref).await?;
                    return Err(StoreError::VersionConflict {
                        aggregate_ref: aggregate_ref.clone(),
                        expected: expected_version,
                        actual,
                    });
                }
                return Err(map_sqlx_error("insert_event", e));
            }
            committed.push(Arc::new(event));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("event_count", committed.len());
        Ok(committed)
    }

    #[instrument(skip(self, aggregate_ref), fields(aggregate = %aggregate_ref), err)]
    async fn load(
        &self,
        aggregate_ref: &AggregateRef,
        from_version: u64,
    ) -> Result<Vec<Arc<Event>>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE aggregate_type = $1 AND aggregate_id = $2 AND local_sequence > $3
            ORDER BY local_sequence ASC
            "#
        ))
        .bind(aggregate_ref.aggregate_type())
        .bind(aggregate_ref.aggregate_id())
        .bind(sql_cursor(from_version))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        let events = decode_rows(rows)?;
        validate_stream(aggregate_ref, from_version, &events)?;
        Ok(events)
    }

    #[instrument(skip(self), err)]
    async fn load_since_batch(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Arc<Event>>, StoreError> {
        let limit = limit.min(i64::MAX as usize) as i64;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE global_sequence > $1
            ORDER BY global_sequence ASC
            LIMIT $2
            "#
        ))
        .bind(sql_cursor(after))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_since", e))?;

        decode_rows(rows)
    }

    #[instrument(skip(self, aggregate_ref), fields(aggregate = %aggregate_ref), err)]
    async fn current_version(&self, aggregate_ref: &AggregateRef) -> Result<u64, StoreError> {
        self.fetch_version(aggregate_ref).await
    }

    #[instrument(skip(self), err)]
    async fn last_global_sequence(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(global_sequence), 0) AS head FROM events")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("last_global_sequence", e))?;
        let head: i64 = row
            .try_get("head")
            .map_err(|e| StoreError::Backend(format!("failed to read head: {e}")))?;
        Ok(head as u64)
    }

    #[instrument(skip(self, aggregate_ref), fields(aggregate = %aggregate_ref), err)]
    async fn get_snapshot(
        &self,
        aggregate_ref: &AggregateRef,
    ) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_type, aggregate_id, version, state_blob
            FROM snapshots
            WHERE aggregate_type = $1 AND aggregate_id = $2
            "#,
        )
        .bind(aggregate_ref.aggregate_type())
        .bind(aggregate_ref.aggregate_id())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_snapshot", e))?;

        row.map(|row| {
            SnapshotRow::from_row(&row)
                .map_err(|e| StoreError::Backend(format!("failed to deserialize snapshot row: {e}")))
                .and_then(Snapshot::try_from)
        })
        .transpose()
    }

    #[instrument(
        skip(self, snapshot),
        fields(aggregate = %snapshot.aggregate_ref, version = snapshot.version),
        err
    )]
    async fn put_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_type, aggregate_id, version, state_blob)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_type, aggregate_id)
            DO UPDATE SET
                version = EXCLUDED.version,
                state_blob = EXCLUDED.state_blob,
                updated_at = NOW()
            "#,
        )
        .bind(snapshot.aggregate_ref.aggregate_type())
        .bind(snapshot.aggregate_ref.aggregate_id())
        .bind(snapshot.version as i64)
        .bind(&snapshot.state_blob)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put_snapshot", e))?;
        Ok(())
    }
}

/// Bind value for an "after X" cursor. Stored sequences never exceed
/// `i64::MAX`, so saturating keeps cursors past the head matching nothing.
fn sql_cursor(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Backend(format!(
            "database error in {operation} ({}): {}",
            db_err.code().unwrap_or_default(),
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Backend(format!("connection pool timed out in {operation}"))
        }
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct EventRow {
    global_sequence: i64,
    event_id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    local_sequence: i64,
    event_type: String,
    payload: Vec<u8>,
    metadata: Json<Metadata>,
    recorded_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            global_sequence: row.try_get("global_sequence")?,
            event_id: row.try_get("event_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            local_sequence: row.try_get("local_sequence")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            metadata: row.try_get("metadata")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let aggregate_ref = AggregateRef::new(row.aggregate_type, row.aggregate_id)
            .map_err(|e| StoreError::Backend(format!("invalid aggregate in event row: {e}")))?;
        Ok(Event {
            event_id: row.event_id,
            aggregate_ref,
            local_sequence: row.local_sequence as u64,
            global_sequence: row.global_sequence as u64,
            event_type: row.event_type,
            payload: row.payload,
            metadata: row.metadata.0,
            recorded_at: row.recorded_at,
        })
    }
}

#[derive(Debug)]
struct SnapshotRow {
    aggregate_type: String,
    aggregate_id: String,
    version: i64,
    state_blob: Vec<u8>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SnapshotRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(SnapshotRow {
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            version: row.try_get("version")?,
            state_blob: row.try_get("state_blob")?,
        })
    }
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = StoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        let aggregate_ref = AggregateRef::new(row.aggregate_type, row.aggregate_id)
            .map_err(|e| StoreError::Backend(format!("invalid aggregate in snapshot row: {e}")))?;
        Ok(Snapshot {
            aggregate_ref,
            version: row.version as u64,
            state_blob: row.state_blob,
        })
    }
}
