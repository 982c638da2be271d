//! Postgres-backed queue and dead-letter store.
//!
//! Both tables are shared by every aggregate type and partitioned by a
//! `target_kind` column, so one schema serves all queues.
//!
//! ## Error Mapping
//!
//! SQLx errors map to [`QueueError::Storage`] carrying the operation name.
//! Rows that fail to decode (unknown status, unknown counter name, negative
//! retry count) map to [`QueueError::Decode`].
//!
//! ## Clocks
//!
//! New rows are stamped with the database's `NOW()`, because the producer
//! writes through the caller's transaction. Retry state, polling and
//! dead-letter timestamps use the application clock passed in by the
//! executor and scheduler.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use projector_core::{
    Counter, DeadLetterId, DeadLetterRecord, Deltas, NewProjectionTask, ProjectionTask,
    SoftDelete, TargetId, TaskId, TaskStatus,
};

use super::store::{DeadLetterStore, QueueError, QueueStats, QueueWriter, TaskStore, UnitOfWork};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projection_tasks (
        id BIGSERIAL PRIMARY KEY,
        target_kind TEXT NOT NULL,
        target_id BIGINT NOT NULL,
        deltas JSONB NOT NULL DEFAULT '{}'::jsonb,
        set_deleted BOOLEAN NULL,
        status TEXT NOT NULL DEFAULT 'PENDING' CHECK (status IN ('PENDING', 'RETRYING')),
        retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        next_run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_error TEXT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_projection_tasks_poll
        ON projection_tasks (target_kind, status, next_run_at, id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_projection_tasks_target
        ON projection_tasks (target_kind, target_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projection_dead_letters (
        id UUID PRIMARY KEY,
        target_kind TEXT NOT NULL,
        target_id BIGINT NOT NULL,
        deltas JSONB NOT NULL,
        set_deleted BOOLEAN NULL,
        retry_count INTEGER NOT NULL CHECK (retry_count >= 0),
        error TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_projection_dead_letters_target
        ON projection_dead_letters (target_kind, target_id)
    "#,
];

const TASK_COLUMNS: &str = "id, target_id, deltas, set_deleted, status, retry_count, \
                            next_run_at, last_error, created_at, updated_at";

const DEAD_LETTER_COLUMNS: &str =
    "id, target_id, deltas, set_deleted, retry_count, error, created_at";

/// Postgres queue for the aggregate type described by `C`.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore<C: Counter> {
    pool: Arc<PgPool>,
    _counter: PhantomData<fn() -> C>,
}

impl<C: Counter> PostgresTaskStore<C> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            _counter: PhantomData,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the queue and dead-letter tables if they do not exist.
    #[instrument(skip(self))]
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .context("failed to create projection queue schema")?;
        }
        Ok(())
    }
}

#[async_trait]
impl<'c, C: Counter> QueueWriter<C> for Transaction<'c, Postgres> {
    async fn insert_task(&mut self, task: NewProjectionTask<C>) -> Result<TaskId, QueueError> {
        insert_task_row(&mut **self, &task).await
    }
}

async fn insert_task_row<C: Counter>(
    conn: &mut PgConnection,
    task: &NewProjectionTask<C>,
) -> Result<TaskId, QueueError> {
    let deltas = encode_deltas(&task.deltas)?;

    let row = sqlx::query(
        r#"
        INSERT INTO projection_tasks (target_kind, target_id, deltas, set_deleted)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(C::TARGET_KIND)
    .bind(task.target_id.get())
    .bind(deltas)
    .bind(task.set_deleted.map(|s| s.as_flag()))
    .fetch_one(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_task", e))?;

    let id: i64 = row
        .try_get("id")
        .map_err(|e| map_sqlx_error("insert_task", e))?;
    Ok(TaskId::new(id))
}

/// Unit of work backed by one Postgres transaction.
pub struct PgUnitOfWork<C: Counter> {
    tx: Option<Transaction<'static, Postgres>>,
    _counter: PhantomData<fn() -> C>,
}

impl<C: Counter> PgUnitOfWork<C> {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, QueueError> {
        self.tx.as_mut().ok_or(QueueError::Finished)
    }
}

#[async_trait]
impl<C: Counter> QueueWriter<C> for PgUnitOfWork<C> {
    async fn insert_task(&mut self, task: NewProjectionTask<C>) -> Result<TaskId, QueueError> {
        let tx = self.tx()?;
        insert_task_row(&mut **tx, &task).await
    }
}

#[async_trait]
impl<C: Counter> UnitOfWork<C> for PgUnitOfWork<C> {
    async fn delete_task(&mut self, id: TaskId) -> Result<(), QueueError> {
        let tx = self.tx()?;
        let result = sqlx::query("DELETE FROM projection_tasks WHERE id = $1 AND target_kind = $2")
            .bind(id.get())
            .bind(C::TARGET_KIND)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_task", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn update_task(&mut self, task: &ProjectionTask<C>) -> Result<(), QueueError> {
        let tx = self.tx()?;
        let result = sqlx::query(
            r#"
            UPDATE projection_tasks
            SET status = $3,
                retry_count = $4,
                last_error = $5,
                next_run_at = $6,
                updated_at = $7
            WHERE id = $1 AND target_kind = $2
            "#,
        )
        .bind(task.id.get())
        .bind(C::TARGET_KIND)
        .bind(task.status.as_str())
        .bind(to_db_count(task.retry_count))
        .bind(task.last_error.as_deref())
        .bind(task.next_run_at)
        .bind(task.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_task", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(task.id));
        }
        Ok(())
    }

    async fn insert_dead_letter(&mut self, record: &DeadLetterRecord<C>) -> Result<(), QueueError> {
        let deltas = encode_deltas(record.deltas())?;
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO projection_dead_letters
                (id, target_kind, target_id, deltas, set_deleted, retry_count, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id().as_uuid())
        .bind(C::TARGET_KIND)
        .bind(record.target_id().get())
        .bind(deltas)
        .bind(record.set_deleted().map(|s| s.as_flag()))
        .bind(to_db_count(record.retry_count()))
        .bind(record.error())
        .bind(record.created_at())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), QueueError> {
        let tx = self.tx.take().ok_or(QueueError::Finished)?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(&mut self) -> Result<(), QueueError> {
        let tx = self.tx.take().ok_or(QueueError::Finished)?;
        tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait]
impl<C: Counter> TaskStore<C> for PostgresTaskStore<C> {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork<C>>, QueueError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(Box::new(PgUnitOfWork::<C> {
            tx: Some(tx),
            _counter: PhantomData,
        }))
    }

    #[instrument(skip(self), fields(index = C::INDEX_NAME, task_count), err)]
    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProjectionTask<C>>, QueueError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM projection_tasks
            WHERE target_kind = $1
              AND status IN ('PENDING', 'RETRYING')
              AND next_run_at <= $2
            ORDER BY status, next_run_at, id
            LIMIT $3
            "#
        ))
        .bind(C::TARGET_KIND)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_due", e))?;

        let tasks = decode_tasks(rows)?;
        Span::current().record("task_count", tasks.len());
        Ok(tasks)
    }

    async fn get(&self, id: TaskId) -> Result<Option<ProjectionTask<C>>, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM projection_tasks WHERE id = $1 AND target_kind = $2"
        ))
        .bind(id.get())
        .bind(C::TARGET_KIND)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_task(&r)).transpose()
    }

    async fn tasks_for_target(
        &self,
        target_id: TargetId,
    ) -> Result<Vec<ProjectionTask<C>>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM projection_tasks \
             WHERE target_kind = $1 AND target_id = $2 ORDER BY id"
        ))
        .bind(C::TARGET_KIND)
        .bind(target_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("tasks_for_target", e))?;

        decode_tasks(rows)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'PENDING') AS pending,
                COUNT(*) FILTER (WHERE status = 'RETRYING') AS retrying,
                (SELECT COUNT(*) FROM projection_dead_letters WHERE target_kind = $1) AS dead_lettered
            FROM projection_tasks
            WHERE target_kind = $1
            "#,
        )
        .bind(C::TARGET_KIND)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<usize, QueueError> {
            let n: i64 = row.try_get(column).map_err(|e| map_sqlx_error("stats", e))?;
            Ok(usize::try_from(n).unwrap_or(0))
        };

        Ok(QueueStats {
            pending: count("pending")?,
            retrying: count("retrying")?,
            dead_lettered: count("dead_lettered")?,
        })
    }
}

#[async_trait]
impl<C: Counter> DeadLetterStore<C> for PostgresTaskStore<C> {
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord<C>>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM projection_dead_letters \
             WHERE target_kind = $1 ORDER BY created_at, id LIMIT $2"
        ))
        .bind(C::TARGET_KIND)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letters", e))?;

        rows.iter().map(decode_dead_letter).collect()
    }

    async fn dead_letters_for_target(
        &self,
        target_id: TargetId,
    ) -> Result<Vec<DeadLetterRecord<C>>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM projection_dead_letters \
             WHERE target_kind = $1 AND target_id = $2 ORDER BY created_at, id"
        ))
        .bind(C::TARGET_KIND)
        .bind(target_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letters_for_target", e))?;

        rows.iter().map(decode_dead_letter).collect()
    }
}

/// Raw `projection_tasks` row.
#[derive(Debug, Clone)]
struct TaskRow {
    id: i64,
    target_id: i64,
    deltas: serde_json::Value,
    set_deleted: Option<bool>,
    status: String,
    retry_count: i32,
    next_run_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            target_id: row.try_get("target_id")?,
            deltas: row.try_get("deltas")?,
            set_deleted: row.try_get("set_deleted")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            next_run_at: row.try_get("next_run_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TaskRow {
    fn into_task<C: Counter>(self) -> Result<ProjectionTask<C>, QueueError> {
        Ok(ProjectionTask {
            id: TaskId::new(self.id),
            target_id: TargetId::new(self.target_id),
            deltas: decode_deltas(self.deltas, "task", self.id)?,
            set_deleted: self.set_deleted.map(SoftDelete::from_flag),
            status: self.status.parse::<TaskStatus>()?,
            retry_count: from_db_count(self.retry_count, "task", self.id)?,
            next_run_at: self.next_run_at,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Raw `projection_dead_letters` row.
#[derive(Debug, Clone)]
struct DeadLetterRow {
    id: uuid::Uuid,
    target_id: i64,
    deltas: serde_json::Value,
    set_deleted: Option<bool>,
    retry_count: i32,
    error: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for DeadLetterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeadLetterRow {
            id: row.try_get("id")?,
            target_id: row.try_get("target_id")?,
            deltas: row.try_get("deltas")?,
            set_deleted: row.try_get("set_deleted")?,
            retry_count: row.try_get("retry_count")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl DeadLetterRow {
    fn into_record<C: Counter>(self) -> Result<DeadLetterRecord<C>, QueueError> {
        Ok(DeadLetterRecord::restore(
            DeadLetterId::from_uuid(self.id),
            TargetId::new(self.target_id),
            decode_deltas(self.deltas, "dead letter", self.id)?,
            self.set_deleted.map(SoftDelete::from_flag),
            from_db_count(self.retry_count, "dead letter", self.id)?,
            self.error,
            self.created_at,
        ))
    }
}

fn decode_task<C: Counter>(row: &PgRow) -> Result<ProjectionTask<C>, QueueError> {
    TaskRow::from_row(row)
        .map_err(|e| QueueError::Decode(format!("failed to read task row: {e}")))?
        .into_task()
}

fn decode_tasks<C: Counter>(rows: Vec<PgRow>) -> Result<Vec<ProjectionTask<C>>, QueueError> {
    rows.iter().map(decode_task).collect()
}

fn decode_dead_letter<C: Counter>(row: &PgRow) -> Result<DeadLetterRecord<C>, QueueError> {
    DeadLetterRow::from_row(row)
        .map_err(|e| QueueError::Decode(format!("failed to read dead-letter row: {e}")))?
        .into_record()
}

fn encode_deltas<C: Counter>(deltas: &Deltas<C>) -> Result<serde_json::Value, QueueError> {
    serde_json::to_value(deltas)
        .map_err(|e| QueueError::Storage(format!("failed to encode deltas: {e}")))
}

fn decode_deltas<C: Counter>(
    value: serde_json::Value,
    what: &str,
    id: impl fmt::Display,
) -> Result<Deltas<C>, QueueError> {
    serde_json::from_value(value)
        .map_err(|e| QueueError::Decode(format!("{what} {id}: invalid deltas: {e}")))
}

fn to_db_count(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn from_db_count(count: i32, what: &str, id: impl fmt::Display) -> Result<u32, QueueError> {
    u32::try_from(count)
        .map_err(|_| QueueError::Decode(format!("{what} {id}: negative retry_count {count}")))
}

/// Map SQLx errors to queue errors, keeping the failing operation in the message.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            QueueError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            QueueError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            QueueError::Storage(format!("timed out acquiring a connection in {operation}"))
        }
        sqlx::Error::ColumnNotFound(column) => {
            QueueError::Decode(format!("column {column} missing in {operation}"))
        }
        other => QueueError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
