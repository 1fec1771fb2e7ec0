use std::str::FromStr;
use std::time;

use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

/// Enumeration of errors for operations with the event queue.
/// Errors can originate from sqlx and are wrapped by us to provide
/// additional context.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
}

/// Enumeration of possible statuses for a queued event.
/// Available: waiting in the queue to be picked up by a worker.
/// Completed: processed to a terminal status by a worker.
/// Failed: undecodable or out of attempts; will not be delivered again.
/// Running: picked up by a worker and currently being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Available,
    Completed,
    Failed,
    Running,
}

impl JobStatus {
    fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Available => "available",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Running => "running",
        }
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobStatus::Available),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "running" => Ok(JobStatus::Running),
            invalid => Err(QueueError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

/// A subscription event as dequeued from the queue, still undecoded.
/// Decoding is the activity's job; the queue only moves payloads.
#[derive(sqlx::FromRow)]
pub struct EventJob {
    pub id: i64,
    pub attempt: i32,
    pub max_attempts: i32,
    pub payload: sqlx::types::Json<Value>,
}

/// Outcome of asking the queue to redeliver a job later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The job went back to the queue with a later `scheduled_at`.
    Scheduled,
    /// The job was out of attempts and has been marked failed instead.
    Exhausted,
}

/// At-least-once delivery queue for subscription events, implemented on top
/// of a PostgreSQL table.
///
/// Delivery is at-least-once and unordered: a worker crash after the store
/// was mutated but before `complete` redelivers the whole event, which is
/// exactly what the reconciler is built to absorb.
#[derive(Clone)]
pub struct EventQueue {
    table: String,
    pool: PgPool,
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

impl EventQueue {
    /// Initialize a new EventQueue backed by a table in PostgreSQL.
    pub async fn new(url: &str, table: &str) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .connect(url)
            .await
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Self::new_from_pool(pool, table))
    }

    pub fn new_from_pool(pool: PgPool, table: &str) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }

    /// Idempotently create the backing table and its dequeue index.
    pub async fn ensure_table(&self) -> QueueResult<()> {
        let create_table = format!(
            r#"
CREATE TABLE IF NOT EXISTS "{0}" (
    id BIGSERIAL PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'available',
    attempt INT NOT NULL DEFAULT 0,
    max_attempts INT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    scheduled_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    attempted_by TEXT[] NOT NULL DEFAULT ARRAY[]::TEXT[],
    last_error TEXT,
    payload JSONB NOT NULL
)
            "#,
            &self.table
        );
        let create_index = format!(
            r#"
CREATE INDEX IF NOT EXISTS "{0}_dequeue_idx"
ON "{0}" (status, scheduled_at) WHERE status = 'available'
            "#,
            &self.table
        );

        for query in [create_table, create_index] {
            sqlx::query(&query)
                .execute(&self.pool)
                .await
                .map_err(|error| QueueError::QueryError {
                    command: "CREATE".to_owned(),
                    error,
                })?;
        }

        Ok(())
    }

    /// Enqueue a subscription event payload for delivery.
    pub async fn enqueue(&self, payload: &Value, max_attempts: i32) -> QueueResult<()> {
        let base_query = format!(
            r#"
INSERT INTO "{0}" (max_attempts, payload) VALUES ($1, $2)
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .bind(max_attempts)
            .bind(sqlx::types::Json(payload))
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Dequeue the next due event, if any, marking it running.
    pub async fn dequeue(&self, attempted_by: &str) -> QueueResult<Option<EventJob>> {
        let base_query = format!(
            r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        "{0}"
    WHERE
        status = 'available'
        AND scheduled_at <= NOW()
    ORDER BY
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    "{0}"
SET
    started_at = NOW(),
    status = 'running',
    attempt = "{0}".attempt + 1,
    attempted_by = array_append("{0}".attempted_by, $1)
FROM
    available_in_queue
WHERE
    "{0}".id = available_in_queue.id
RETURNING
    "{0}".id, "{0}".attempt, "{0}".max_attempts, "{0}".payload
            "#,
            &self.table
        );

        let job: Option<EventJob> = sqlx::query_as(&base_query)
            .bind(attempted_by)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(job)
    }

    /// Mark a job terminally processed.
    pub async fn complete(&self, job: &EventJob) -> QueueResult<()> {
        self.finish(job, JobStatus::Completed, None).await
    }

    /// Mark a job terminally failed. Used for undecodable payloads, which
    /// will never decode on redelivery.
    pub async fn fail(&self, job: &EventJob, error: &str) -> QueueResult<()> {
        self.finish(job, JobStatus::Failed, Some(error)).await
    }

    /// Return a job to the queue for a later attempt, or mark it failed if
    /// it is out of attempts.
    pub async fn retry(
        &self,
        job: &EventJob,
        interval: time::Duration,
        error: &str,
    ) -> QueueResult<RetryOutcome> {
        if job.attempt >= job.max_attempts {
            self.finish(job, JobStatus::Failed, Some(error)).await?;
            return Ok(RetryOutcome::Exhausted);
        }

        let base_query = format!(
            r#"
UPDATE "{0}"
SET
    status = 'available',
    scheduled_at = NOW() + $2 * INTERVAL '1 millisecond',
    last_error = $3
WHERE id = $1
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .bind(job.id)
            .bind(interval.as_millis() as i64)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(RetryOutcome::Scheduled)
    }

    async fn finish(
        &self,
        job: &EventJob,
        status: JobStatus,
        error: Option<&str>,
    ) -> QueueResult<()> {
        let base_query = format!(
            r#"
UPDATE "{0}"
SET
    status = $2,
    finished_at = NOW(),
    last_error = $3
WHERE id = $1
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .bind(job.id)
            .bind(status.as_str())
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }
}
