use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::SyncJob;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("row-store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// The durable, row-store-backed job queue (the `SyncJob` table).
pub struct Queue {
    pool: PgPool,
}

impl Queue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts a new queued job, unless a `(tenant, job_type, status=queued)` row
    /// already exists — enforcing the single-pending-run invariant (S6).
    pub async fn enqueue(
        &self,
        tenant_id: Uuid,
        job_type: &str,
        priority: i32,
        scheduled_at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> Result<bool, QueueError> {
        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM sync_jobs WHERE tenant_id = $1 AND job_type = $2 AND status = 'queued'",
        )
        .bind(tenant_id)
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await?;

        if existing.is_some() {
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO sync_jobs (id, tenant_id, job_type, status, priority, scheduled_at, metadata)
             VALUES ($1, $2, $3, 'queued', $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(job_type)
        .bind(priority)
        .bind(scheduled_at)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    /// Atomically claims up to `size` ready queued jobs, ordered `priority DESC,
    /// scheduled_at ASC`, transitioning them to `running` in the same statement so
    /// concurrent dispatchers never double-claim a row.
    pub async fn claim_batch(&self, size: i64, now: DateTime<Utc>) -> Result<Vec<SyncJob>, QueueError> {
        let jobs = sqlx::query_as::<_, SyncJob>(
            "UPDATE sync_jobs SET status = 'running', started_at = $2
             WHERE id IN (
                SELECT id FROM sync_jobs
                WHERE status = 'queued' AND scheduled_at <= $2
                ORDER BY priority DESC, scheduled_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
             )
             RETURNING *",
        )
        .bind(size)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    pub async fn transition_running(&self, id: Uuid) -> Result<(), QueueError> {
        sqlx::query("UPDATE sync_jobs SET status = 'running', started_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn transition_completed(
        &self,
        id: Uuid,
        records_processed: i64,
    ) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE sync_jobs SET status = 'completed', completed_at = now(), records_processed = $2
             WHERE id = $1",
        )
        .bind(id)
        .bind(records_processed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn transition_failed(&self, id: Uuid, error_message: &str) -> Result<(), QueueError> {
        let truncated: String = error_message.chars().take(500).collect();
        sqlx::query(
            "UPDATE sync_jobs SET status = 'failed', completed_at = now(), error_message = $2
             WHERE id = $1",
        )
        .bind(id)
        .bind(truncated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Defers a rate-limited job `delay_minutes` without marking it failed. The job
    /// was already transitioned to `running` by `claim_batch`, so this must put it
    /// back to `queued` (and clear `started_at`) or `claim_batch` will never
    /// re-select it and `reap_stale` will eventually fail it as stale.
    pub async fn requeue_later(&self, id: Uuid, delay_minutes: i64) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE sync_jobs
             SET status = 'queued', started_at = NULL,
                 scheduled_at = now() + ($2 || ' minutes')::interval
             WHERE id = $1",
        )
        .bind(id)
        .bind(delay_minutes.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks any `running` job whose `started_at` is older than `stale_minutes` as
    /// `failed` with the spec's fixed error message. Returns the number reaped.
    pub async fn reap_stale(&self, stale_minutes: i64) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = 'failed', completed_at = now(),
                error_message = 'Stale: still running after ' || $1 || ' min'
             WHERE status = 'running' AND started_at < now() - ($1 || ' minutes')::interval",
        )
        .bind(stale_minutes.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn has_queued(&self, tenant_id: Uuid, job_type: &str) -> Result<bool, QueueError> {
        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM sync_jobs WHERE tenant_id = $1 AND job_type = $2 AND status = 'queued'",
        )
        .bind(tenant_id)
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(existing.is_some())
    }
}
