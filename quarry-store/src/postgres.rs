//! Postgres job store
//!
//! Handles all database operations on the job table. Every mutation is a
//! single conditional `UPDATE` whose `WHERE` clause carries the ownership
//! precondition, so the database's row-level atomicity is what guarantees
//! mutual exclusion between racing workers.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use quarry_core::domain::job::{Job, JobStatus};
use quarry_core::dto::job::{ClaimFilter, FinalStatus, FinalizeFields, LeaseExtension, NewJob};

use crate::error::StoreError;
use crate::store::JobStore;

const JOB_COLUMNS: &str = "id, status, payload, owner_worker_id, lease_expires_at, \
     attempt_count, max_attempts, progress, cancel_requested, result, \
     last_error, created_at, updated_at";

/// sqlx-backed job store
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    /// Connects a pool and runs migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Wraps an existing pool without running migrations.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                status VARCHAR(20) NOT NULL,
                payload JSONB NOT NULL DEFAULT 'null',
                owner_worker_id VARCHAR(255),
                lease_expires_at TIMESTAMPTZ,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                progress TEXT,
                cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
                result JSONB,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Claim selection scans by status and age; the sweep scans by lease.
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_lease_expires ON jobs(lease_expires_at)")
            .execute(&self.pool)
            .await?;

        tracing::info!("job table migrations completed");
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, new: NewJob) -> Result<Job, StoreError> {
        let id = Uuid::new_v4();
        let now = chrono::Utc::now();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO jobs (id, status, payload, max_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(JobStatus::Pending.as_str())
        .bind(&new.payload)
        .bind(new.max_attempts)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1",
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(StoreError::NotFound(job_id))?.try_into()
    }

    async fn try_claim_one(
        &self,
        filter: &ClaimFilter,
        new_owner: &str,
        lease_until: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Job>, StoreError> {
        // Cancel-requested candidates leave the claimable set before
        // selection; the claim attempt is what makes a pending cancel
        // observable.
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'canceled', owner_worker_id = NULL,
                lease_expires_at = NULL, updated_at = $1
            WHERE cancel_requested
              AND (status = 'pending'
                   OR (status IN ('claimed', 'running') AND lease_expires_at <= $1))
            "#,
        )
        .bind(filter.now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = 'claimed', owner_worker_id = $2,
                lease_expires_at = $3, last_error = NULL, updated_at = $1
            WHERE id = (
                SELECT id FROM jobs
                WHERE NOT cancel_requested
                  AND (status = 'pending'
                       OR (status IN ('claimed', 'running') AND lease_expires_at <= $1))
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(filter.now)
        .bind(new_owner)
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn try_start(&self, job_id: Uuid, owner_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', updated_at = $3
            WHERE id = $1 AND owner_worker_id = $2 AND status = 'claimed'
            "#,
        )
        .bind(job_id)
        .bind(owner_id)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn try_extend_lease(
        &self,
        job_id: Uuid,
        owner_id: &str,
        lease_until: chrono::DateTime<chrono::Utc>,
    ) -> Result<LeaseExtension, StoreError> {
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET lease_expires_at = $3, updated_at = $4
            WHERE id = $1 AND owner_worker_id = $2
              AND status IN ('claimed', 'running')
            RETURNING cancel_requested
            "#,
        )
        .bind(job_id)
        .bind(owner_id)
        .bind(lease_until)
        .bind(chrono::Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((cancel_requested,)) => LeaseExtension {
                extended: true,
                cancel_requested,
            },
            None => LeaseExtension::lost(),
        })
    }

    async fn try_finalize(
        &self,
        job_id: Uuid,
        owner_id: &str,
        new_status: FinalStatus,
        fields: &FinalizeFields,
    ) -> Result<bool, StoreError> {
        let lease = if new_status == FinalStatus::Failed {
            fields.retry_not_before
        } else {
            None
        };
        let attempt_delta: i32 = if new_status.counts_as_attempt() { 1 } else { 0 };

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $3,
                owner_worker_id = NULL,
                lease_expires_at = $4,
                attempt_count = attempt_count + $5,
                last_error = $6,
                result = COALESCE($7, result),
                progress = COALESCE($8, progress),
                updated_at = $9
            WHERE id = $1 AND owner_worker_id = $2
              AND status IN ('claimed', 'running')
            "#,
        )
        .bind(job_id)
        .bind(owner_id)
        .bind(new_status.as_job_status().as_str())
        .bind(lease)
        .bind(attempt_delta)
        .bind(&fields.last_error)
        .bind(&fields.result)
        .bind(&fields.progress)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn try_update_progress(
        &self,
        job_id: Uuid,
        owner_id: &str,
        progress: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET progress = $3, updated_at = $4
            WHERE id = $1 AND owner_worker_id = $2
              AND status IN ('claimed', 'running')
            "#,
        )
        .bind(job_id)
        .bind(owner_id)
        .bind(progress)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET cancel_requested = TRUE, updated_at = $2
            WHERE id = $1 AND status NOT IN ('completed', 'dead', 'canceled')
            "#,
        )
        .bind(job_id)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Terminal jobs ignore the request; absent jobs are an error.
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(StoreError::NotFound(job_id));
            }
        }
        Ok(())
    }

    async fn reap_expired(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', owner_worker_id = NULL,
                lease_expires_at = NULL, updated_at = $1
            WHERE (status IN ('claimed', 'running') AND lease_expires_at <= $1)
               OR (status = 'failed'
                   AND (lease_expires_at IS NULL OR lease_expires_at <= $1))
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    status: String,
    payload: serde_json::Value,
    owner_worker_id: Option<String>,
    lease_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    attempt_count: i32,
    max_attempts: i32,
    progress: Option<String>,
    cancel_requested: bool,
    result: Option<serde_json::Value>,
    last_error: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row.status.parse().map_err(|reason| StoreError::Corrupt {
            id: row.id,
            reason,
        })?;

        Ok(Job {
            id: row.id,
            status,
            payload: row.payload,
            owner_worker_id: row.owner_worker_id,
            lease_expires_at: row.lease_expires_at,
            attempt_count: row.attempt_count,
            max_attempts: row.max_attempts,
            progress: row.progress,
            cancel_requested: row.cancel_requested,
            result: row.result,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
