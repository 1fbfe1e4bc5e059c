//! Async report job tickets.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use model::{ReportFilters, ReportJob, ReportMetrics};
use postgres_types::Json;
use uuid::Uuid;

use crate::{RepositoryError, decode, text};

#[async_trait]
pub trait ReportJobsRepository: Send + Sync {
    async fn insert(&self, job: &ReportJob) -> Result<(), RepositoryError>;
    async fn get(&self, id: Uuid) -> Result<Option<ReportJob>, RepositoryError>;
    async fn update(&self, job: &ReportJob) -> Result<(), RepositoryError>;
}

/// PostgreSQL implementation of the ReportJobsRepository trait.
pub struct PgReportJobsRepository {
    pool: Pool,
}

impl PgReportJobsRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReportJobsRepository for PgReportJobsRepository {
    async fn insert(&self, job: &ReportJob) -> Result<(), RepositoryError> {
        let query = r#"
            INSERT INTO report_jobs (id, user_id, status, filters, result, error_message, created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#;
        let client = self.pool.get().await?;
        client.execute(query, &[
            &job.id,
            &job.user_id,
            &text(&job.status),
            &Json(&job.filters),
            &job.result.as_ref().map(Json),
            &job.error_message,
            &job.created_at,
            &job.updated_at,
            &job.completed_at,
        ]).await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ReportJob>, RepositoryError> {
        let client = self.pool.get().await?;
        let Some(row) = client.query_opt("SELECT * FROM report_jobs WHERE id = $1", &[&id]).await? else {
            return Ok(None);
        };
        let status: String = row.get("status");
        let Json(filters): Json<ReportFilters> = row.get("filters");
        let result: Option<Json<ReportMetrics>> = row.get("result");
        Ok(Some(ReportJob {
            id: row.get("id"),
            user_id: row.get("user_id"),
            status: decode("report_jobs.status", &status)?,
            filters,
            result: result.map(|Json(m)| m),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            completed_at: row.get("completed_at"),
        }))
    }

    async fn update(&self, job: &ReportJob) -> Result<(), RepositoryError> {
        let query = r#"
            UPDATE report_jobs SET status = $2, result = $3, error_message = $4, updated_at = $5, completed_at = $6
            WHERE id = $1
        "#;
        let client = self.pool.get().await?;
        let updated = client.execute(query, &[
            &job.id,
            &text(&job.status),
            &job.result.as_ref().map(Json),
            &job.error_message,
            &job.updated_at,
            &job.completed_at,
        ]).await?;
        if updated == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}
