//! Postgres-backed run store

use crate::agents::AgentKind;
use crate::error::PipelineError;
use crate::models::{Report, ReportSections, Run, RunPage, RunQuery, RunStatus, RunSummary, StageResult};
use crate::store::RunStore;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

pub struct PgRunStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgRunStore {
    /// Pool connects on first query; the schema is created on first use
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
            .map_err(|e| db_error("Failed to configure postgres pool", e))?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        let pool = &self.pool;

        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS analysis_runs (
                      run_id UUID PRIMARY KEY,
                      owner_id UUID NOT NULL,
                      document_ids UUID[] NOT NULL DEFAULT '{}',
                      status TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      completed_at TIMESTAMPTZ,
                      error_message TEXT,
                      corpus_digest TEXT
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_analysis_runs_owner_time
                    ON analysis_runs (owner_id, created_at DESC);
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS stage_results (
                      result_id UUID PRIMARY KEY,
                      run_id UUID NOT NULL REFERENCES analysis_runs (run_id),
                      agent TEXT NOT NULL,
                      output JSONB NOT NULL,
                      execution_time_ms BIGINT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      seq BIGSERIAL
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS reports (
                      report_id UUID PRIMARY KEY,
                      run_id UUID NOT NULL UNIQUE REFERENCES analysis_runs (run_id),
                      sections JSONB NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| db_error("Failed to initialize run store schema", e))?;

        Ok(())
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create_run(&self, run: &Run) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO analysis_runs
              (run_id, owner_id, document_ids, status, created_at, completed_at, error_message, corpus_digest)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(run.run_id)
        .bind(run.owner_id)
        .bind(&run.document_ids)
        .bind(run.status.as_str())
        .bind(run.created_at)
        .bind(run.completed_at)
        .bind(&run.error_message)
        .bind(&run.corpus_digest)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert run", e))?;

        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT run_id, owner_id, document_ids, status, created_at, completed_at, error_message, corpus_digest
            FROM analysis_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load run", e))?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        self.ensure_schema().await?;

        let updated = sqlx::query(
            r#"
            UPDATE analysis_runs
            SET document_ids = $2, status = $3, completed_at = $4, error_message = $5, corpus_digest = $6
            WHERE run_id = $1
            "#,
        )
        .bind(run.run_id)
        .bind(&run.document_ids)
        .bind(run.status.as_str())
        .bind(run.completed_at)
        .bind(&run.error_message)
        .bind(&run.corpus_digest)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update run", e))?;

        if updated.rows_affected() == 0 {
            return Err(PipelineError::RunNotFound(run.run_id));
        }

        Ok(())
    }

    async fn append_stage_result(&self, result: &StageResult) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO stage_results
              (result_id, run_id, agent, output, execution_time_ms, created_at)
            VALUES
              ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(result.result_id)
        .bind(result.run_id)
        .bind(result.agent.as_str())
        .bind(&result.output)
        .bind(result.execution_time_ms as i64)
        .bind(result.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert stage result", e))?;

        Ok(())
    }

    async fn stage_results(&self, run_id: Uuid) -> Result<Vec<StageResult>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT result_id, run_id, agent, output, execution_time_ms, created_at
            FROM stage_results
            WHERE run_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load stage results", e))?;

        rows.iter().map(stage_result_from_row).collect()
    }

    async fn save_report(&self, report: &Report) -> Result<()> {
        self.ensure_schema().await?;

        let sections = serde_json::to_value(&report.sections)?;

        sqlx::query(
            r#"
            INSERT INTO reports (report_id, run_id, sections, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(report.report_id)
        .bind(report.run_id)
        .bind(sections)
        .bind(report.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                PipelineError::StateError(format!(
                    "Report already exists for run {}",
                    report.run_id
                ))
            } else {
                db_error("Failed to insert report", e)
            }
        })?;

        Ok(())
    }

    async fn get_report(&self, run_id: Uuid) -> Result<Option<Report>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT report_id, run_id, sections, created_at
            FROM reports
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load report", e))?;

        row.as_ref().map(report_from_row).transpose()
    }

    async fn list_runs(&self, owner_id: Uuid, query: &RunQuery) -> Result<RunPage> {
        self.ensure_schema().await?;

        let query = query.normalized();
        let status = query.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM analysis_runs
            WHERE owner_id = $1 AND ($2::TEXT IS NULL OR status = $2)
            "#,
        )
        .bind(owner_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to count runs", e))?;

        let rows = sqlx::query(
            r#"
            SELECT run_id, owner_id, document_ids, status, created_at, completed_at, error_message, corpus_digest
            FROM analysis_runs
            WHERE owner_id = $1 AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(owner_id)
        .bind(status)
        .bind(query.limit as i64)
        .bind(query.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list runs", e))?;

        let runs = rows
            .iter()
            .map(|row| run_from_row(row).map(|run| RunSummary::from(&run)))
            .collect::<Result<Vec<_>>>()?;

        Ok(RunPage {
            runs,
            total: total.max(0) as usize,
            page: query.page,
            limit: query.limit,
        })
    }
}

fn db_error(context: &str, error: sqlx::Error) -> PipelineError {
    PipelineError::DatabaseError(format!("{}: {}", context, error))
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| code == UNIQUE_VIOLATION)
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| db_error(&format!("Failed to decode column '{}'", name), e))
}

fn run_from_row(row: &PgRow) -> Result<Run> {
    let status: String = column(row, "status")?;
    let status = RunStatus::parse(&status).ok_or_else(|| {
        PipelineError::DatabaseError(format!("Unknown run status '{}'", status))
    })?;

    Ok(Run {
        run_id: column(row, "run_id")?,
        owner_id: column(row, "owner_id")?,
        document_ids: column::<Vec<Uuid>>(row, "document_ids")?,
        status,
        created_at: column::<DateTime<Utc>>(row, "created_at")?,
        completed_at: column::<Option<DateTime<Utc>>>(row, "completed_at")?,
        error_message: column(row, "error_message")?,
        corpus_digest: column(row, "corpus_digest")?,
    })
}

fn stage_result_from_row(row: &PgRow) -> Result<StageResult> {
    let agent: String = column(row, "agent")?;
    let agent = AgentKind::parse(&agent).ok_or_else(|| {
        PipelineError::DatabaseError(format!("Unknown agent '{}'", agent))
    })?;
    let execution_time_ms: i64 = column(row, "execution_time_ms")?;

    Ok(StageResult {
        result_id: column(row, "result_id")?,
        run_id: column(row, "run_id")?,
        agent,
        output: column::<Value>(row, "output")?,
        execution_time_ms: execution_time_ms.max(0) as u64,
        created_at: column(row, "created_at")?,
    })
}

fn report_from_row(row: &PgRow) -> Result<Report> {
    let sections: Value = column(row, "sections")?;
    let sections: ReportSections = serde_json::from_value(sections)?;

    Ok(Report {
        report_id: column(row, "report_id")?,
        run_id: column(row, "run_id")?,
        sections,
        created_at: column(row, "created_at")?,
    })
}
