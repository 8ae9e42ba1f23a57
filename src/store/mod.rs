//! Durable run store
//!
//! Runs are saved last-write-wins, stage results are append-only and a run
//! has at most one report. In-memory for development; Postgres when a
//! database URL is configured.

use crate::config::Settings;
use crate::error::PipelineError;
use crate::models::{Report, Run, RunPage, RunQuery, RunSummary, StageResult};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub mod postgres;

pub use postgres::PgRunStore;

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &Run) -> Result<()>;
    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>>;
    /// Overwrites the stored status, timestamps, error and resolved inputs
    async fn update_run(&self, run: &Run) -> Result<()>;
    async fn append_stage_result(&self, result: &StageResult) -> Result<()>;
    /// In append order
    async fn stage_results(&self, run_id: Uuid) -> Result<Vec<StageResult>>;
    async fn save_report(&self, report: &Report) -> Result<()>;
    async fn get_report(&self, run_id: Uuid) -> Result<Option<Report>>;
    /// Newest first
    async fn list_runs(&self, owner_id: Uuid, query: &RunQuery) -> Result<RunPage>;
}

/// In-memory store for development
pub struct InMemoryRunStore {
    runs: Arc<RwLock<HashMap<Uuid, Run>>>,
    stage_results: Arc<RwLock<HashMap<Uuid, Vec<StageResult>>>>,
    reports: Arc<RwLock<HashMap<Uuid, Report>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            stage_results: Arc::new(RwLock::new(HashMap::new())),
            reports: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn ensure_run(&self, run_id: Uuid) -> Result<()> {
        let runs = self.runs.read().await;
        if runs.contains_key(&run_id) {
            Ok(())
        } else {
            Err(PipelineError::RunNotFound(run_id))
        }
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: &Run) -> Result<()> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.run_id) {
            return Err(PipelineError::StateError(format!(
                "Run {} already exists",
                run.run_id
            )));
        }
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let runs = self.runs.read().await;
        Ok(runs.get(&run_id).cloned())
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(&run.run_id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(PipelineError::RunNotFound(run.run_id)),
        }
    }

    async fn append_stage_result(&self, result: &StageResult) -> Result<()> {
        self.ensure_run(result.run_id).await?;

        let mut results = self.stage_results.write().await;
        results
            .entry(result.run_id)
            .or_insert_with(Vec::new)
            .push(result.clone());
        Ok(())
    }

    async fn stage_results(&self, run_id: Uuid) -> Result<Vec<StageResult>> {
        let results = self.stage_results.read().await;
        Ok(results.get(&run_id).cloned().unwrap_or_default())
    }

    async fn save_report(&self, report: &Report) -> Result<()> {
        self.ensure_run(report.run_id).await?;

        let mut reports = self.reports.write().await;
        if reports.contains_key(&report.run_id) {
            return Err(PipelineError::StateError(format!(
                "Report already exists for run {}",
                report.run_id
            )));
        }
        reports.insert(report.run_id, report.clone());
        Ok(())
    }

    async fn get_report(&self, run_id: Uuid) -> Result<Option<Report>> {
        let reports = self.reports.read().await;
        Ok(reports.get(&run_id).cloned())
    }

    async fn list_runs(&self, owner_id: Uuid, query: &RunQuery) -> Result<RunPage> {
        let query = query.normalized();
        let runs = self.runs.read().await;

        let mut matching: Vec<&Run> = runs
            .values()
            .filter(|run| run.owner_id == owner_id)
            .filter(|run| query.status.map_or(true, |status| run.status == status))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(query.offset())
            .take(query.limit as usize)
            .map(RunSummary::from)
            .collect();

        Ok(RunPage {
            runs: page,
            total,
            page: query.page,
            limit: query.limit,
        })
    }
}

/// Postgres when a database URL is configured, memory otherwise
pub fn build_store(settings: &Settings) -> Arc<dyn RunStore> {
    if let Some(url) = settings.database_url.as_deref() {
        match PgRunStore::connect_lazy(url) {
            Ok(store) => {
                info!("Run store backend: postgres");
                return Arc::new(store);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres run store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Run store backend: in-memory");
    Arc::new(InMemoryRunStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentKind;
    use crate::models::{ReportSections, RunStatus};
    use chrono::Duration;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn sections() -> ReportSections {
        ReportSections {
            financial_health: json!({}),
            cash_flow_forecast: json!({}),
            risk_alerts: json!({}),
            compliance_automation: json!({}),
            loan_readiness_score: json!(0),
            recommended_actions: json!({}),
        }
    }

    #[tokio::test]
    async fn test_run_roundtrip_and_update() {
        let store = InMemoryRunStore::new();
        let mut run = Run::new(Uuid::new_v4(), vec![]);

        assert_ok!(store.create_run(&run).await);
        assert_err!(store.create_run(&run).await);

        run.mark_running().unwrap();
        run.mark_failed("No documents found").unwrap();
        assert_ok!(store.update_run(&run).await);

        let stored = store.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("No documents found"));
    }

    #[tokio::test]
    async fn test_update_unknown_run() {
        let store = InMemoryRunStore::new();
        let run = Run::new(Uuid::new_v4(), vec![]);

        let err = store.update_run(&run).await.unwrap_err();
        assert!(matches!(err, PipelineError::RunNotFound(id) if id == run.run_id));
    }

    #[tokio::test]
    async fn test_stage_results_are_append_only_in_order() {
        let store = InMemoryRunStore::new();
        let run = Run::new(Uuid::new_v4(), vec![]);
        store.create_run(&run).await.unwrap();

        for (i, kind) in AgentKind::PIPELINE.into_iter().enumerate() {
            let result = StageResult::new(run.run_id, kind, json!({"step": i}), 10);
            store.append_stage_result(&result).await.unwrap();
        }

        let results = store.stage_results(run.run_id).await.unwrap();
        let kinds: Vec<AgentKind> = results.iter().map(|r| r.agent).collect();
        assert_eq!(kinds, AgentKind::PIPELINE.to_vec());

        let orphan = StageResult::new(Uuid::new_v4(), AgentKind::RiskDetector, json!({}), 1);
        assert_err!(store.append_stage_result(&orphan).await);
    }

    #[tokio::test]
    async fn test_single_report_per_run() {
        let store = InMemoryRunStore::new();
        let run = Run::new(Uuid::new_v4(), vec![]);
        store.create_run(&run).await.unwrap();

        store.save_report(&Report::new(run.run_id, sections())).await.unwrap();
        let err = store
            .save_report(&Report::new(run.run_id, sections()))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::StateError(_)));
        assert!(store.get_report(run.run_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_runs_pages_newest_first() {
        let store = InMemoryRunStore::new();
        let owner = Uuid::new_v4();
        let base = chrono::Utc::now();

        let mut ids = Vec::new();
        for i in 0..5 {
            let mut run = Run::new(owner, vec![Uuid::new_v4(); i]);
            run.created_at = base + Duration::seconds(i as i64);
            if i % 2 == 0 {
                run.mark_running().unwrap();
            }
            store.create_run(&run).await.unwrap();
            ids.push(run.run_id);
        }
        store.create_run(&Run::new(Uuid::new_v4(), vec![])).await.unwrap();

        let page = store
            .list_runs(owner, &RunQuery { status: None, page: 1, limit: 2 })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.runs.len(), 2);
        assert_eq!(page.runs[0].run_id, ids[4]);
        assert_eq!(page.runs[0].document_count, 4);

        let last = store
            .list_runs(owner, &RunQuery { status: None, page: 3, limit: 2 })
            .await
            .unwrap();
        assert_eq!(last.runs.len(), 1);
        assert_eq!(last.runs[0].run_id, ids[0]);

        let running = store
            .list_runs(
                owner,
                &RunQuery {
                    status: Some(RunStatus::Running),
                    page: 0,
                    limit: 500,
                },
            )
            .await
            .unwrap();
        assert_eq!(running.total, 3);
        assert_eq!(running.page, 1);
        assert_eq!(running.limit, 100);
    }

    #[tokio::test]
    async fn test_build_store_without_database_url_uses_memory() {
        let store = build_store(&Settings::default());
        let run = Run::new(Uuid::new_v4(), vec![]);

        store.create_run(&run).await.unwrap();
        assert!(store.get_run(run.run_id).await.unwrap().is_some());
    }
}
