//! Pipeline orchestrator
//!
//! Drives one run through the five agents in a fixed order:
//! resolve documents → build corpus → stages 1..5 → report.
//!
//! Every stage result is persisted as soon as it exists, including
//! error-bearing ones; only a missing corpus or an `Err` from a
//! collaborator fails the run.

use crate::agents::{slots, Agent, AgentContext, AgentKind};
use crate::config::Settings;
use crate::documents::DocumentSource;
use crate::error::PipelineError;
use crate::llm::ModelInvoker;
use crate::models::{
    Report, ReportSections, Run, RunPage, RunQuery, RunStatus, RunView, StageResult,
};
use crate::store::RunStore;
use crate::Result;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const PANIC_MESSAGE: &str = "pipeline task panicked";

/// Combined input to the first stage
#[derive(Debug, Clone, PartialEq)]
pub struct Corpus {
    pub text: String,
    pub document_types: Vec<String>,
    pub document_ids: Vec<Uuid>,
}

/// A freshly created run and the supervisor driving it
pub struct StartedRun {
    pub run: Run,
    pub handle: JoinHandle<()>,
}

pub struct Pipeline {
    store: Arc<dyn RunStore>,
    documents: Arc<dyn DocumentSource>,
    agents: Vec<Agent>,
    max_document_chars: usize,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn RunStore>,
        documents: Arc<dyn DocumentSource>,
        invoker: Arc<ModelInvoker>,
        settings: &Settings,
    ) -> Self {
        let agents = AgentKind::PIPELINE
            .into_iter()
            .map(|kind| Agent::new(kind, Arc::clone(&invoker)))
            .collect();

        Self {
            store,
            documents,
            agents,
            max_document_chars: settings.max_document_chars,
        }
    }

    // ===== Entry points =====

    /// Create a pending run and process it in the background.
    /// Each call creates a new run.
    pub async fn start_run(
        self: &Arc<Self>,
        owner_id: Uuid,
        document_ids: Vec<Uuid>,
    ) -> Result<StartedRun> {
        let run = self.create_run(owner_id, document_ids).await?;

        let pipeline = Arc::clone(self);
        let run_id = run.run_id;
        let handle = tokio::spawn(async move { pipeline.supervise(run_id).await });

        Ok(StartedRun { run, handle })
    }

    /// Persist a pending run without processing it
    pub async fn create_run(&self, owner_id: Uuid, document_ids: Vec<Uuid>) -> Result<Run> {
        let run = Run::new(owner_id, document_ids);
        self.store.create_run(&run).await?;

        info!(
            run_id = %run.run_id,
            owner_id = %owner_id,
            requested_documents = run.document_ids.len(),
            "Analysis run created"
        );

        Ok(run)
    }

    /// Run the state machine to a terminal state. Returns the final run;
    /// `Err` only when the run cannot be loaded or its state cannot be saved.
    pub async fn process_run(&self, run_id: Uuid) -> Result<Run> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))?;

        run.mark_running()?;
        self.store.update_run(&run).await?;
        info!(run_id = %run_id, "Starting analysis");

        let outcome = match self.execute(&mut run).await {
            Ok(()) => {
                let mut completed = run.clone();
                completed.mark_completed()?;
                let saved = self.store.update_run(&completed).await;
                saved.map(|_| completed)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(completed) => {
                info!(run_id = %run_id, "Analysis completed");
                Ok(completed)
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Analysis failed");
                run.mark_failed(e.to_string())?;
                self.store.update_run(&run).await?;
                Ok(run)
            }
        }
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<RunView> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))?;

        let report = if run.status == RunStatus::Completed {
            self.store.get_report(run_id).await?.map(|r| r.sections)
        } else {
            None
        };

        Ok(RunView {
            run_id: run.run_id,
            owner_id: run.owner_id,
            status: run.status,
            created_at: run.created_at,
            completed_at: run.completed_at,
            report,
            error: run.error_message,
        })
    }

    pub async fn list_runs(&self, owner_id: Uuid, query: &RunQuery) -> Result<RunPage> {
        self.store.list_runs(owner_id, query).await
    }

    pub async fn stage_results(&self, run_id: Uuid) -> Result<Vec<StageResult>> {
        if self.store.get_run(run_id).await?.is_none() {
            return Err(PipelineError::RunNotFound(run_id));
        }
        self.store.stage_results(run_id).await
    }

    // ===== Supervision =====

    async fn supervise(self: Arc<Self>, run_id: Uuid) {
        let worker = {
            let pipeline = Arc::clone(&self);
            tokio::spawn(async move { pipeline.process_run(run_id).await })
        };

        match worker.await {
            Ok(Ok(run)) => {
                info!(run_id = %run_id, status = %run.status, "Pipeline task finished");
            }
            Ok(Err(e)) => {
                error!(run_id = %run_id, error = %e, "Pipeline task could not record its outcome");
            }
            Err(join_error) => {
                error!(run_id = %run_id, error = %join_error, "Pipeline task aborted");
                let message = if join_error.is_panic() {
                    PANIC_MESSAGE
                } else {
                    "pipeline task cancelled"
                };
                self.fail_unfinished(run_id, message).await;
            }
        }
    }

    async fn fail_unfinished(&self, run_id: Uuid, message: &str) {
        let mut run = match self.store.get_run(run_id).await {
            Ok(Some(run)) if !run.status.is_terminal() => run,
            Ok(_) => return,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to load run after abort");
                return;
            }
        };

        let marked = match run.status {
            RunStatus::Pending => run.mark_running().and_then(|_| run.mark_failed(message)),
            _ => run.mark_failed(message),
        };

        if let Err(e) = marked {
            warn!(run_id = %run_id, error = %e, "Could not mark aborted run as failed");
            return;
        }

        if let Err(e) = self.store.update_run(&run).await {
            error!(run_id = %run_id, error = %e, "Failed to persist aborted run");
        }
    }

    // ===== Steps =====

    async fn execute(&self, run: &mut Run) -> Result<()> {
        let corpus = self.build_corpus(run.owner_id, &run.document_ids).await?;

        run.document_ids = corpus.document_ids.clone();
        run.corpus_digest = Some(corpus_digest(&corpus.text));
        self.store.update_run(run).await?;

        let mut outputs: HashMap<AgentKind, Value> = HashMap::new();

        for (index, agent) in self.agents.iter().enumerate() {
            let kind = agent.kind();
            info!(
                run_id = %run.run_id,
                stage = index + 1,
                agent = %kind,
                "Executing agent"
            );

            let context = stage_context(kind, &outputs, &corpus, self.max_document_chars)?;
            let outcome = agent.execute(&context).await;

            let result = StageResult::new(
                run.run_id,
                kind,
                outcome.output.clone(),
                outcome.execution_time_ms,
            );
            self.store.append_stage_result(&result).await?;

            if result.is_error() {
                warn!(run_id = %run.run_id, agent = %kind, "Stage produced an error output, continuing");
            }

            outputs.insert(kind, outcome.output);
        }

        let report = Report::new(run.run_id, report_sections(&outputs)?);
        self.store.save_report(&report).await?;
        info!(
            run_id = %run.run_id,
            score = ?report.loan_readiness_score(),
            "Report saved"
        );

        Ok(())
    }

    /// Resolve and extract. Unreadable or blank documents are skipped.
    async fn build_corpus(&self, owner_id: Uuid, requested: &[Uuid]) -> Result<Corpus> {
        let documents = self.documents.resolve(owner_id, requested).await?;
        if documents.is_empty() {
            return Err(PipelineError::NoDocuments);
        }

        let mut texts = Vec::new();
        let mut document_types = Vec::new();

        for document in &documents {
            match self.documents.extract_text(document).await {
                Ok(text) if text.trim().is_empty() => {
                    warn!(document_id = %document.document_id, "Document produced no text, skipping");
                }
                Ok(text) => {
                    texts.push(text);
                    document_types.push(document.type_label().to_string());
                }
                Err(e) => {
                    warn!(
                        document_id = %document.document_id,
                        filename = %document.filename,
                        error = %e,
                        "Document parsing failed, skipping"
                    );
                }
            }
        }

        if texts.is_empty() {
            return Err(PipelineError::NoTextExtracted);
        }

        Ok(Corpus {
            text: texts.join("\n\n"),
            document_types,
            document_ids: documents.iter().map(|d| d.document_id).collect(),
        })
    }
}

/// Input context of one stage. Upstream outputs are passed as-is.
pub fn stage_context(
    kind: AgentKind,
    outputs: &HashMap<AgentKind, Value>,
    corpus: &Corpus,
    max_document_chars: usize,
) -> Result<AgentContext> {
    let upstream = |source: AgentKind| {
        outputs.get(&source).cloned().ok_or_else(|| {
            PipelineError::ExecutionError(format!(
                "{} output missing before {}",
                source, kind
            ))
        })
    };

    let context = AgentContext::new().with_document_limit(max_document_chars);

    let context = match kind {
        AgentKind::FinancialAnalyzer => context
            .with(slots::DOCUMENTS_TEXT, json!(corpus.text))
            .with(slots::DOCUMENT_TYPES, json!(corpus.document_types)),
        AgentKind::CashFlowForecaster => context
            .with(slots::FINANCIAL_DATA, upstream(AgentKind::FinancialAnalyzer)?),
        AgentKind::RiskDetector => context
            .with(slots::FINANCIAL_DATA, upstream(AgentKind::FinancialAnalyzer)?)
            .with(slots::CASHFLOW_DATA, upstream(AgentKind::CashFlowForecaster)?),
        AgentKind::AutomationAgent => context
            .with(slots::FINANCIAL_DATA, upstream(AgentKind::FinancialAnalyzer)?),
        AgentKind::ExplainabilityAgent => context
            .with(slots::FINANCIAL_DATA, upstream(AgentKind::FinancialAnalyzer)?)
            .with(slots::CASHFLOW_DATA, upstream(AgentKind::CashFlowForecaster)?)
            .with(slots::RISK_DATA, upstream(AgentKind::RiskDetector)?)
            .with(slots::COMPLIANCE_DATA, upstream(AgentKind::AutomationAgent)?),
    };

    Ok(context)
}

/// Six report sections; the score is denormalized from the final stage (0 when absent)
pub fn report_sections(outputs: &HashMap<AgentKind, Value>) -> Result<ReportSections> {
    let stage = |kind: AgentKind| {
        outputs.get(&kind).cloned().ok_or_else(|| {
            PipelineError::ExecutionError(format!("{} output missing from report", kind))
        })
    };

    let explanation = stage(AgentKind::ExplainabilityAgent)?;
    let loan_readiness_score = explanation
        .get("loan_readiness_score")
        .cloned()
        .unwrap_or_else(|| json!(0));

    Ok(ReportSections {
        financial_health: stage(AgentKind::FinancialAnalyzer)?,
        cash_flow_forecast: stage(AgentKind::CashFlowForecaster)?,
        risk_alerts: stage(AgentKind::RiskDetector)?,
        compliance_automation: stage(AgentKind::AutomationAgent)?,
        loan_readiness_score,
        recommended_actions: explanation,
    })
}

/// Hex SHA-256 of the combined corpus
pub fn corpus_digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}
