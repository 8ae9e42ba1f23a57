//! Core data models for the report pipeline

use crate::agents::AgentKind;
use crate::error::PipelineError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

//
// ================= Run =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// pending → running → {completed | failed}; nothing leaves a terminal state.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "pending" => Some(RunStatus::Pending),
            "running" | "processing" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of the five-stage pipeline over a document set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub owner_id: Uuid,
    pub document_ids: Vec<Uuid>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Hex SHA-256 of the combined corpus fed to the first stage
    #[serde(default)]
    pub corpus_digest: Option<String>,
}

impl Run {
    pub fn new(owner_id: Uuid, document_ids: Vec<Uuid>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            owner_id,
            document_ids,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
            corpus_digest: None,
        }
    }

    fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(RunStatus::Running)
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        self.transition(RunStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(RunStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(message.into());
        Ok(())
    }
}

//
// ================= Stage Result =================
//

/// Persisted output of one agent within one run. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub result_id: Uuid,
    pub run_id: Uuid,
    pub agent: AgentKind,
    pub output: Value,
    pub execution_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl StageResult {
    pub fn new(run_id: Uuid, agent: AgentKind, output: Value, execution_time_ms: u64) -> Self {
        Self {
            result_id: Uuid::new_v4(),
            run_id,
            agent,
            output,
            execution_time_ms,
            created_at: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.output.get("error").is_some()
    }
}

//
// ================= Report =================
//

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSections {
    #[serde(rename = "section_1_financial_health")]
    pub financial_health: Value,
    #[serde(rename = "section_2_cash_flow_forecast")]
    pub cash_flow_forecast: Value,
    #[serde(rename = "section_3_risk_alerts")]
    pub risk_alerts: Value,
    #[serde(rename = "section_4_compliance_automation")]
    pub compliance_automation: Value,
    #[serde(rename = "section_5_loan_readiness_score")]
    pub loan_readiness_score: Value,
    #[serde(rename = "section_6_recommended_actions")]
    pub recommended_actions: Value,
}

/// Aggregated synthesis of all stage outputs (at most one per run)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub report_id: Uuid,
    pub run_id: Uuid,
    pub sections: ReportSections,
    pub created_at: DateTime<Utc>,
}

impl Report {
    pub fn new(run_id: Uuid, sections: ReportSections) -> Self {
        Self {
            report_id: Uuid::new_v4(),
            run_id,
            sections,
            created_at: Utc::now(),
        }
    }

    pub fn loan_readiness_score(&self) -> Option<f64> {
        self.sections.loan_readiness_score.as_f64()
    }
}

//
// ================= Read Models =================
//

/// What collaborators see when polling a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunView {
    pub run_id: Uuid,
    pub owner_id: Uuid,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub report: Option<ReportSections>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub owner_id: Uuid,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub document_count: usize,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id,
            owner_id: run.owner_id,
            status: run.status,
            created_at: run.created_at,
            completed_at: run.completed_at,
            document_count: run.document_ids.len(),
        }
    }
}

pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunQuery {
    pub status: Option<RunStatus>,
    pub page: u32,
    pub limit: u32,
}

impl RunQuery {
    /// Page is 1-based; limit is clamped to 1..=100
    pub fn normalized(self) -> Self {
        Self {
            status: self.status,
            page: self.page.max(1),
            limit: self.limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }
}

impl Default for RunQuery {
    fn default() -> Self {
        Self {
            status: None,
            page: 1,
            limit: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPage {
    pub runs: Vec<RunSummary>,
    pub total: usize,
    pub page: u32,
    pub limit: u32,
}
