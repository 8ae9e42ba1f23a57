//! Pipeline agents
//!
//! The five stages are value-level configurations of one execution contract:
//! a fixed system instruction, fixed generation parameters, a pure prompt
//! builder and a list of required output keys. Validation is lenient: a
//! missing key is logged and never fails the stage.

use crate::llm::invoker::{error_payload, is_raw_text};
use crate::llm::{GenerationParams, ModelInvoker, ModelRequest, ReasoningEffort};
use crate::Result;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub mod prompts;

/// Named context slots shared between the orchestrator and prompt builders
pub mod slots {
    pub const DOCUMENTS_TEXT: &str = "documents_text";
    pub const DOCUMENT_TYPES: &str = "document_types";
    pub const FINANCIAL_DATA: &str = "financial_data";
    pub const CASHFLOW_DATA: &str = "cashflow_data";
    pub const RISK_DATA: &str = "risk_data";
    pub const COMPLIANCE_DATA: &str = "compliance_data";
}

pub const DEFAULT_MAX_DOCUMENT_CHARS: usize = 15_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    FinancialAnalyzer,
    CashFlowForecaster,
    RiskDetector,
    AutomationAgent,
    ExplainabilityAgent,
}

impl AgentKind {
    /// Fixed execution order
    pub const PIPELINE: [AgentKind; 5] = [
        AgentKind::FinancialAnalyzer,
        AgentKind::CashFlowForecaster,
        AgentKind::RiskDetector,
        AgentKind::AutomationAgent,
        AgentKind::ExplainabilityAgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::FinancialAnalyzer => "financial_analyzer",
            AgentKind::CashFlowForecaster => "cash_flow_forecaster",
            AgentKind::RiskDetector => "risk_detector",
            AgentKind::AutomationAgent => "automation_agent",
            AgentKind::ExplainabilityAgent => "explainability_agent",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AgentKind::FinancialAnalyzer => "Financial Analyzer",
            AgentKind::CashFlowForecaster => "Cash Flow Forecaster",
            AgentKind::RiskDetector => "Risk Detector",
            AgentKind::AutomationAgent => "Automation Agent",
            AgentKind::ExplainabilityAgent => "Explainability Agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::PIPELINE
            .into_iter()
            .find(|kind| kind.as_str() == value || kind.display_name() == value)
    }

    pub fn profile(&self) -> &'static AgentProfile {
        match self {
            AgentKind::FinancialAnalyzer => &PROFILES[0],
            AgentKind::CashFlowForecaster => &PROFILES[1],
            AgentKind::RiskDetector => &PROFILES[2],
            AgentKind::AutomationAgent => &PROFILES[3],
            AgentKind::ExplainabilityAgent => &PROFILES[4],
        }
    }

    pub fn from_system_instructions(system: &str) -> Option<Self> {
        Self::PIPELINE
            .into_iter()
            .find(|kind| kind.profile().system_instructions == system)
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Static contract of one agent variant
pub struct AgentProfile {
    pub kind: AgentKind,
    pub system_instructions: &'static str,
    pub params: GenerationParams,
    pub required_keys: &'static [&'static str],
    pub build_prompt: fn(&AgentContext) -> Result<String>,
}

static PROFILES: [AgentProfile; 5] = [
    AgentProfile {
        kind: AgentKind::FinancialAnalyzer,
        system_instructions: prompts::FINANCIAL_ANALYZER_SYSTEM,
        params: GenerationParams {
            temperature: 0.1,
            max_output_tokens: 2000,
            reasoning_effort: ReasoningEffort::Low,
        },
        required_keys: &[
            "revenue",
            "expenses",
            "liabilities",
            "loan_emis",
            "tax_payments",
            "metrics",
        ],
        build_prompt: prompts::financial_analyzer,
    },
    AgentProfile {
        kind: AgentKind::CashFlowForecaster,
        system_instructions: prompts::CASH_FLOW_FORECASTER_SYSTEM,
        params: GenerationParams {
            temperature: 0.3,
            max_output_tokens: 800,
            reasoning_effort: ReasoningEffort::Medium,
        },
        required_keys: &[
            "current_cash_position",
            "monthly_burn_rate",
            "runway_months",
            "forecasts",
            "trends",
            "risk_alerts",
        ],
        build_prompt: prompts::cash_flow_forecaster,
    },
    AgentProfile {
        kind: AgentKind::RiskDetector,
        system_instructions: prompts::RISK_DETECTOR_SYSTEM,
        params: GenerationParams {
            temperature: 0.2,
            max_output_tokens: 2000,
            reasoning_effort: ReasoningEffort::High,
        },
        required_keys: &["risk_score", "risk_level", "risk_factors", "anomalies", "metrics"],
        build_prompt: prompts::risk_detector,
    },
    AgentProfile {
        kind: AgentKind::AutomationAgent,
        system_instructions: prompts::AUTOMATION_AGENT_SYSTEM,
        params: GenerationParams {
            temperature: 0.4,
            max_output_tokens: 800,
            reasoning_effort: ReasoningEffort::Low,
        },
        required_keys: &[
            "upcoming_deadlines",
            "compliance_issues",
            "automation_suggestions",
            "draft_emails",
        ],
        build_prompt: prompts::automation_agent,
    },
    AgentProfile {
        kind: AgentKind::ExplainabilityAgent,
        system_instructions: prompts::EXPLAINABILITY_AGENT_SYSTEM,
        params: GenerationParams {
            temperature: 0.5,
            max_output_tokens: 3000,
            reasoning_effort: ReasoningEffort::Medium,
        },
        required_keys: &[
            "executive_summary",
            "loan_readiness_score",
            "loan_analysis",
            "recommended_actions",
            "key_insights",
            "plain_language_metrics",
        ],
        build_prompt: prompts::explainability_agent,
    },
];

//
// ================= Context =================
//

/// Transient input to one agent call: named slots of structured data
#[derive(Debug, Clone, PartialEq)]
pub struct AgentContext {
    slots: Map<String, Value>,
    as_of: NaiveDate,
    max_document_chars: usize,
}

impl AgentContext {
    pub fn new() -> Self {
        Self {
            slots: Map::new(),
            as_of: Utc::now().date_naive(),
            max_document_chars: DEFAULT_MAX_DOCUMENT_CHARS,
        }
    }

    pub fn with(mut self, slot: &str, value: Value) -> Self {
        self.slots.insert(slot.to_string(), value);
        self
    }

    pub fn with_as_of(mut self, as_of: NaiveDate) -> Self {
        self.as_of = as_of;
        self
    }

    pub fn with_document_limit(mut self, max_document_chars: usize) -> Self {
        self.max_document_chars = max_document_chars;
        self
    }

    pub fn get(&self, slot: &str) -> Option<&Value> {
        self.slots.get(slot)
    }

    pub fn slots(&self) -> &Map<String, Value> {
        &self.slots
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    pub fn max_document_chars(&self) -> usize {
        self.max_document_chars
    }
}

impl Default for AgentContext {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Execution =================
//

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub output: Value,
    pub execution_time_ms: u64,
}

/// One stage bound to the shared invoker
pub struct Agent {
    profile: &'static AgentProfile,
    invoker: Arc<ModelInvoker>,
}

impl Agent {
    pub fn new(kind: AgentKind, invoker: Arc<ModelInvoker>) -> Self {
        Self {
            profile: kind.profile(),
            invoker,
        }
    }

    pub fn kind(&self) -> AgentKind {
        self.profile.kind
    }

    /// Build prompt → invoke → validate. Never fails: errors become
    /// an `{"error": ...}` output timed up to the failure point.
    pub async fn execute(&self, context: &AgentContext) -> AgentOutcome {
        let start = Instant::now();
        let agent = self.profile.kind;

        info!(agent = %agent, "Starting agent execution");

        let prompt = match (self.profile.build_prompt)(context) {
            Ok(prompt) => prompt,
            Err(e) => {
                let execution_time_ms = start.elapsed().as_millis() as u64;
                error!(agent = %agent, error = %e, "Agent failed");
                return AgentOutcome {
                    output: error_payload(e.to_string()),
                    execution_time_ms,
                };
            }
        };

        let request = ModelRequest::new(
            prompt,
            self.profile.system_instructions,
            self.profile.params,
        );
        let output = self.invoker.invoke(&request).await;
        let execution_time_ms = start.elapsed().as_millis() as u64;

        if !validate(agent, &output) {
            warn!(agent = %agent, "Output validation failed");
        }

        info!(agent = %agent, execution_time_ms, "Agent completed");

        AgentOutcome {
            output,
            execution_time_ms,
        }
    }
}

/// Diagnostic only. Logs every missing required key; the result is
/// never used to gate the pipeline.
pub fn validate(kind: AgentKind, output: &Value) -> bool {
    if let Some(err) = output.get("error") {
        error!(agent = %kind, error = %err, "Agent returned error");
        return false;
    }

    if is_raw_text(output) {
        warn!(agent = %kind, "Agent returned unstructured text");
        return false;
    }

    for key in missing_keys(kind, output) {
        warn!(agent = %kind, key, "Missing required key in output");
    }

    true
}

pub fn missing_keys(kind: AgentKind, output: &Value) -> Vec<&'static str> {
    kind.profile()
        .required_keys
        .iter()
        .copied()
        .filter(|key| output.get(*key).is_none())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockProvider, ProviderError};
    use serde_json::json;
    use std::time::Duration;

    fn agent(kind: AgentKind, provider: Arc<MockProvider>) -> Agent {
        let invoker = Arc::new(ModelInvoker::new(provider, 3, Duration::from_millis(1)));
        Agent::new(kind, invoker)
    }

    #[test]
    fn test_profile_table_matches_kinds() {
        for kind in AgentKind::PIPELINE {
            assert_eq!(kind.profile().kind, kind);
            assert_eq!(
                AgentKind::from_system_instructions(kind.profile().system_instructions),
                Some(kind)
            );
            assert_eq!(AgentKind::parse(kind.as_str()), Some(kind));
            assert_eq!(AgentKind::parse(kind.display_name()), Some(kind));
        }
    }

    #[test]
    fn test_generation_parameters() {
        let risk = AgentKind::RiskDetector.profile().params;
        assert_eq!(risk.temperature, 0.2);
        assert_eq!(risk.max_output_tokens, 2000);
        assert_eq!(risk.reasoning_effort, ReasoningEffort::High);

        let explain = AgentKind::ExplainabilityAgent.profile().params;
        assert_eq!(explain.max_output_tokens, 3000);
        assert_eq!(explain.temperature, 0.5);
    }

    #[test]
    fn test_validation_is_lenient() {
        let partial = json!({"risk_score": 10});
        assert!(validate(AgentKind::RiskDetector, &partial));
        assert_eq!(
            missing_keys(AgentKind::RiskDetector, &partial),
            vec!["risk_level", "risk_factors", "anomalies", "metrics"]
        );

        let complete = json!({
            "risk_score": 10,
            "risk_level": "low",
            "risk_factors": [],
            "anomalies": [],
            "metrics": {}
        });
        assert!(validate(AgentKind::RiskDetector, &complete));
        assert!(missing_keys(AgentKind::RiskDetector, &complete).is_empty());

        assert!(!validate(AgentKind::RiskDetector, &json!({"error": "boom"})));
        assert!(!validate(
            AgentKind::RiskDetector,
            &json!({"response": "text", "raw_text": true})
        ));
    }

    #[tokio::test]
    async fn test_execute_sends_fixed_instructions_and_params() {
        let provider = Arc::new(MockProvider::from_fn(|_, _| {
            Ok(r#"{"upcoming_deadlines": []}"#.to_string())
        }));
        let agent = agent(AgentKind::AutomationAgent, provider.clone());

        let context = AgentContext::new().with(slots::FINANCIAL_DATA, json!({"revenue": {"total": 5}}));
        let outcome = agent.execute(&context).await;

        // Missing keys only warn
        assert_eq!(outcome.output, json!({"upcoming_deadlines": []}));

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system_instructions, prompts::AUTOMATION_AGENT_SYSTEM);
        assert_eq!(requests[0].params.temperature, 0.4);
        assert_eq!(requests[0].params.max_output_tokens, 800);
        assert!(requests[0].prompt.contains("\"total\": 5"));
    }

    #[tokio::test]
    async fn test_invoker_error_passes_through_unchanged() {
        let provider = Arc::new(MockProvider::from_fn(|_, _| {
            Err(ProviderError::permanent("AccessDenied", "no access"))
        }));
        let agent = agent(AgentKind::CashFlowForecaster, provider.clone());

        let outcome = agent.execute(&AgentContext::new()).await;

        assert_eq!(outcome.output, json!({"error": "AccessDenied: no access"}));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_prompt_failure_becomes_error_output() {
        let provider = Arc::new(MockProvider::from_fn(|_, _| Ok("{}".to_string())));
        let agent = agent(AgentKind::FinancialAnalyzer, provider.clone());

        let context = AgentContext::new().with(slots::DOCUMENT_TYPES, json!("not-a-list"));
        let outcome = agent.execute(&context).await;

        assert!(outcome.output["error"]
            .as_str()
            .unwrap()
            .contains("document_types"));
        assert_eq!(provider.call_count(), 0);
    }
}
