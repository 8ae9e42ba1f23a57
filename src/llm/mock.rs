//! Mock provider for development & testing
//! Keeps the pipeline functional without a model endpoint

use crate::agents::AgentKind;
use crate::llm::{ModelProvider, ModelRequest, ProviderError};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;

type Responder = Box<dyn Fn(&ModelRequest, usize) -> Result<String, ProviderError> + Send + Sync>;

enum Behaviour {
    Scripted(Mutex<VecDeque<Result<String, ProviderError>>>),
    Responder(Responder),
}

pub struct MockProvider {
    behaviour: Behaviour,
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockProvider {
    /// Replies are consumed in order; an exhausted script is a permanent error
    pub fn scripted(replies: Vec<Result<String, ProviderError>>) -> Self {
        Self::with_behaviour(Behaviour::Scripted(Mutex::new(replies.into())))
    }

    /// Reply computed from the request and the 0-based call index
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&ModelRequest, usize) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        Self::with_behaviour(Behaviour::Responder(Box::new(responder)))
    }

    /// Plausible canned output for every agent, recognised by its system text
    pub fn offline() -> Self {
        Self::from_fn(|request, _| {
            AgentKind::from_system_instructions(&request.system_instructions)
                .map(|kind| canned_reply(kind).to_string())
                .ok_or_else(|| {
                    ProviderError::permanent("MOCK_UNKNOWN_AGENT", "No canned reply for request")
                })
        })
    }

    fn with_behaviour(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Every request seen so far, in call order
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn generate(&self, request: &ModelRequest) -> Result<String, ProviderError> {
        let index = {
            let mut requests = self
                .requests
                .lock()
                .map_err(|_| ProviderError::permanent("MOCK_POISONED", "request log poisoned"))?;
            requests.push(request.clone());
            requests.len() - 1
        };

        match &self.behaviour {
            Behaviour::Scripted(replies) => replies
                .lock()
                .map_err(|_| ProviderError::permanent("MOCK_POISONED", "script poisoned"))?
                .pop_front()
                .unwrap_or_else(|| {
                    Err(ProviderError::permanent("MOCK_EXHAUSTED", "No scripted reply left"))
                }),
            Behaviour::Responder(responder) => responder(request, index),
        }
    }
}

pub fn canned_reply(kind: AgentKind) -> serde_json::Value {
    match kind {
        AgentKind::FinancialAnalyzer => json!({
            "revenue": {"total": 100000.0, "breakdown": [{"category": "sales", "amount": 100000.0}]},
            "expenses": {"total": 80000.0, "breakdown": [{"category": "salary", "amount": 50000.0}, {"category": "rent", "amount": 30000.0}]},
            "liabilities": {"total": 25000.0, "breakdown": []},
            "loan_emis": [{"lender": "State Bank", "amount": 5000.0, "frequency": "monthly"}],
            "tax_payments": [{"type": "GST", "amount": 3600.0, "date": "2026-09-20"}],
            "metrics": {"gross_margin": 35.0, "net_profit_margin": 20.0, "expense_ratio": 80.0}
        }),
        AgentKind::CashFlowForecaster => json!({
            "current_cash_position": 45000.0,
            "monthly_burn_rate": 6500.0,
            "runway_months": 6.9,
            "forecasts": {
                "3_month": {"date": "2027-01-15", "projected_balance": 39000.0, "confidence": "medium"},
                "6_month": {"date": "2027-04-15", "projected_balance": 31000.0, "confidence": "low"}
            },
            "trends": {"revenue_trend": "stable", "expense_trend": "increasing", "revenue_growth_rate": 2.5},
            "risk_alerts": []
        }),
        AgentKind::RiskDetector => json!({
            "risk_score": 38,
            "risk_level": "medium",
            "risk_factors": [{
                "category": "liquidity",
                "severity": "medium",
                "description": "Runway below nine months",
                "evidence": ["runway_months = 6.9"],
                "recommendation": "Build a three month cash reserve"
            }],
            "anomalies": [],
            "metrics": {"debt_to_income_ratio": 25.0, "liquidity_ratio": 1.8, "emi_to_revenue_ratio": 5.0}
        }),
        AgentKind::AutomationAgent => json!({
            "upcoming_deadlines": [{
                "type": "GST",
                "due_date": "2026-11-20",
                "description": "GSTR-3B monthly return",
                "estimated_amount": 3600.0,
                "status": "upcoming"
            }],
            "compliance_issues": [],
            "automation_suggestions": [{
                "category": "filing",
                "description": "Automate monthly GST filing",
                "potential_savings": "4 hours per month",
                "implementation_complexity": "low"
            }],
            "draft_emails": []
        }),
        AgentKind::ExplainabilityAgent => json!({
            "executive_summary": "Revenue is stable and margins are healthy, but runway is under seven months.",
            "loan_readiness_score": 68,
            "loan_analysis": {
                "approval_likelihood": "medium",
                "strengths": ["Consistent revenue"],
                "weaknesses": ["Short runway"],
                "rejection_reasons": ["Limited cash reserve"]
            },
            "recommended_actions": [{
                "priority": 1,
                "category": "cash_management",
                "action": "Build a cash reserve",
                "impact": "high",
                "effort": "medium",
                "timeline": "1-3 months",
                "details": "Set aside 10% of monthly revenue."
            }],
            "key_insights": ["Expenses are growing faster than revenue"],
            "plain_language_metrics": {"financial_health": "Good", "cash_position": "Adequate", "risk_level": "Moderate"}
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerationParams, ReasoningEffort};

    fn request(system: &str) -> ModelRequest {
        ModelRequest::new(
            "prompt",
            system,
            GenerationParams {
                temperature: 0.1,
                max_output_tokens: 100,
                reasoning_effort: ReasoningEffort::Low,
            },
        )
    }

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let provider = MockProvider::scripted(vec![Ok("one".into()), Ok("two".into())]);

        assert_eq!(provider.generate(&request("s")).await.unwrap(), "one");
        assert_eq!(provider.generate(&request("s")).await.unwrap(), "two");
        assert!(provider.generate(&request("s")).await.is_err());
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_offline_answers_every_agent() {
        let provider = MockProvider::offline();

        for kind in AgentKind::PIPELINE {
            let reply = provider
                .generate(&request(kind.profile().system_instructions))
                .await
                .unwrap();
            let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
            for key in kind.profile().required_keys {
                assert!(value.get(*key).is_some(), "{} missing {}", kind, key);
            }
        }

        assert!(provider.generate(&request("unknown")).await.is_err());
    }
}
