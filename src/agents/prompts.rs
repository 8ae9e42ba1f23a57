//! Fixed system instructions and prompt builders for the five agents
//!
//! Builders are pure functions of the `AgentContext`.

use crate::agents::{slots, AgentContext};
use crate::error::PipelineError;
use crate::Result;
use serde_json::Value;

pub const FINANCIAL_ANALYZER_SYSTEM: &str = r#"You are a Financial Data Extraction Agent. Extract structured financial data from the provided documents.
Identify revenue streams, expense categories, liabilities, loan EMIs, and tax payments.
Return results in strict JSON format with numerical values only (no currency symbols).
If information is missing or unclear, use null values.

Output format must be valid JSON matching this structure:
{
  "revenue": {"total": float, "breakdown": [{"category": str, "amount": float}]},
  "expenses": {"total": float, "breakdown": [{"category": str, "amount": float}]},
  "liabilities": {"total": float, "breakdown": [{"type": str, "amount": float, "due_date": str}]},
  "loan_emis": [{"lender": str, "amount": float, "frequency": str}],
  "tax_payments": [{"type": str, "amount": float, "date": str}],
  "metrics": {"gross_margin": float, "net_profit_margin": float, "expense_ratio": float}
}"#;

pub const CASH_FLOW_FORECASTER_SYSTEM: &str = r#"You are a Cash Flow Forecasting Agent. Based on historical financial data, predict future cash positions.
Calculate burn rate, runway, and project cash balance at 3-month and 6-month intervals.
Identify trends in revenue and expenses. Flag potential cash shortfall dates.
Return results in strict JSON format with clear confidence levels.

Output format must be valid JSON matching this structure:
{
  "current_cash_position": float,
  "monthly_burn_rate": float,
  "runway_months": float,
  "forecasts": {
    "3_month": {"date": str, "projected_balance": float, "confidence": str},
    "6_month": {"date": str, "projected_balance": float, "confidence": str}
  },
  "trends": {"revenue_trend": str, "expense_trend": str, "revenue_growth_rate": float},
  "risk_alerts": [{"type": str, "message": str, "date": str}]
}"#;

pub const RISK_DETECTOR_SYSTEM: &str = r#"You are a Financial Risk Detection Agent. Analyze financial data to identify risks, anomalies, and potential fraud indicators.
Flag abnormal spending patterns, assess loan default risk, detect inconsistencies, and calculate risk metrics.
Provide severity ratings and actionable recommendations.
Return results in strict JSON format.

Output format must be valid JSON matching this structure:
{
  "risk_score": int,
  "risk_level": str,
  "risk_factors": [{"category": str, "severity": str, "description": str, "evidence": [str], "recommendation": str}],
  "anomalies": [{"type": str, "transaction_id": str, "amount": float, "date": str, "reason": str}],
  "metrics": {"debt_to_income_ratio": float, "liquidity_ratio": float, "emi_to_revenue_ratio": float}
}"#;

pub const AUTOMATION_AGENT_SYSTEM: &str = r#"You are a Compliance and Automation Agent. Identify upcoming tax deadlines, check for compliance issues, and suggest automation opportunities.
Generate draft payment reminder emails. Recommend automated GST filing actions.
Focus on Indian tax compliance (GST, Income Tax, TDS).
Return results in strict JSON format with clear deadlines and actionable suggestions.

Output format must be valid JSON matching this structure:
{
  "upcoming_deadlines": [{"type": str, "due_date": str, "description": str, "estimated_amount": float, "status": str}],
  "compliance_issues": [{"type": str, "description": str, "severity": str, "resolution_steps": [str]}],
  "automation_suggestions": [{"category": str, "description": str, "potential_savings": str, "implementation_complexity": str}],
  "draft_emails": [{"subject": str, "body": str, "recipient_type": str}]
}"#;

pub const EXPLAINABILITY_AGENT_SYSTEM: &str = r#"You are a Financial Explainability Agent. Synthesize complex financial data into clear, executive-level insights.
Explain loan rejection reasons in plain language. Provide 3-5 specific, prioritized, actionable recommendations to improve financial health and creditworthiness.
Translate technical metrics into business-focused language.
Your audience is a small business owner without financial expertise.
Return results in strict JSON format.

Output format must be valid JSON matching this structure:
{
  "executive_summary": str,
  "loan_readiness_score": int,
  "loan_analysis": {"approval_likelihood": str, "strengths": [str], "weaknesses": [str], "rejection_reasons": [str]},
  "recommended_actions": [{"priority": int, "category": str, "action": str, "impact": str, "effort": str, "timeline": str, "details": str}],
  "key_insights": [str],
  "plain_language_metrics": {"financial_health": str, "cash_position": str, "risk_level": str}
}"#;

const JSON_ONLY: &str = "Return only valid JSON without any markdown formatting or explanations.";

pub fn financial_analyzer(context: &AgentContext) -> Result<String> {
    let documents_text = string_slot(context, slots::DOCUMENTS_TEXT)?.unwrap_or("");
    let document_types = string_list_slot(context, slots::DOCUMENT_TYPES)?;

    let types_line = if document_types.is_empty() {
        "Mixed financial documents".to_string()
    } else {
        document_types.join(", ")
    };

    Ok(format!(
        r#"Analyze the following financial documents and extract structured data:

Document Types: {types_line}

Documents Content:
{content}

Extract all financial information including:
- Total revenue and breakdown by categories
- Total expenses and breakdown by categories
- Liabilities with due dates
- Loan EMI information
- Tax payments

Calculate financial metrics:
- Gross margin percentage
- Net profit margin
- Expense ratio

{JSON_ONLY}"#,
        content = truncate_chars(documents_text, context.max_document_chars()),
    ))
}

pub fn cash_flow_forecaster(context: &AgentContext) -> Result<String> {
    let financial_data = render_slot(context, slots::FINANCIAL_DATA)?;

    Ok(format!(
        r#"Based on the following financial data, forecast cash flow for the next 3 and 6 months:

Financial Analysis Data:
{financial_data}

Tasks:
1. Calculate current cash position (assets minus immediate liabilities)
2. Calculate monthly burn rate based on expense patterns
3. Project runway (months until cash depletes at current burn rate)
4. Forecast cash position at 3-month and 6-month marks
5. Identify revenue and expense trends (increasing/stable/decreasing)
6. Calculate revenue growth rate
7. Flag potential cash shortfall dates with specific alerts

Provide confidence levels:
- "high" if data is consistent and trends are clear
- "medium" if some uncertainty exists
- "low" if data is limited or inconsistent

{JSON_ONLY}"#
    ))
}

pub fn risk_detector(context: &AgentContext) -> Result<String> {
    let financial_data = render_slot(context, slots::FINANCIAL_DATA)?;
    let cashflow_data = render_slot(context, slots::CASHFLOW_DATA)?;

    Ok(format!(
        r#"Analyze the following financial data for risks and anomalies:

Financial Data:
{financial_data}

Cash Flow Data:
{cashflow_data}

Tasks:
1. Calculate overall risk score (0-100, higher = more risk)
2. Determine risk level: "low" (0-25), "medium" (26-50), "high" (51-75), "critical" (76-100)
3. Identify risk factors in categories:
   - "loan_default": Risk of defaulting on loans
   - "liquidity": Insufficient liquid assets
   - "fraud": Suspicious transaction patterns
   - "inconsistency": Data inconsistencies
4. Detect anomalies: unusually large transactions, duplicate transactions, suspicious patterns
5. Calculate risk metrics:
   - Debt-to-income ratio (total debt / monthly income)
   - Liquidity ratio (current assets / current liabilities)
   - EMI-to-revenue ratio (total monthly EMI / monthly revenue)
6. Provide actionable recommendations for each risk factor

{JSON_ONLY}"#
    ))
}

pub fn automation_agent(context: &AgentContext) -> Result<String> {
    let financial_data = render_slot(context, slots::FINANCIAL_DATA)?;
    let current_date = context.as_of().format("%Y-%m-%d");

    Ok(format!(
        r#"Analyze financial data for compliance and automation opportunities:

Current Date: {current_date}

Financial Data:
{financial_data}

Tasks:
1. Identify upcoming tax deadlines (next 90 days):
   - GST filing deadlines (monthly/quarterly)
   - Income Tax advance tax payments
   - TDS return filing
   - Annual tax return deadlines
2. Check for compliance issues (late or missed payments, missing documentation,
   regulatory violations) with severity "low", "medium" or "high"
3. Suggest automation opportunities in categories "payment", "filing", "reporting",
   with potential time/cost savings and implementation complexity "low", "medium" or "high"
4. Generate 2-3 draft emails (payment reminders, tax deadline reminders)
   for recipient types "vendor", "client", "tax_authority"

{JSON_ONLY}"#
    ))
}

pub fn explainability_agent(context: &AgentContext) -> Result<String> {
    let financial_data = render_slot(context, slots::FINANCIAL_DATA)?;
    let cashflow_data = render_slot(context, slots::CASHFLOW_DATA)?;
    let risk_data = render_slot(context, slots::RISK_DATA)?;
    let compliance_data = render_slot(context, slots::COMPLIANCE_DATA)?;

    Ok(format!(
        r#"Synthesize all financial analysis into clear, actionable insights for a business owner:

Financial Analysis:
{financial_data}

Cash Flow Forecast:
{cashflow_data}

Risk Assessment:
{risk_data}

Compliance & Automation:
{compliance_data}

Tasks:
1. Write an executive summary (2-3 paragraphs) in business-focused language:
   current situation, key opportunities and challenges, most critical actions
2. Calculate loan readiness score (0-100) from cash position, revenue trends, debt ratios and risk factors:
   80-100 excellent, 60-79 good, 40-59 fair, 0-39 poor
3. Loan analysis: approval likelihood ("high", "medium", "low"), 3-5 strengths,
   3-5 weaknesses, and specific rejection reasons when likelihood is not "high"
4. Provide 3-5 recommended actions with priority (1 most urgent), category
   ("revenue", "cost_reduction", "cash_management", "debt", "compliance"),
   impact and effort ("high", "medium", "low"), timeline ("immediate", "1-3 months", "3-6 months")
   and a detailed explanation
5. Provide 3-5 key insights about the business
6. Translate metrics to plain language:
   - Financial health: "Excellent", "Good", "Fair", "Poor"
   - Cash position: "Strong", "Adequate", "Tight", "Critical"
   - Risk level: "Low", "Moderate", "High", "Critical"

{JSON_ONLY}"#
    ))
}

/// Upstream stage output as pretty JSON; an absent slot renders as `{}`
fn render_slot(context: &AgentContext, slot: &str) -> Result<String> {
    match context.get(slot) {
        Some(value) => Ok(serde_json::to_string_pretty(value)?),
        None => Ok("{}".to_string()),
    }
}

fn string_slot<'a>(context: &'a AgentContext, slot: &str) -> Result<Option<&'a str>> {
    match context.get(slot) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.as_str())),
        Some(other) => Err(PipelineError::PromptError(format!(
            "context slot '{}' must be a string, got {}",
            slot,
            json_type(other)
        ))),
    }
}

fn string_list_slot<'a>(context: &'a AgentContext, slot: &str) -> Result<Vec<&'a str>> {
    match context.get(slot) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().ok_or_else(|| {
                    PipelineError::PromptError(format!(
                        "context slot '{}' must contain only strings",
                        slot
                    ))
                })
            })
            .collect(),
        Some(other) => Err(PipelineError::PromptError(format!(
            "context slot '{}' must be a list, got {}",
            slot,
            json_type(other)
        ))),
    }
}

/// Truncate to at most `max_chars` characters without splitting a code point
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("₹₹₹₹", 2), "₹₹");
    }

    #[test]
    fn test_financial_prompt_lists_types_and_truncates() {
        let context = AgentContext::new()
            .with(slots::DOCUMENTS_TEXT, json!("x".repeat(20)))
            .with(slots::DOCUMENT_TYPES, json!(["bank_statement", "invoice"]))
            .with_document_limit(5);

        let prompt = financial_analyzer(&context).unwrap();
        assert!(prompt.contains("Document Types: bank_statement, invoice"));
        assert!(prompt.contains("\nxxxxx\n"));
        assert!(!prompt.contains("xxxxxx"));
    }

    #[test]
    fn test_financial_prompt_defaults_type_line() {
        let context = AgentContext::new().with(slots::DOCUMENTS_TEXT, json!("Revenue: 100000"));
        let prompt = financial_analyzer(&context).unwrap();
        assert!(prompt.contains("Document Types: Mixed financial documents"));
    }

    #[test]
    fn test_wrong_slot_type_is_prompt_error() {
        let context = AgentContext::new().with(slots::DOCUMENTS_TEXT, json!(42));
        let err = financial_analyzer(&context).unwrap_err();
        assert!(matches!(err, PipelineError::PromptError(_)));
    }

    #[test]
    fn test_missing_upstream_renders_empty_object() {
        let prompt = risk_detector(&AgentContext::new()).unwrap();
        assert!(prompt.contains("Financial Data:\n{}"));
        assert!(prompt.contains("Cash Flow Data:\n{}"));
    }

    #[test]
    fn test_automation_prompt_uses_as_of_date() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        let context = AgentContext::new()
            .with(slots::FINANCIAL_DATA, json!({"revenue": {"total": 1}}))
            .with_as_of(date);

        let prompt = automation_agent(&context).unwrap();
        assert!(prompt.contains("Current Date: 2026-03-31"));
    }

    #[test]
    fn test_error_bearing_upstream_is_rendered_verbatim() {
        let context = AgentContext::new()
            .with(slots::FINANCIAL_DATA, json!({"error": "ThrottlingException: slow down"}));

        let prompt = cash_flow_forecaster(&context).unwrap();
        assert!(prompt.contains("ThrottlingException: slow down"));
    }
}
