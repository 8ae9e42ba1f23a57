//! Financial Report Pipeline
//!
//! Turns an owner's financial documents into a six-section report by
//! running five LLM agents in a fixed sequence:
//! - Financial Analyzer extracts structured figures
//! - Cash Flow Forecaster projects runway
//! - Risk Detector scores risk and anomalies
//! - Automation Agent lists compliance deadlines
//! - Explainability Agent writes the plain-language synthesis
//!
//! PIPELINE:
//! DOCUMENTS → CORPUS → ANALYZE → FORECAST → RISK → COMPLIANCE → EXPLAIN → REPORT

pub mod agents;
pub mod api;
pub mod config;
pub mod documents;
pub mod error;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod store;

pub use error::{PipelineError, Result};

// Re-export common types
pub use agents::{Agent, AgentContext, AgentKind};
pub use config::Settings;
pub use models::*;
pub use pipeline::{Pipeline, StartedRun};
