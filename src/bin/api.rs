use financial_report_pipeline::{
    api::{start_server, ApiState},
    documents::InMemoryDocumentSource,
    llm::{provider_from_settings, ModelInvoker},
    store::build_store,
    Pipeline, Settings,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Loads .env as well
    let settings = Settings::from_env()?;

    info!("Financial Report Pipeline - API Server");
    info!("Port: {}", settings.api_port);

    // Create components
    let provider = provider_from_settings(&settings)?;
    let invoker = Arc::new(ModelInvoker::from_settings(provider, &settings));
    let store = build_store(&settings);
    let documents = Arc::new(InMemoryDocumentSource::new());

    let pipeline = Arc::new(Pipeline::new(
        store,
        documents.clone(),
        invoker,
        &settings,
    ));

    info!("Pipeline initialized");

    let state = ApiState {
        pipeline,
        documents,
    };

    start_server(state, &settings.api_host, settings.api_port).await?;

    Ok(())
}
