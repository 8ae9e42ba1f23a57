use financial_report_pipeline::{
    documents::InMemoryDocumentSource,
    llm::{provider_from_settings, ModelInvoker},
    store::InMemoryRunStore,
    Pipeline, Settings,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Usage: orchestrator <document>... [--type <label>]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;

    let mut paths = Vec::new();
    let mut document_type = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--type" {
            document_type = args.next();
        } else {
            paths.push(arg);
        }
    }

    if paths.is_empty() {
        warn!("No documents given; the run will fail with no documents");
    }

    info!("Financial Report Pipeline starting");

    // Create components
    let provider = provider_from_settings(&settings)?;
    let invoker = Arc::new(ModelInvoker::from_settings(provider, &settings));
    let store = Arc::new(InMemoryRunStore::new());
    let documents = Arc::new(InMemoryDocumentSource::new());

    let owner_id = Uuid::new_v4();
    let mut document_ids = Vec::new();
    for path in &paths {
        let record = documents
            .register_file(owner_id, path, document_type.clone())
            .await;
        document_ids.push(record.document_id);
    }

    let pipeline = Pipeline::new(store, documents, invoker, &settings);

    // Run synchronously to a terminal state
    let run_id = pipeline.create_run(owner_id, document_ids).await?.run_id;

    info!(run_id = %run_id, documents = paths.len(), "Running pipeline");

    let finished = pipeline.process_run(run_id).await?;
    let view = pipeline.get_run(run_id).await?;
    let stages = pipeline.stage_results(run_id).await?;

    println!("\n=== RUN ===");
    println!("{}", serde_json::to_string_pretty(&view)?);

    println!("\n=== STAGE TIMINGS ===");
    for (i, stage) in stages.iter().enumerate() {
        println!(
            "  {}: {} ({} ms){}",
            i + 1,
            stage.agent,
            stage.execution_time_ms,
            if stage.is_error() { " [error]" } else { "" }
        );
    }

    if let Some(digest) = &finished.corpus_digest {
        println!("\nCorpus digest: {}", digest);
    }

    match finished.error_message {
        Some(message) => Err(message.into()),
        None => Ok(()),
    }
}
