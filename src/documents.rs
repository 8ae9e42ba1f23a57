//! Document corpus provider
//!
//! Resolves an owner's documents and hands back their extracted text.
//! Parsing of binary formats is owned by an external extractor; this
//! module only reads plain-text sources.

use crate::error::PipelineError;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const DEFAULT_DOCUMENT_TYPE: &str = "financial_document";

/// Extensions read directly as UTF-8
const TEXT_EXTENSIONS: &[&str] = &["txt", "csv", "tsv", "md", "json"];

/// Extensions that need a dedicated extractor
const BINARY_EXTENSIONS: &[&str] = &["pdf", "xlsx", "xls"];

#[derive(Debug, Clone)]
pub enum DocumentContent {
    Text(String),
    File(PathBuf),
    Unreadable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub document_id: Uuid,
    pub owner_id: Uuid,
    pub filename: String,
    pub document_type: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub content: DocumentContent,
}

impl DocumentRecord {
    pub fn new(
        owner_id: Uuid,
        filename: impl Into<String>,
        document_type: Option<String>,
        content: DocumentContent,
    ) -> Self {
        Self {
            document_id: Uuid::new_v4(),
            owner_id,
            filename: filename.into(),
            document_type,
            created_at: Utc::now(),
            content,
        }
    }

    pub fn type_label(&self) -> &str {
        self.document_type
            .as_deref()
            .filter(|label| !label.trim().is_empty())
            .unwrap_or(DEFAULT_DOCUMENT_TYPE)
    }
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Owner's documents for `document_ids`; an empty slice selects all of them.
    /// Ids that are unknown or belong to another owner are dropped.
    async fn resolve(&self, owner_id: Uuid, document_ids: &[Uuid]) -> Result<Vec<DocumentRecord>>;

    async fn extract_text(&self, document: &DocumentRecord) -> Result<String>;
}

/// In-memory registry for development and tests
pub struct InMemoryDocumentSource {
    documents: Arc<RwLock<HashMap<Uuid, DocumentRecord>>>,
}

impl InMemoryDocumentSource {
    pub fn new() -> Self {
        Self {
            documents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, record: DocumentRecord) -> DocumentRecord {
        let mut documents = self.documents.write().await;
        documents.insert(record.document_id, record.clone());
        record
    }

    pub async fn register_text(
        &self,
        owner_id: Uuid,
        filename: impl Into<String>,
        document_type: Option<String>,
        text: impl Into<String>,
    ) -> DocumentRecord {
        self.register(DocumentRecord::new(
            owner_id,
            filename,
            document_type,
            DocumentContent::Text(text.into()),
        ))
        .await
    }

    /// The file is read lazily at extraction time
    pub async fn register_file(
        &self,
        owner_id: Uuid,
        path: impl AsRef<Path>,
        document_type: Option<String>,
    ) -> DocumentRecord {
        let path = path.as_ref().to_path_buf();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        self.register(DocumentRecord::new(
            owner_id,
            filename,
            document_type,
            DocumentContent::File(path),
        ))
        .await
    }

    pub async fn register_unreadable(
        &self,
        owner_id: Uuid,
        filename: impl Into<String>,
        reason: impl Into<String>,
    ) -> DocumentRecord {
        self.register(DocumentRecord::new(
            owner_id,
            filename,
            None,
            DocumentContent::Unreadable(reason.into()),
        ))
        .await
    }
}

impl Default for InMemoryDocumentSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentSource for InMemoryDocumentSource {
    async fn resolve(&self, owner_id: Uuid, document_ids: &[Uuid]) -> Result<Vec<DocumentRecord>> {
        let documents = self.documents.read().await;

        if document_ids.is_empty() {
            let mut owned: Vec<DocumentRecord> = documents
                .values()
                .filter(|d| d.owner_id == owner_id)
                .cloned()
                .collect();
            owned.sort_by_key(|d| d.created_at);
            return Ok(owned);
        }

        Ok(document_ids
            .iter()
            .filter_map(|id| documents.get(id))
            .filter(|d| d.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn extract_text(&self, document: &DocumentRecord) -> Result<String> {
        match &document.content {
            DocumentContent::Text(text) => Ok(text.clone()),
            DocumentContent::Unreadable(reason) => Err(PipelineError::DocumentError(format!(
                "{}: {}",
                document.filename, reason
            ))),
            DocumentContent::File(path) => read_text_file(path).await,
        }
    }
}

async fn read_text_file(path: &Path) -> Result<String> {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if BINARY_EXTENSIONS.contains(&extension.as_str()) {
        return Err(PipelineError::DocumentError(format!(
            "{}: .{} files require an external extractor",
            path.display(),
            extension
        )));
    }

    if !TEXT_EXTENSIONS.contains(&extension.as_str()) {
        return Err(PipelineError::DocumentError(format!(
            "{}: unsupported file type '{}'",
            path.display(),
            extension
        )));
    }

    Ok(tokio::fs::read_to_string(path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_filters_by_owner_and_keeps_order() {
        let source = InMemoryDocumentSource::new();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();

        let a = source.register_text(owner, "a.txt", None, "A").await;
        let b = source.register_text(owner, "b.txt", None, "B").await;
        let foreign = source.register_text(other, "c.txt", None, "C").await;

        let resolved = source
            .resolve(owner, &[b.document_id, foreign.document_id, a.document_id, Uuid::new_v4()])
            .await
            .unwrap();

        let ids: Vec<Uuid> = resolved.iter().map(|d| d.document_id).collect();
        assert_eq!(ids, vec![b.document_id, a.document_id]);
    }

    #[tokio::test]
    async fn test_empty_selection_means_all_owned() {
        let source = InMemoryDocumentSource::new();
        let owner = Uuid::new_v4();
        source.register_text(owner, "a.txt", None, "A").await;
        source.register_text(owner, "b.txt", None, "B").await;
        source.register_text(Uuid::new_v4(), "c.txt", None, "C").await;

        assert_eq!(source.resolve(owner, &[]).await.unwrap().len(), 2);
        assert!(source.resolve(Uuid::new_v4(), &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_type_label_defaults() {
        let source = InMemoryDocumentSource::new();
        let owner = Uuid::new_v4();

        let plain = source.register_text(owner, "a.txt", None, "A").await;
        let typed = source
            .register_text(owner, "b.txt", Some("bank_statement".into()), "B")
            .await;

        assert_eq!(plain.type_label(), DEFAULT_DOCUMENT_TYPE);
        assert_eq!(typed.type_label(), "bank_statement");
    }

    #[tokio::test]
    async fn test_extract_text_variants() {
        let source = InMemoryDocumentSource::new();
        let owner = Uuid::new_v4();

        let text = source.register_text(owner, "a.txt", None, "Revenue: 100000").await;
        assert_eq!(source.extract_text(&text).await.unwrap(), "Revenue: 100000");

        let broken = source.register_unreadable(owner, "scan.pdf", "corrupt xref table").await;
        let err = source.extract_text(&broken).await.unwrap_err();
        assert!(err.to_string().contains("corrupt xref table"));

        let pdf = source.register_file(owner, "/tmp/statement.pdf", None).await;
        let err = source.extract_text(&pdf).await.unwrap_err();
        assert!(err.to_string().contains("external extractor"));
    }

    #[tokio::test]
    async fn test_register_file_reads_text() {
        let path = std::env::temp_dir().join(format!("ledger-{}.csv", Uuid::new_v4()));
        tokio::fs::write(&path, "month,revenue\njan,100000\n").await.unwrap();

        let source = InMemoryDocumentSource::new();
        let record = source.register_file(Uuid::new_v4(), &path, None).await;

        assert!(record.filename.ends_with(".csv"));
        assert!(source.extract_text(&record).await.unwrap().contains("jan,100000"));

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let source = InMemoryDocumentSource::new();
        let record = source
            .register_file(Uuid::new_v4(), "/nonexistent/ledger.txt", None)
            .await;

        let err = source.extract_text(&record).await.unwrap_err();
        assert!(matches!(err, PipelineError::IoError(_)));
    }
}
