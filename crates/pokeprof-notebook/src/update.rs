/// Update service for document indexes.
///
/// Compares the SHA-256 of each configured document's markdown with the `source_hash`
/// of its stored index and rebuilds only the documents that changed. Runs at startup
/// and on demand via the `update_indexes` MCP tool.
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cache::RetrievalCache;
use crate::config::{DocumentSource, DomainConfig};
use crate::error::AppError;
use crate::indexer;
use crate::model::{validate_tree, DocumentIndex};
use crate::registry::IndexRegistry;
use crate::store::IndexStore;
use notebook_common::api::UpdatedIndex;

pub struct UpdateService {
    domain: Arc<DomainConfig>,
    store: Arc<dyn IndexStore>,
    registry: Arc<IndexRegistry>,
    cache: RetrievalCache,
    /// Serializes concurrent update requests.
    running: Mutex<()>,
}

impl UpdateService {
    pub fn new(
        domain: Arc<DomainConfig>,
        store: Arc<dyn IndexStore>,
        registry: Arc<IndexRegistry>,
        cache: RetrievalCache,
    ) -> Self {
        Self {
            domain,
            store,
            registry,
            cache,
            running: Mutex::new(()),
        }
    }

    /// `Some(hash)` of the current markdown when the stored index is missing or built
    /// from different bytes, `None` when it is up to date.
    pub async fn needs_update(&self, source: &DocumentSource) -> Result<Option<String>, AppError> {
        let markdown = read_markdown(source).await?;
        let current = indexer::content_hash(&markdown);
        match self.store.load(&source.name).await {
            Ok(stored) if stored.source_hash() == current => Ok(None),
            Ok(_) => Ok(Some(current)),
            Err(AppError::NotFound { .. }) => Ok(Some(current)),
            Err(e) => {
                warn!(document = %source.name, error = %e, "stored index unreadable, rebuilding");
                Ok(Some(current))
            }
        }
    }

    /// Rebuild one document from its markdown and save it. Validation issues are logged
    /// but do not block the save.
    pub async fn rebuild(&self, source: &DocumentSource) -> Result<DocumentIndex, AppError> {
        let markdown = read_markdown(source).await?;
        let index = indexer::build(&source.name, source.document_type, &markdown)?;

        let pattern = self.domain.section_regex();
        for issue in validate_tree(&index, pattern.as_ref()) {
            warn!(document = %source.name, issue, "index validation");
        }

        self.store.save(&index).await?;
        Ok(index)
    }

    /// Check every configured document and rebuild the stale ones (all of them when
    /// `force` is set). A failure in one document does not stop the others. The
    /// registry is always reloaded; the retrieval cache is cleared only when something
    /// was rebuilt.
    pub async fn update_all(&self, force: bool) -> Vec<UpdatedIndex> {
        let _guard = self.running.lock().await;
        let mut results = Vec::with_capacity(self.domain.documents.len());
        let mut rebuilt_any = false;

        for source in &self.domain.documents {
            let stale = if force {
                read_markdown(source)
                    .await
                    .map(|markdown| Some(indexer::content_hash(&markdown)))
            } else {
                self.needs_update(source).await
            };

            let result = match stale {
                Ok(None) => {
                    let hash = self
                        .store
                        .load(&source.name)
                        .await
                        .map(|index| index.source_hash().to_string())
                        .unwrap_or_default();
                    info!(document = %source.name, "index up to date");
                    UpdatedIndex {
                        name: source.name.clone(),
                        rebuilt: false,
                        source_hash: hash,
                        error: None,
                    }
                }
                Ok(Some(_)) => match self.rebuild(source).await {
                    Ok(index) => {
                        rebuilt_any = true;
                        info!(
                            document = %source.name,
                            nodes = index.node_count(),
                            source_hash = %index.source_hash(),
                            "index rebuilt"
                        );
                        UpdatedIndex {
                            name: source.name.clone(),
                            rebuilt: true,
                            source_hash: index.source_hash().to_string(),
                            error: None,
                        }
                    }
                    Err(e) => failed(source, e),
                },
                Err(e) => failed(source, e),
            };
            results.push(result);
        }

        if rebuilt_any {
            self.cache.invalidate_all().await;
        }
        if let Err(e) = self.registry.reload(self.store.as_ref()).await {
            warn!(error = %e, "registry reload failed, keeping previous snapshot");
        }
        results
    }
}

fn failed(source: &DocumentSource, error: AppError) -> UpdatedIndex {
    warn!(document = %source.name, error = %error, "index update failed");
    UpdatedIndex {
        name: source.name.clone(),
        rebuilt: false,
        source_hash: String::new(),
        error: Some(error.to_string()),
    }
}

async fn read_markdown(source: &DocumentSource) -> Result<String, AppError> {
    tokio::fs::read_to_string(&source.markdown_path)
        .await
        .map_err(|e| {
            AppError::Config(format!(
                "cannot read {} markdown at {}: {e}",
                source.name,
                source.markdown_path.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DocumentType;
    use crate::store::MemoryIndexStore;

    const RULEBOOK: &str = "# 3 Setup\n\n## 3.4 Prize Cards\n\nEach player sets aside 6 Prize cards.\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        service: UpdateService,
        store: Arc<MemoryIndexStore>,
        registry: Arc<IndexRegistry>,
        rulebook_path: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let rulebook_path = dir.path().join("rulebook.md");
        std::fs::write(&rulebook_path, RULEBOOK).unwrap();
        let domain = DomainConfig {
            documents: vec![
                DocumentSource {
                    name: "rulebook".into(),
                    document_type: DocumentType::Rulebook,
                    markdown_path: rulebook_path.clone(),
                },
                DocumentSource {
                    name: "penalty_guidelines".into(),
                    document_type: DocumentType::PenaltyGuidelines,
                    markdown_path: dir.path().join("missing.md"),
                },
            ],
            ..DomainConfig::default()
        };
        let store = Arc::new(MemoryIndexStore::new());
        let registry = Arc::new(IndexRegistry::default());
        let service = UpdateService::new(
            Arc::new(domain),
            store.clone(),
            registry.clone(),
            RetrievalCache::disabled(),
        );
        Fixture {
            _dir: dir,
            service,
            store,
            registry,
            rulebook_path,
        }
    }

    #[tokio::test]
    async fn builds_missing_then_skips_unchanged() {
        let f = fixture();
        let first = f.service.update_all(false).await;
        assert_eq!(first.len(), 2);
        assert!(first[0].rebuilt);
        assert_eq!(first[0].source_hash, indexer::content_hash(RULEBOOK));
        // One broken document does not block the other.
        assert!(!first[1].rebuilt);
        assert!(first[1].error.is_some());
        assert!(f.registry.snapshot().get("rulebook").is_some());

        let second = f.service.update_all(false).await;
        assert!(!second[0].rebuilt);
        assert!(second[0].error.is_none());
        assert_eq!(second[0].source_hash, first[0].source_hash);
    }

    #[tokio::test]
    async fn changed_markdown_triggers_rebuild() {
        let f = fixture();
        f.service.update_all(false).await;
        let before = f.registry.snapshot();

        let changed = format!("{RULEBOOK}\n## 3.5 Mulligans\n\nShuffle and redraw.\n");
        std::fs::write(&f.rulebook_path, &changed).unwrap();
        let source = &f.service.domain.documents[0];
        assert!(f.service.needs_update(source).await.unwrap().is_some());

        let results = f.service.update_all(false).await;
        assert!(results[0].rebuilt);
        let stored = f.store.load("rulebook").await.unwrap();
        assert_eq!(stored.source_hash(), indexer::content_hash(&changed));
        assert!(f.registry.snapshot().get("rulebook").unwrap().find("3.5").is_some());
        // Readers holding the old snapshot are unaffected.
        assert!(before.get("rulebook").unwrap().find("3.5").is_none());
    }

    #[tokio::test]
    async fn force_rebuilds_everything_readable() {
        let f = fixture();
        f.service.update_all(false).await;
        let results = f.service.update_all(true).await;
        assert!(results[0].rebuilt);
    }

    #[tokio::test]
    async fn parse_error_keeps_previous_index() {
        let f = fixture();
        f.service.update_all(false).await;
        std::fs::write(&f.rulebook_path, "   \n").unwrap();
        let results = f.service.update_all(false).await;
        assert!(!results[0].rebuilt);
        assert!(results[0].error.as_deref().unwrap().contains("empty"));
        assert!(f.registry.snapshot().get("rulebook").is_some());
    }
}
