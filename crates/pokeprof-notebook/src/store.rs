/// Persistence of built indexes behind a narrow load/save/list contract.
///
/// - [`FileIndexStore`]: one `{document_name}.json` per index, written atomically.
/// - [`RedisIndexStore`]: namespaced Redis keys; unreachable Redis reads as "not found".
/// - [`MirroredIndexStore`]: file store of record with a Redis read-through mirror.
/// - [`MemoryIndexStore`]: process-local map, for tests and ephemeral runs.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use notebook_common::redis::RedisCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::model::{DocumentIndex, DocumentType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub document_type: DocumentType,
    pub node_count: usize,
    pub total_tokens: usize,
    pub source_hash: String,
}

impl IndexInfo {
    pub fn of(index: &DocumentIndex) -> Self {
        Self {
            name: index.document_name().to_string(),
            document_type: index.document_type(),
            node_count: index.node_count(),
            total_tokens: index.total_tokens(),
            source_hash: index.source_hash().to_string(),
        }
    }
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Fails with `AppError::NotFound` when no index is stored under `document_name`.
    async fn load(&self, document_name: &str) -> Result<DocumentIndex, AppError>;

    async fn save(&self, index: &DocumentIndex) -> Result<(), AppError>;

    /// Every readable stored index, sorted by name, each deserialized once.
    /// Unreadable entries are skipped with a warning.
    async fn load_all(&self) -> Result<Vec<DocumentIndex>, AppError>;

    /// Stored indexes sorted by name.
    async fn list(&self) -> Result<Vec<IndexInfo>, AppError> {
        Ok(self.load_all().await?.iter().map(IndexInfo::of).collect())
    }
}

fn not_found(name: &str) -> AppError {
    AppError::NotFound {
        kind: "index",
        name: name.to_string(),
    }
}

fn check_name(name: &str) -> Result<(), AppError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(AppError::Store(format!("invalid document name: {name:?}")))
    }
}

fn decode(name: &str, raw: &str) -> Result<DocumentIndex, AppError> {
    serde_json::from_str(raw).map_err(|e| AppError::Store(format!("{name}: corrupt index: {e}")))
}

async fn load_each(
    store: &dyn IndexStore,
    names: impl IntoIterator<Item = String>,
) -> Vec<DocumentIndex> {
    let mut indexes = Vec::new();
    for name in names {
        match store.load(&name).await {
            Ok(index) => indexes.push(index),
            Err(e) => warn!(name = %name, error = %e, "skipping unreadable index"),
        }
    }
    indexes.sort_by(|a, b| a.document_name().cmp(b.document_name()));
    indexes
}

fn encode(index: &DocumentIndex) -> Result<String, AppError> {
    serde_json::to_string(index).map_err(|e| {
        AppError::Store(format!("{}: cannot serialize index: {e}", index.document_name()))
    })
}

#[derive(Debug, Clone)]
pub struct FileIndexStore {
    dir: PathBuf,
}

impl FileIndexStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl IndexStore for FileIndexStore {
    async fn load(&self, document_name: &str) -> Result<DocumentIndex, AppError> {
        check_name(document_name)?;
        let path = self.path_for(document_name);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(not_found(document_name))
            }
            Err(e) => return Err(e.into()),
        };
        decode(document_name, &raw)
    }

    async fn save(&self, index: &DocumentIndex) -> Result<(), AppError> {
        let name = index.document_name();
        check_name(name)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = encode(index)?;

        // Write-then-rename so readers never observe a half-written index.
        let path = self.path_for(name);
        let tmp = self.dir.join(format!(".{name}.json.tmp"));
        if let Err(e) = tokio::fs::write(&tmp, json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "index saved");
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<DocumentIndex>, AppError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(|f| f.strip_suffix(".json")) else {
                continue;
            };
            if check_name(name).is_ok() {
                names.push(name.to_string());
            }
        }
        Ok(load_each(self, names).await)
    }
}

const REDIS_INDEX_PREFIX: &str = "index:";

#[derive(Clone)]
pub struct RedisIndexStore {
    redis: RedisCache,
}

impl RedisIndexStore {
    pub fn new(redis: RedisCache) -> Self {
        Self { redis }
    }

    fn key(name: &str) -> String {
        format!("{REDIS_INDEX_PREFIX}{name}")
    }
}

#[async_trait]
impl IndexStore for RedisIndexStore {
    async fn load(&self, document_name: &str) -> Result<DocumentIndex, AppError> {
        check_name(document_name)?;
        let raw = self
            .redis
            .get(&Self::key(document_name))
            .await
            .ok_or_else(|| not_found(document_name))?;
        decode(document_name, &raw)
    }

    async fn save(&self, index: &DocumentIndex) -> Result<(), AppError> {
        check_name(index.document_name())?;
        let json = encode(index)?;
        if self.redis.set(&Self::key(index.document_name()), &json, None).await {
            Ok(())
        } else {
            Err(AppError::Store(format!(
                "{}: redis write failed",
                index.document_name()
            )))
        }
    }

    async fn load_all(&self) -> Result<Vec<DocumentIndex>, AppError> {
        let keys = self
            .redis
            .keys_with_prefix(REDIS_INDEX_PREFIX)
            .await
            .unwrap_or_default();
        let names: Vec<String> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(REDIS_INDEX_PREFIX))
            .map(str::to_string)
            .collect();
        Ok(load_each(self, names).await)
    }
}

/// File store of record, Redis as a read-through mirror. Mirror failures only warn.
pub struct MirroredIndexStore {
    primary: FileIndexStore,
    mirror: RedisIndexStore,
}

impl MirroredIndexStore {
    pub fn new(primary: FileIndexStore, mirror: RedisIndexStore) -> Self {
        Self { primary, mirror }
    }
}

#[async_trait]
impl IndexStore for MirroredIndexStore {
    async fn load(&self, document_name: &str) -> Result<DocumentIndex, AppError> {
        match self.mirror.load(document_name).await {
            Ok(index) => return Ok(index),
            Err(AppError::NotFound { .. }) => {}
            Err(e) => warn!(document = document_name, error = %e, "mirror load failed"),
        }
        let index = self.primary.load(document_name).await?;
        if let Err(e) = self.mirror.save(&index).await {
            debug!(document = document_name, error = %e, "mirror backfill skipped");
        }
        Ok(index)
    }

    async fn save(&self, index: &DocumentIndex) -> Result<(), AppError> {
        self.primary.save(index).await?;
        if let Err(e) = self.mirror.save(index).await {
            warn!(document = index.document_name(), error = %e, "mirror save failed");
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<DocumentIndex>, AppError> {
        self.primary.load_all().await
    }
}

#[derive(Default)]
pub struct MemoryIndexStore {
    indexes: RwLock<BTreeMap<String, DocumentIndex>>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn load(&self, document_name: &str) -> Result<DocumentIndex, AppError> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| AppError::Store("memory store poisoned".to_string()))?;
        indexes
            .get(document_name)
            .cloned()
            .ok_or_else(|| not_found(document_name))
    }

    async fn save(&self, index: &DocumentIndex) -> Result<(), AppError> {
        check_name(index.document_name())?;
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| AppError::Store("memory store poisoned".to_string()))?;
        indexes.insert(index.document_name().to_string(), index.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<DocumentIndex>, AppError> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| AppError::Store("memory store poisoned".to_string()))?;
        Ok(indexes.values().cloned().collect())
    }
}
