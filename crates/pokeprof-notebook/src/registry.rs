/// The set of loaded document indexes, shared read-only by every query.
///
/// Readers clone an `Arc` to the current [`RegistrySnapshot`] and keep using it for the
/// whole query. Reload builds a new snapshot and swaps the pointer; nodes are never
/// mutated in place.
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::AppError;
use crate::model::DocumentIndex;
use crate::router::{AvailableDocument, CardNameIndex};
use crate::store::IndexStore;

#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    indexes: BTreeMap<String, Arc<DocumentIndex>>,
    cards: CardNameIndex,
}

impl RegistrySnapshot {
    pub fn new(indexes: impl IntoIterator<Item = DocumentIndex>) -> Self {
        let indexes: BTreeMap<String, Arc<DocumentIndex>> = indexes
            .into_iter()
            .map(|index| (index.document_name().to_string(), Arc::new(index)))
            .collect();
        let cards = CardNameIndex::from_indexes(indexes.values().map(|i| i.as_ref()));
        Self { indexes, cards }
    }

    pub fn get(&self, document_name: &str) -> Option<Arc<DocumentIndex>> {
        self.indexes.get(document_name).cloned()
    }

    /// Indexes sorted by document name.
    pub fn indexes(&self) -> impl Iterator<Item = &Arc<DocumentIndex>> {
        self.indexes.values()
    }

    pub fn available_documents(&self) -> Vec<AvailableDocument> {
        self.indexes
            .values()
            .map(|index| AvailableDocument {
                name: index.document_name().to_string(),
                document_type: index.document_type(),
            })
            .collect()
    }

    pub fn cards(&self) -> &CardNameIndex {
        &self.cards
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct IndexRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl IndexRegistry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The snapshot in effect right now. Later reloads do not affect it.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, snapshot: RegistrySnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    /// Load every stored index and swap them in as one snapshot. Indexes that fail to
    /// load are skipped by the store so one bad file cannot take the others down.
    pub async fn reload(&self, store: &dyn IndexStore) -> Result<usize, AppError> {
        let snapshot = RegistrySnapshot::new(store.load_all().await?);
        let count = snapshot.len();
        info!(
            indexes = count,
            card_names = snapshot.cards().len(),
            "index registry loaded"
        );
        self.replace(snapshot);
        Ok(count)
    }
}
