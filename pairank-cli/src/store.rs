/// JSON-file backed OrderedStore.
///
/// The whole file is loaded into a `MemoryStore` on open and rewritten after
/// every successful write, so a crash mid-shift leaves the rows exactly as
/// far as the protocol got. Item titles and metadata live in a catalog next
/// to the per-user rows.
use async_trait::async_trait;
use pairank_core::{CandidateItem, ItemId, MemoryStore, OrderedStore, RankedItem, StoreError, StoredRow, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    #[serde(default)]
    items: BTreeMap<ItemId, CandidateItem>,
    #[serde(default)]
    rankings: BTreeMap<UserId, Vec<StoredRow>>,
}

pub struct JsonFileStore {
    path: PathBuf,
    rows: MemoryStore,
    catalog: RwLock<BTreeMap<ItemId, CandidateItem>>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file: StoreFile = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| StoreError::Unavailable(format!("failed to parse {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(e) => return Err(StoreError::Unavailable(format!("failed to read {}: {e}", path.display()))),
        };
        Ok(JsonFileStore {
            path: path.to_path_buf(),
            rows: MemoryStore::from_rows(file.rankings.into_iter().collect()),
            catalog: RwLock::new(file.items),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current state to disk (temp file, then rename).
    async fn save(&self) -> Result<(), StoreError> {
        let file = StoreFile {
            items: self.catalog.read().await.clone(),
            rankings: self.rows.snapshot().await.into_iter().collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| StoreError::Unavailable(format!("failed to encode store: {e}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(format!("failed to create {}: {e}", parent.display())))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to replace {}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), "store saved");
        Ok(())
    }

    /// Record (or update) an item's metadata.
    pub async fn register(&self, item: CandidateItem) -> Result<(), StoreError> {
        self.catalog.write().await.insert(item.item_id.clone(), item);
        self.save().await
    }

    pub async fn forget(&self, item: &ItemId) -> Result<(), StoreError> {
        self.catalog.write().await.remove(item);
        self.save().await
    }

    pub async fn lookup(&self, item: &ItemId) -> Option<CandidateItem> {
        self.catalog.read().await.get(item).cloned()
    }

    pub async fn contains(&self, item: &ItemId) -> bool {
        self.catalog.read().await.contains_key(item)
    }

    /// Metadata for `ids`, falling back to the id as the title.
    pub async fn candidates(&self, ids: impl IntoIterator<Item = &ItemId>) -> Vec<CandidateItem> {
        let catalog = self.catalog.read().await;
        ids.into_iter()
            .map(|id| catalog.get(id).cloned().unwrap_or_else(|| CandidateItem::new(id.clone(), id.to_string())))
            .collect()
    }
}

#[async_trait]
impl OrderedStore for JsonFileStore {
    async fn fetch_ranked_items(&self, user: &UserId) -> Result<Vec<RankedItem>, StoreError> {
        self.rows.fetch_ranked_items(user).await
    }

    async fn fetch_unranked_items(&self, user: &UserId) -> Result<Vec<ItemId>, StoreError> {
        self.rows.fetch_unranked_items(user).await
    }

    async fn set_position(&self, user: &UserId, item: &ItemId, position: Option<u32>) -> Result<(), StoreError> {
        self.rows.set_position(user, item, position).await?;
        self.save().await
    }

    async fn insert_at(&self, user: &UserId, item: &ItemId, position: u32) -> Result<(), StoreError> {
        self.rows.insert_at(user, item, position).await?;
        self.save().await
    }

    async fn delete_item(&self, user: &UserId, item: &ItemId) -> Result<(), StoreError> {
        self.rows.delete_item(user, item).await?;
        self.save().await
    }

    async fn clear_all_positions(&self, user: &UserId) -> Result<(), StoreError> {
        self.rows.clear_all_positions(user).await?;
        self.save().await
    }
}
