use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::eid::Eid;

pub fn now_ms() -> i64 {
    let since_the_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards");
    since_the_epoch.as_millis() as i64
}

/// What was captured. Immutable after ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Text,
    Image,
    File,
    Link,
}

/// Classification tag, derived at ingest. Enrichment may move an item out of
/// `Documents` when a more specific rule fires; nothing else changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Ideas,
    Links,
    Code,
    Notes,
    Images,
    Documents,
    Videos,
    Csv,
    Text,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Ideas => "ideas",
            Category::Links => "links",
            Category::Code => "code",
            Category::Notes => "notes",
            Category::Images => "images",
            Category::Documents => "documents",
            Category::Videos => "videos",
            Category::Csv => "csv",
            Category::Text => "text",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn source_overlay() -> String {
    "overlay".to_string()
}

/// Semi-structured metadata bag. Recognised keys are typed fields; anything
/// an enrichment stage adds beyond them survives in `extra` untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_ref: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_keywords: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_summary: Option<String>,

    #[serde(default = "source_overlay")]
    pub source: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ItemMeta {
    fn default() -> Self {
        ItemMeta {
            filename: None,
            size_bytes: None,
            thumbnail_ref: None,
            page_count: None,
            author: None,
            doc_title: None,
            creation_date: None,
            extracted_text: None,
            caption: None,
            url: None,
            page_title: None,
            llm_title: None,
            llm_keywords: None,
            llm_summary: None,
            source: source_overlay(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: Eid,
    pub kind: ItemKind,
    pub category: Category,

    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,

    #[serde(default)]
    pub damaged: bool,

    #[serde(default)]
    pub metadata: ItemMeta,

    #[serde(default)]
    pub searchable_text: String,
}

/// Merge patch applied by enrichment (and the damage marker). Every `Some`
/// wins over the stored value; `metadata` merges field-by-field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub searchable_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damaged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ItemMeta>,
}

impl Item {
    fn apply(&mut self, patch: ItemPatch) {
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(category) = patch.category {
            self.category = category;
        }
        if let Some(mime_type) = patch.mime_type {
            self.mime_type = Some(mime_type);
        }
        if let Some(searchable_text) = patch.searchable_text {
            self.searchable_text = searchable_text;
        }
        if let Some(damaged) = patch.damaged {
            self.damaged = damaged;
        }
        if let Some(meta) = patch.metadata {
            merge_meta(&mut self.metadata, meta);
        }
        self.updated_at = now_ms();
    }
}

fn merge_meta(into: &mut ItemMeta, from: ItemMeta) {
    macro_rules! take {
        ($field:ident) => {
            if from.$field.is_some() {
                into.$field = from.$field;
            }
        };
    }
    take!(filename);
    take!(size_bytes);
    take!(thumbnail_ref);
    take!(page_count);
    take!(author);
    take!(doc_title);
    take!(creation_date);
    take!(extracted_text);
    take!(caption);
    take!(url);
    take!(page_title);
    take!(llm_title);
    take!(llm_keywords);
    take!(llm_summary);
    for (key, value) in from.extra {
        into.extra.insert(key, value);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("item {0} not found")]
    NotFound(Eid),

    #[error("item {0} already exists")]
    DuplicateId(Eid),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("items file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Persistent record of all items. Single writer; readers see snapshots.
pub trait ItemIndex: Send + Sync {
    fn insert(&self, item: Item) -> Result<(), StoreError>;
    fn get(&self, id: &Eid) -> Result<Item, StoreError>;
    /// All items ordered by `created_at` descending.
    fn list(&self) -> Result<Vec<Item>, StoreError>;
    fn update(&self, id: &Eid, patch: ItemPatch) -> Result<Item, StoreError>;
    /// Removes and returns the record so the caller can garbage-collect blobs.
    fn delete(&self, id: &Eid) -> Result<Item, StoreError>;
    /// Number of items whose `hash` equals the given blob hash.
    fn count_references(&self, hash: &str) -> Result<usize, StoreError>;
}

/// JSON-file backed index. The whole record set is held in memory and
/// rewritten atomically (temp file, then rename) on every mutation.
pub struct IndexJson {
    path: PathBuf,
    items: Arc<RwLock<Vec<Item>>>,
}

impl IndexJson {
    pub fn load(path: PathBuf) -> Result<Self, StoreError> {
        let items = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            items: Arc::new(RwLock::new(items)),
        })
    }

    fn save(&self, items: &[Item]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, serde_json::to_vec(items)?)?;
        std::fs::rename(&temp, &self.path)?;

        Ok(())
    }
}

impl ItemIndex for IndexJson {
    fn insert(&self, item: Item) -> Result<(), StoreError> {
        let mut items = self.items.write().unwrap();

        if items.iter().any(|i| i.id == item.id) {
            return Err(StoreError::DuplicateId(item.id));
        }

        items.push(item);
        self.save(&items)
    }

    fn get(&self, id: &Eid) -> Result<Item, StoreError> {
        self.items
            .read()
            .unwrap()
            .iter()
            .find(|i| i.id == *id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn list(&self) -> Result<Vec<Item>, StoreError> {
        let mut items = self.items.read().unwrap().clone();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(items)
    }

    fn update(&self, id: &Eid, patch: ItemPatch) -> Result<Item, StoreError> {
        let mut items = self.items.write().unwrap();

        let item = items
            .iter_mut()
            .find(|i| i.id == *id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        item.apply(patch);
        let updated = item.clone();

        self.save(&items)?;
        Ok(updated)
    }

    fn delete(&self, id: &Eid) -> Result<Item, StoreError> {
        let mut items = self.items.write().unwrap();

        let idx = items
            .iter()
            .position(|i| i.id == *id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let removed = items.remove(idx);
        self.save(&items)?;
        Ok(removed)
    }

    fn count_references(&self, hash: &str) -> Result<usize, StoreError> {
        Ok(self
            .items
            .read()
            .unwrap()
            .iter()
            .filter(|i| i.hash.as_deref() == Some(hash))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_index() -> (IndexJson, PathBuf) {
        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "dv-items-test-{}-{}.json",
            std::process::id(),
            counter
        ));
        let _ = std::fs::remove_file(&path);
        (IndexJson::load(path.clone()).unwrap(), path)
    }

    fn text_item(title: &str) -> Item {
        Item {
            id: Eid::new(),
            kind: ItemKind::Text,
            category: Category::Notes,
            title: title.to_string(),
            content: Some(title.to_string()),
            blob_ref: None,
            hash: None,
            mime_type: None,
            created_at: now_ms(),
            updated_at: now_ms(),
            damaged: false,
            metadata: ItemMeta::default(),
            searchable_text: title.to_lowercase(),
        }
    }

    #[test]
    fn test_insert_then_get() {
        let (index, path) = temp_index();
        let item = text_item("hello");
        let id = item.id.clone();

        index.insert(item).unwrap();
        assert_eq!(index.get(&id).unwrap().title, "hello");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let (index, path) = temp_index();
        let item = text_item("one");
        index.insert(item.clone()).unwrap();

        let result = index.insert(item);
        assert!(matches!(result, Err(StoreError::DuplicateId(_))));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_list_is_created_at_desc() {
        let (index, path) = temp_index();

        let mut first = text_item("first");
        first.created_at = 100;
        let mut second = text_item("second");
        second.created_at = 200;

        index.insert(first).unwrap();
        index.insert(second).unwrap();

        let listed = index.list().unwrap();
        assert_eq!(listed[0].title, "second");
        assert_eq!(listed[1].title, "first");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_update_merges_and_bumps_updated_at() {
        let (index, path) = temp_index();
        let mut item = text_item("draft");
        item.updated_at = 0;
        let id = item.id.clone();
        index.insert(item).unwrap();

        let mut meta = ItemMeta::default();
        meta.extracted_text = Some("body".to_string());

        let patch = ItemPatch {
            title: Some("final".to_string()),
            metadata: Some(meta),
            ..Default::default()
        };
        let updated = index.update(&id, patch).unwrap();

        assert_eq!(updated.title, "final");
        assert_eq!(updated.metadata.extracted_text.as_deref(), Some("body"));
        assert!(updated.updated_at > 0);
        // untouched fields survive
        assert_eq!(updated.content.as_deref(), Some("draft"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_unknown_metadata_keys_survive_round_trip() {
        let (index, path) = temp_index();
        let mut item = text_item("bag");
        item.metadata
            .extra
            .insert("exif_camera".to_string(), serde_json::json!("X100"));
        let id = item.id.clone();
        index.insert(item).unwrap();

        let reloaded = IndexJson::load(path.clone()).unwrap();
        let got = reloaded.get(&id).unwrap();
        assert_eq!(got.metadata.extra["exif_camera"], "X100");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_count_references() {
        let (index, path) = temp_index();

        let mut a = text_item("a");
        a.hash = Some("deadbeef".to_string());
        let mut b = text_item("b");
        b.hash = Some("deadbeef".to_string());
        let c = text_item("c");

        index.insert(a).unwrap();
        index.insert(b).unwrap();
        index.insert(c).unwrap();

        assert_eq!(index.count_references("deadbeef").unwrap(), 2);
        assert_eq!(index.count_references("cafebabe").unwrap(), 0);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_delete_returns_record() {
        let (index, path) = temp_index();
        let item = text_item("gone");
        let id = item.id.clone();
        index.insert(item).unwrap();

        let removed = index.delete(&id).unwrap();
        assert_eq!(removed.title, "gone");
        assert!(matches!(index.get(&id), Err(StoreError::NotFound(_))));

        let _ = std::fs::remove_file(&path);
    }
}
