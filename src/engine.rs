//! The engine facade: ingest, search, list, delete.
//!
//! Orchestrates the content store, item index, semantic index, and the
//! enrichment queue. A successful `ingest_*` return means the blob and the
//! record are durable and an initial embedding was attempted; enrichment
//! runs strictly afterwards, off the capture path.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};

use crate::{
    blobstore::{ext_of, BlobError, BlobStore},
    config::{Config, Paths},
    eid::Eid,
    enrich::{self, EnrichCtx, QueueStore, Task},
    errors::EngineError,
    items::{self, Category, IndexJson, Item, ItemIndex, ItemKind, ItemMeta, StoreError},
    llm::LlmClient,
    overlay::validate,
    semantic::{
        compose_searchable_text, Embedder, IndexError, SearchableParts, SemanticError,
        SemanticService,
    },
};

/// Longest title derived from free text
const MAX_TITLE_LEN: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    ItemsUpdated,
}

/// One-way notification channel from the engine to its subscribers. The UI
/// surface long-polls this; handlers never call back into the engine.
pub struct Notifier {
    subscribers: Mutex<Vec<mpsc::Sender<EngineEvent>>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn items_updated(&self) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(EngineEvent::ItemsUpdated).is_ok());
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub item: Item,
    pub score: f32,
}

pub struct Engine {
    items: Arc<dyn ItemIndex>,
    blobs: Arc<BlobStore>,
    semantic: Arc<SemanticService>,
    llm: Option<Arc<LlmClient>>,
    notifier: Arc<Notifier>,
    queue_store: Arc<QueueStore>,

    task_tx: Option<mpsc::Sender<Task>>,
    task_queue_handle: Option<std::thread::JoinHandle<()>>,
    enrich_workers: u16,
}

impl Engine {
    pub fn new(
        paths: &Paths,
        config: &Config,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Engine, EngineError> {
        paths.ensure_dirs()?;

        let items = Arc::new(IndexJson::load(paths.items.clone())?);
        let blobs = Arc::new(BlobStore::open(paths.blobs.clone(), paths.thumbnails.clone())?);
        let semantic = Arc::new(SemanticService::new(embedder, paths.embeddings.clone()));
        let llm = LlmClient::from_config(&config.llm).map(Arc::new);
        let queue_store = Arc::new(QueueStore::new(paths.task_queue.clone()));

        Ok(Engine {
            items,
            blobs,
            semantic,
            llm,
            notifier: Arc::new(Notifier::new()),
            queue_store,
            task_tx: None,
            task_queue_handle: None,
            enrich_workers: config.enrich_workers,
        })
    }

    /// Start the enrichment queue: restore tasks interrupted by a crash,
    /// then backfill embeddings for any item missing one. Both run in the
    /// enrichment context, never on the query path.
    pub fn run_queue(&mut self) {
        let (task_tx, task_rx) = mpsc::channel::<Task>();

        let ctx = Arc::new(EnrichCtx {
            items: self.items.clone(),
            blobs: self.blobs.clone(),
            semantic: self.semantic.clone(),
            llm: self.llm.clone(),
            notifier: self.notifier.clone(),
        });

        std::thread::spawn({
            let queue_store = self.queue_store.clone();
            let task_tx = task_tx.clone();
            let items = self.items.clone();
            let semantic = self.semantic.clone();
            move || {
                queue_store.restore_interrupted(&task_tx);
                backfill_missing_embeddings(&items, &semantic, &task_tx);
            }
        });

        let handle = std::thread::spawn({
            let ctx = ctx.clone();
            let store = self.queue_store.clone();
            let task_tx = task_tx.clone();
            let max_workers = self.enrich_workers;
            move || {
                enrich::start_queue(task_rx, task_tx, ctx, store, max_workers);
            }
        });

        self.task_queue_handle = Some(handle);
        self.task_tx = Some(task_tx);
    }

    pub fn subscribe(&self) -> mpsc::Receiver<EngineEvent> {
        self.notifier.subscribe()
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    // MARK: - Ingest

    pub fn ingest_text(&self, text: &str) -> Result<Item, EngineError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(EngineError::InvalidInput("empty text".to_string()));
        }

        let category = validate::classify_text(trimmed);
        if category == Category::Links {
            // pasted text that is a bare URL becomes a link item
            return self.ingest_link(trimmed, None);
        }

        let title = derive_title(trimmed);
        let searchable = compose_searchable_text(&SearchableParts {
            title: &title,
            content: Some(trimmed),
            ..Default::default()
        });

        let item = Item {
            id: Eid::new(),
            kind: ItemKind::Text,
            category,
            title,
            content: Some(trimmed.to_string()),
            blob_ref: None,
            hash: None,
            mime_type: Some("text/plain".to_string()),
            created_at: items::now_ms(),
            updated_at: items::now_ms(),
            damaged: false,
            metadata: ItemMeta::default(),
            searchable_text: searchable,
        };

        self.items.insert(item.clone())?;
        let embedded = self.write_initial_embedding(&item);

        // text items only need the pipeline for LLM extras or a missed embedding
        if self.llm.is_some() || !embedded {
            self.enqueue_enrich(&item.id);
        }

        self.notifier.items_updated();
        Ok(item)
    }

    pub fn ingest_link(&self, url: &str, title: Option<&str>) -> Result<Item, EngineError> {
        let url = url.trim();
        if !validate::URL_RE.is_match(url) {
            return Err(EngineError::InvalidInput(format!("not a url: {url}")));
        }

        let title = match title {
            Some(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => link_title(url),
        };

        let mut metadata = ItemMeta::default();
        metadata.url = Some(url.to_string());
        metadata.page_title = Some(title.clone());

        let searchable = compose_searchable_text(&SearchableParts {
            title: &title,
            ..Default::default()
        });

        let item = Item {
            id: Eid::new(),
            kind: ItemKind::Link,
            category: Category::Links,
            title,
            content: None,
            blob_ref: None,
            hash: None,
            mime_type: None,
            created_at: items::now_ms(),
            updated_at: items::now_ms(),
            damaged: false,
            metadata,
            searchable_text: searchable,
        };

        self.items.insert(item.clone())?;
        let embedded = self.write_initial_embedding(&item);
        if !embedded {
            self.enqueue_enrich(&item.id);
        }

        self.notifier.items_updated();
        Ok(item)
    }

    pub fn ingest_file(&self, path: &Path) -> Result<Item, EngineError> {
        if !path.is_file() {
            return Err(EngineError::InvalidInput(format!(
                "no file at {}",
                path.display()
            )));
        }

        // re-derive the category ourselves; the controller is trusted but
        // this is the last line of defence
        let category = validate::classify_path(path).map_err(EngineError::FileRejected)?;

        let bytes = std::fs::read(path)?;
        let ext = ext_of(path);

        // once the store accepts the bytes, ingest is uncancellable; if the
        // record insert fails below, the blob is an orphan for the sweep
        let hash = self.blobs.put(&bytes, ext.as_deref())?;

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.clone());

        let mut metadata = ItemMeta::default();
        metadata.filename = Some(filename.clone());
        metadata.size_bytes = Some(bytes.len() as u64);

        let searchable = compose_searchable_text(&SearchableParts {
            title: &title,
            filename: Some(&filename),
            ..Default::default()
        });

        let kind = if category == Category::Images {
            ItemKind::Image
        } else {
            ItemKind::File
        };

        let item = Item {
            id: Eid::new(),
            kind,
            category,
            title,
            content: None,
            blob_ref: Some(hash.clone()),
            hash: Some(hash),
            mime_type: ext.as_deref().and_then(validate::mime_from_ext).map(String::from),
            created_at: items::now_ms(),
            updated_at: items::now_ms(),
            damaged: false,
            metadata,
            searchable_text: searchable,
        };

        self.items.insert(item.clone())?;
        self.write_initial_embedding(&item);
        self.enqueue_enrich(&item.id);

        self.notifier.items_updated();
        Ok(item)
    }

    /// Fallback for hosts that can't hand over a path: materialise the bytes
    /// as a temp file, then ingest it like any other drop.
    pub fn ingest_bytes(&self, filename: &str, bytes: &[u8]) -> Result<Item, EngineError> {
        let safe_name = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| EngineError::InvalidInput(format!("bad filename: {filename}")))?;

        let dir = std::env::temp_dir().join(format!("dv-drop-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let temp = dir.join(&safe_name);
        std::fs::write(&temp, bytes)?;

        let result = self.ingest_file(&temp);
        let _ = std::fs::remove_file(&temp);
        result
    }

    // MARK: - Query

    /// Top-k semantic search. Damaged items are omitted; scoring is pure
    /// cosine similarity with the index's deterministic tie-breaks.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, EngineError> {
        let hits = match self.semantic.query(query, k) {
            Ok(hits) => hits,
            // an unavailable embedder degrades search, it doesn't break it
            Err(SemanticError::Embedding(err)) => {
                log::warn!("semantic search unavailable: {err}");
                return Ok(Vec::new());
            }
            Err(SemanticError::Index(IndexError::DimensionMismatch { expected, got })) => {
                return Err(EngineError::Corruption(format!(
                    "embedding dimension mismatch: expected {expected}, got {got}"
                )));
            }
            Err(err) => return Err(EngineError::Other(err.into())),
        };

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            match self.items.get(&hit.id) {
                Ok(item) if item.damaged => {}
                Ok(item) => results.push(SearchHit {
                    item,
                    score: hit.score,
                }),
                Err(StoreError::NotFound(id)) => {
                    log::warn!("embedding refers to missing item {id}");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(results)
    }

    pub fn list(&self, filter: Option<Category>) -> Result<Vec<Item>, EngineError> {
        let mut listed = self.items.list()?;
        if let Some(category) = filter {
            listed.retain(|i| i.category == category);
        }
        Ok(listed)
    }

    pub fn get(&self, id: &Eid) -> Result<Item, EngineError> {
        Ok(self.items.get(id)?)
    }

    // MARK: - Delete & sweep

    /// Remove the record and its embedding; when the last reference to a
    /// blob goes, the blob and its derived artifacts go with it.
    pub fn delete(&self, id: &Eid) -> Result<(), EngineError> {
        let removed = self.items.delete(id)?;

        if let Err(err) = self.semantic.remove(id) {
            log::warn!("failed to drop embedding for {id}: {err}");
        }

        if let Some(hash) = &removed.hash {
            if self.items.count_references(hash)? == 0 {
                self.blobs.remove(hash)?;
            }
        }

        self.notifier.items_updated();
        Ok(())
    }

    /// Reclaim blobs orphaned by ingests that died between the content store
    /// and the record insert.
    pub fn sweep(&self) -> Result<usize, EngineError> {
        let referenced: HashSet<String> = self
            .items
            .list()?
            .into_iter()
            .filter_map(|i| i.hash)
            .collect();

        Ok(self.blobs.sweep(&referenced)?)
    }

    // MARK: - Lifecycle

    pub fn shutdown(&self) {
        if let Some(tx) = &self.task_tx {
            if let Err(err) = tx.send(Task::Shutdown) {
                log::error!("{err}");
            }
        }
    }

    pub fn wait_queue_finish(&mut self) {
        if let Some(handle) = self.task_queue_handle.take() {
            if handle.join().is_err() {
                log::error!("enrichment queue panicked");
            }
        }
    }

    fn write_initial_embedding(&self, item: &Item) -> bool {
        match self
            .semantic
            .upsert(&item.id, item.created_at, &item.searchable_text)
        {
            Ok(()) => true,
            Err(err) => {
                log::warn!("initial embedding failed for {}: {err}", item.id);
                false
            }
        }
    }

    fn enqueue_enrich(&self, item_id: &Eid) {
        let task = Task::Enrich {
            item_id: item_id.clone(),
        };

        match &self.task_tx {
            Some(tx) => {
                if let Err(err) = tx.send(task) {
                    log::error!("failed to enqueue enrichment: {err}");
                }
            }
            // no dispatcher in this process: persist the task so the next
            // daemon start restores it
            None => {
                self.queue_store.save_task(task, enrich::Status::Pending);
            }
        }
    }
}

/// One-shot startup migration: any item without a vector gets re-enqueued.
fn backfill_missing_embeddings(
    items: &Arc<dyn ItemIndex>,
    semantic: &Arc<SemanticService>,
    task_tx: &mpsc::Sender<Task>,
) {
    if semantic.embedder().dimensions() == 0 {
        return;
    }

    let embedded: HashSet<Eid> = match semantic.ids() {
        Ok(ids) => ids.into_iter().collect(),
        Err(err) => {
            log::error!("embedding backfill skipped: {err}");
            return;
        }
    };

    let listed = match items.list() {
        Ok(listed) => listed,
        Err(err) => {
            log::error!("embedding backfill skipped: {err}");
            return;
        }
    };

    for item in listed {
        if item.damaged || embedded.contains(&item.id) {
            continue;
        }
        log::info!("backfilling embedding for {}", item.id);
        let _ = task_tx.send(Task::Enrich { item_id: item.id });
    }
}

fn derive_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or_default().trim();
    if first_line.chars().count() <= MAX_TITLE_LEN {
        return first_line.to_string();
    }
    first_line.chars().take(MAX_TITLE_LEN).collect()
}

/// Noise parts dropped when deriving a link title from its URL.
const URL_NOISE: &[&str] = &[
    "www", "com", "org", "net", "io", "dev", "co", "html", "htm", "php", "index",
];

/// Human-readable title for a bare URL: meaningful host and path words.
fn link_title(url: &str) -> String {
    let normalized = if url.starts_with("www.") {
        format!("https://{url}")
    } else {
        url.to_string()
    };

    let parsed = match url::Url::parse(&normalized) {
        Ok(p) => p,
        Err(_) => return url.to_string(),
    };

    let mut words: Vec<String> = Vec::new();

    if let Some(host) = parsed.host_str() {
        for part in host.split('.') {
            if !part.is_empty() && !URL_NOISE.contains(&part) {
                words.push(part.to_string());
            }
        }
    }

    for segment in parsed.path().split('/') {
        for word in segment.split(['-', '_', '.']) {
            if word.len() >= 2 && !URL_NOISE.contains(&word) {
                words.push(word.to_string());
            }
        }
    }

    if words.is_empty() {
        return url.to_string();
    }
    words.join(" ")
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::NotFound(id.to_string()),
            StoreError::DuplicateId(id) => EngineError::DuplicateId(id.to_string()),
            StoreError::Io(err) => EngineError::Io(err),
            StoreError::Malformed(err) => EngineError::Corruption(err.to_string()),
        }
    }
}

impl From<BlobError> for EngineError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::Io(err) => EngineError::Io(err),
            BlobError::MissingBlob(hash) => {
                EngineError::Corruption(format!("missing blob {hash}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_title_takes_first_line() {
        assert_eq!(derive_title("line one\nline two"), "line one");

        let long = "x".repeat(200);
        assert_eq!(derive_title(&long).chars().count(), MAX_TITLE_LEN);
    }

    #[test]
    fn test_link_title_extracts_words() {
        assert_eq!(link_title("https://example.com/docs"), "example docs");
        assert_eq!(
            link_title("https://blog.rust-lang.org/inside-rust"),
            "blog rust-lang inside rust"
        );
        assert_eq!(link_title("www.example.com"), "example");
    }
}
