//! Background enrichment pipeline.
//!
//! Ingest enqueues one task per item onto an mpsc queue; a dispatcher thread
//! hands tasks to worker threads bounded by a counter. Workers never hold the
//! item index lock across blocking work: they load, mutate, and write back in
//! discrete transactions. The queue is dumped to `task-queue.json` so tasks
//! interrupted by a crash restart on the next boot.
//!
//! A task fails at most once; failed tasks are logged and dropped. Stage
//! failures are confined to the stage: OCR dying never loses the thumbnail.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU16, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::sleep,
    time::Duration,
};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{
    blobstore::{BlobStore, DerivedKind},
    eid::Eid,
    engine::Notifier,
    extract,
    images,
    items::{self, Category, Item, ItemIndex, ItemKind, ItemMeta, ItemPatch},
    llm::LlmClient,
    semantic::{compose_searchable_text, SearchableParts, SemanticService},
};

const OCR_TIMEOUT: Duration = Duration::from_secs(30);
const COVER_TIMEOUT: Duration = Duration::from_secs(15);
const POSTER_TIMEOUT: Duration = Duration::from_secs(15);

/// How many leading bytes the format probe reads
const PROBE_BYTES: usize = 8192;

// probed once; spawning a --version check per item would be wasteful
static HAS_TESSERACT: Lazy<bool> = Lazy::new(|| extract::tool_available("tesseract"));
static HAS_PDFTOPPM: Lazy<bool> = Lazy::new(|| extract::tool_available("pdftoppm"));
static HAS_FFMPEG: Lazy<bool> = Lazy::new(|| extract::tool_available("ffmpeg"));

/// Everything a worker needs to run the pipeline stages.
pub struct EnrichCtx {
    pub items: Arc<dyn ItemIndex>,
    pub blobs: Arc<BlobStore>,
    pub semantic: Arc<SemanticService>,
    pub llm: Option<Arc<LlmClient>>,
    pub notifier: Arc<Notifier>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Task {
    /// enrich a single item (metadata, previews, embedding refresh)
    Enrich { item_id: Eid },

    /// request to gracefully shut down the queue
    Shutdown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Status {
    Pending,
    InProgress,
    Done,
    Error(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDump {
    pub id: Eid,
    pub task: Task,
    pub status: Status,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueDump {
    pub queue: Vec<TaskDump>,
    pub now: i64,
}

/// Persistent mirror of the in-memory queue.
pub struct QueueStore {
    path: std::path::PathBuf,
}

impl QueueStore {
    pub fn new(path: std::path::PathBuf) -> Self {
        Self { path }
    }

    pub fn read_dump(&self) -> QueueDump {
        fn empty() -> QueueDump {
            QueueDump {
                queue: vec![],
                now: items::now_ms(),
            }
        }

        match std::fs::read(&self.path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|err| {
                log::error!("task queue dump is malformed, dropping it: {err}");
                empty()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => empty(),
            Err(err) => {
                log::error!("failed to read queue dump: {err}");
                empty()
            }
        }
    }

    pub fn write_dump(&self, dump: &QueueDump) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let temp = self.path.with_extension("json.tmp");
            std::fs::write(&temp, serde_json::to_vec(dump)?)?;
            std::fs::rename(&temp, &self.path)
        };
        if let Err(err) = write() {
            log::error!("failed to write queue dump: {err}");
        }
    }

    pub fn save_task(&self, task: Task, status: Status) -> Eid {
        let eid = Eid::new();
        let mut dump = self.read_dump();
        dump.queue.push(TaskDump {
            id: eid.clone(),
            task,
            status,
        });
        dump.now = items::now_ms();
        self.write_dump(&dump);
        eid
    }

    pub fn set_status(&self, id: &Eid, status: Status) {
        let mut dump = self.read_dump();
        if let Some(task_dump) = dump.queue.iter_mut().find(|td| td.id == *id) {
            task_dump.status = status;
        }
        dump.now = items::now_ms();
        self.write_dump(&dump);
    }

    pub fn remove_task(&self, id: &Eid) {
        let mut dump = self.read_dump();
        dump.queue.retain(|td| td.id != *id);
        dump.now = items::now_ms();
        self.write_dump(&dump);
    }

    /// Drain the persisted queue and re-send everything that never finished.
    /// Called once on startup before the dispatcher starts.
    pub fn restore_interrupted(&self, task_tx: &mpsc::Sender<Task>) {
        let mut dump = self.read_dump();
        let pending = std::mem::take(&mut dump.queue);
        dump.now = items::now_ms();
        self.write_dump(&dump);

        for task_dump in pending {
            if let Status::Done = task_dump.status {
                continue;
            }

            log::info!("restarting interrupted task {:?}", task_dump.task);
            if let Err(err) = task_tx.send(task_dump.task) {
                log::error!("failed to restore interrupted task: {err:?}");
            }
        }
    }
}

fn throttle(counter: &Arc<AtomicU16>, max_workers: u16) {
    while counter.load(Ordering::Relaxed) >= max_workers.max(1) {
        sleep(Duration::from_millis(100));
    }
}

/// Dispatcher loop. Blocks until a `Shutdown` task arrives and all workers
/// have drained; run it on a dedicated thread.
pub fn start_queue(
    task_rx: mpsc::Receiver<Task>,
    task_tx: mpsc::Sender<Task>,
    ctx: Arc<EnrichCtx>,
    store: Arc<QueueStore>,
    max_workers: u16,
) {
    let thread_ctr = Arc::new(AtomicU16::new(0));
    let in_flight: Arc<Mutex<HashSet<Eid>>> = Arc::new(Mutex::new(HashSet::new()));

    log::debug!("enrichment queue waiting for work");
    while let Ok(task) = task_rx.recv() {
        if let Task::Shutdown = &task {
            while thread_ctr.load(Ordering::Relaxed) > 0 {
                sleep(Duration::from_millis(100));
            }
            return;
        }

        // at most one worker touches a given item at a time
        if let Task::Enrich { item_id } = &task {
            let mut guard = in_flight.lock().unwrap();
            if guard.contains(item_id) {
                drop(guard);
                sleep(Duration::from_millis(100));
                let _ = task_tx.send(task);
                continue;
            }
            guard.insert(item_id.clone());
        }

        let released_id = match &task {
            Task::Enrich { item_id } => Some(item_id.clone()),
            Task::Shutdown => None,
        };

        let id = store.save_task(task.clone(), Status::Pending);

        // bound concurrency here, before the counter is bumped, so a
        // Shutdown arriving next can't observe a not-yet-started worker
        throttle(&thread_ctr, max_workers);
        thread_ctr.fetch_add(1, Ordering::Relaxed);

        let task_handle = std::thread::spawn({
            let ctx = ctx.clone();
            let store = store.clone();
            let id = id.clone();
            move || {
                store.set_status(&id, Status::InProgress);

                let status = task.run(&ctx);
                store.set_status(&id, status);

                // remove a bit later so clients can observe the outcome
                let store = store.clone();
                std::thread::spawn(move || {
                    sleep(Duration::from_secs(10));
                    store.remove_task(&id);
                });
            }
        });

        // watchdog: release the in-flight slot even if the worker panicked
        std::thread::spawn({
            let thread_counter = thread_ctr.clone();
            let in_flight = in_flight.clone();
            let store = store.clone();
            move || {
                if let Err(err) = task_handle.join() {
                    log::error!("enrichment worker panicked: {err:?}");
                    store.remove_task(&id);
                }

                if let Some(item_id) = released_id {
                    in_flight.lock().unwrap().remove(&item_id);
                }
                thread_counter.fetch_sub(1, Ordering::Relaxed);
            }
        });
    }
}

impl Task {
    pub fn run(&self, ctx: &EnrichCtx) -> Status {
        match self {
            Task::Enrich { item_id } => {
                let item = match ctx.items.get(item_id) {
                    Ok(item) => item,
                    Err(err) => return Status::Error(err.to_string()),
                };

                match enrich_item(&item, ctx) {
                    Ok(()) => Status::Done,
                    Err(err) => Status::Error(err.to_string()),
                }
            }
            Task::Shutdown => unreachable!(),
        }
    }
}

/// The per-item pipeline. Stage order matters; stage failures do not.
fn enrich_item(item: &Item, ctx: &EnrichCtx) -> anyhow::Result<()> {
    let mut meta = ItemMeta::default();
    let mut category = None;

    if let Some(hash) = &item.hash {
        let blob_path = match ctx.blobs.path_of(hash) {
            Ok(path) => path,
            Err(err) => {
                // the record points at bytes we cannot produce: mark damaged,
                // exclude from search, no automatic repair
                let _ = ctx.items.update(
                    &item.id,
                    ItemPatch {
                        damaged: Some(true),
                        ..Default::default()
                    },
                );
                let _ = ctx.semantic.remove(&item.id);
                ctx.notifier.items_updated();
                anyhow::bail!("storage corruption for item {}: {err}", item.id);
            }
        };

        stage_probe(&blob_path, &mut meta);

        if item.category == Category::Images {
            if let Err(err) = stage_thumbnail(hash, &blob_path, ctx, &mut meta) {
                log::warn!("thumbnail stage failed for {}: {err}", item.id);
            }
        }

        if item.category == Category::Documents && has_ext(&blob_path, "pdf") {
            if let Err(err) = stage_pdf(hash, &blob_path, ctx, &mut meta) {
                log::warn!("pdf stage failed for {}: {err}", item.id);
            }
        }

        if matches!(item.category, Category::Documents | Category::Csv)
            && ["txt", "csv", "tsv"].iter().any(|e| has_ext(&blob_path, e))
        {
            match extract::plain_text(&blob_path) {
                Ok(text) => meta.extracted_text = Some(text),
                Err(err) => log::warn!("text stage failed for {}: {err}", item.id),
            }
        }

        if item.category == Category::Images {
            if let Err(err) = stage_ocr_caption(&blob_path, item, &mut meta) {
                log::warn!("ocr stage failed for {}: {err}", item.id);
            }
        }

        if item.category == Category::Videos {
            if let Err(err) = stage_poster(hash, &blob_path, ctx, &mut meta) {
                log::warn!("poster stage failed for {}: {err}", item.id);
            }
        }
    }

    if let Some(llm) = &ctx.llm {
        if let Err(err) = stage_llm(llm, item, &mut meta) {
            log::warn!("llm stage failed for {}: {err}", item.id);
        }
    }

    // category refinement: only Documents may become more specific
    if item.category == Category::Documents {
        if let Some(text) = &meta.extracted_text {
            if looks_like_delimited_rows(text) {
                category = Some(Category::Csv);
            }
        }
    }

    // write metadata back in one transaction, then rebuild the searchable
    // text from the merged record
    let merged = ctx.items.update(
        &item.id,
        ItemPatch {
            category,
            metadata: Some(meta),
            ..Default::default()
        },
    )?;

    let searchable = compose_searchable_text(&SearchableParts {
        title: &merged.title,
        content: merged.content.as_deref(),
        filename: merged.metadata.filename.as_deref(),
        extracted_text: merged.metadata.extracted_text.as_deref(),
        caption: merged.metadata.caption.as_deref(),
        llm_title: merged.metadata.llm_title.as_deref(),
        llm_keywords: merged.metadata.llm_keywords.as_deref(),
        llm_summary: merged.metadata.llm_summary.as_deref(),
    });

    let merged = ctx.items.update(
        &item.id,
        ItemPatch {
            searchable_text: Some(searchable.clone()),
            ..Default::default()
        },
    )?;

    // the embedding replaces the initial one written at ingest
    if let Err(err) = ctx
        .semantic
        .upsert(&merged.id, merged.created_at, &searchable)
    {
        log::warn!("embedding refresh failed for {}: {err}", merged.id);
    }

    ctx.notifier.items_updated();
    Ok(())
}

fn stage_probe(blob_path: &std::path::Path, meta: &mut ItemMeta) {
    if let Ok(stat) = std::fs::metadata(blob_path) {
        meta.size_bytes = Some(stat.len());
    }

    if let Ok(bytes) = read_prefix(blob_path, PROBE_BYTES) {
        if let Some(kind) = infer::get(&bytes) {
            meta.extra.insert(
                "probed_mime".to_string(),
                serde_json::Value::String(kind.mime_type().to_string()),
            );
        }
    }
}

fn stage_thumbnail(
    hash: &str,
    blob_path: &std::path::Path,
    ctx: &EnrichCtx,
    meta: &mut ItemMeta,
) -> anyhow::Result<()> {
    if ctx.blobs.has_derived(hash, DerivedKind::ImageThumb) {
        meta.thumbnail_ref = Some(DerivedKind::ImageThumb.file_name(hash));
        return Ok(());
    }

    let bytes = std::fs::read(blob_path)?;
    let thumb = images::thumbnail(&bytes, images::THUMB_WIDTH, images::THUMB_HEIGHT)?;
    let thumb_ref = ctx.blobs.put_derived(hash, DerivedKind::ImageThumb, &thumb)?;
    meta.thumbnail_ref = Some(thumb_ref);
    Ok(())
}

fn stage_pdf(
    hash: &str,
    blob_path: &std::path::Path,
    ctx: &EnrichCtx,
    meta: &mut ItemMeta,
) -> anyhow::Result<()> {
    let info = extract::pdf_info(blob_path)?;
    meta.page_count = Some(info.page_count);
    meta.author = info.author;
    meta.doc_title = info.title;
    meta.creation_date = info.creation_date;

    match extract::pdf_text(blob_path) {
        Ok(text) if !text.trim().is_empty() => meta.extracted_text = Some(text),
        Ok(_) => {}
        Err(err) => log::warn!("pdf body extraction failed: {err}"),
    }

    if ctx.blobs.has_derived(hash, DerivedKind::PdfCover) {
        meta.thumbnail_ref = Some(DerivedKind::PdfCover.file_name(hash));
    } else if *HAS_PDFTOPPM {
        match extract::pdf_cover(blob_path, COVER_TIMEOUT) {
            Ok(jpeg) => {
                let cover =
                    images::thumbnail(&jpeg, images::THUMB_WIDTH, images::THUMB_HEIGHT)?;
                let cover_ref = ctx.blobs.put_derived(hash, DerivedKind::PdfCover, &cover)?;
                meta.thumbnail_ref = Some(cover_ref);
            }
            Err(err) => log::debug!("pdf cover render skipped: {err}"),
        }
    }
    // no pdftoppm and no existing cover: leave thumbnail_ref unset

    Ok(())
}

fn stage_ocr_caption(
    blob_path: &std::path::Path,
    item: &Item,
    meta: &mut ItemMeta,
) -> anyhow::Result<()> {
    // deterministic caption first; OCR output is gravy
    let stem = blob_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let caption_base = item
        .metadata
        .filename
        .clone()
        .unwrap_or(stem);

    if let Ok(bytes) = std::fs::read(blob_path) {
        if let Ok((w, h)) = images::dimensions(&bytes) {
            meta.caption = Some(format!("{caption_base} ({w}x{h} image)"));
        }
    }
    if meta.caption.is_none() {
        meta.caption = Some(caption_base);
    }

    if *HAS_TESSERACT {
        match extract::ocr_image(blob_path, OCR_TIMEOUT) {
            Ok(text) if !text.trim().is_empty() => {
                meta.extracted_text = Some(text);
            }
            Ok(_) => {}
            // best-effort: a failed or timed-out OCR leaves the field empty
            Err(err) => log::debug!("ocr skipped: {err}"),
        }
    }

    Ok(())
}

fn stage_poster(
    hash: &str,
    blob_path: &std::path::Path,
    ctx: &EnrichCtx,
    meta: &mut ItemMeta,
) -> anyhow::Result<()> {
    if ctx.blobs.has_derived(hash, DerivedKind::VideoPoster) {
        meta.thumbnail_ref = Some(DerivedKind::VideoPoster.file_name(hash));
        return Ok(());
    }

    // the host may not expose a frame extractor at all
    if !*HAS_FFMPEG {
        return Ok(());
    }

    match extract::video_poster(blob_path, POSTER_TIMEOUT) {
        Ok(jpeg) => {
            let poster_ref = ctx.blobs.put_derived(hash, DerivedKind::VideoPoster, &jpeg)?;
            meta.thumbnail_ref = Some(poster_ref);
        }
        Err(err) => log::debug!("video poster skipped: {err}"),
    }

    Ok(())
}

fn stage_llm(llm: &LlmClient, item: &Item, meta: &mut ItemMeta) -> anyhow::Result<()> {
    match item.kind {
        ItemKind::Text => {
            let enrichment = llm.enrich_text(&item.title, item.content.as_deref())?;
            meta.llm_title = enrichment.title;
            meta.llm_keywords = enrichment.keywords;
            meta.llm_summary = enrichment.summary;
        }
        ItemKind::Image => {
            let ocr = meta
                .extracted_text
                .as_deref()
                .or(item.metadata.extracted_text.as_deref());
            let enrichment = llm.enrich_image(&item.title, ocr)?;
            if enrichment.caption.is_some() {
                meta.caption = enrichment.caption;
            }
            meta.llm_keywords = enrichment.keywords;
        }
        _ => {}
    }
    Ok(())
}

fn has_ext(path: &std::path::Path, ext: &str) -> bool {
    crate::blobstore::ext_of(path).as_deref() == Some(ext)
}

fn read_prefix(path: &std::path::Path, limit: usize) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let file = std::fs::File::open(path)?;
    let mut bytes = Vec::with_capacity(limit);
    file.take(limit as u64).read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// A body is "csv-shaped" when at least two lines agree on a delimiter count.
fn looks_like_delimited_rows(text: &str) -> bool {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let (first, second) = match (lines.next(), lines.next()) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };

    for delim in [',', '\t', ';'] {
        let a = first.matches(delim).count();
        let b = second.matches(delim).count();
        if a > 0 && a == b {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_store_round_trip() {
        let path = std::env::temp_dir().join(format!("dv-queue-test-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let store = QueueStore::new(path.clone());

        let id = store.save_task(
            Task::Enrich {
                item_id: Eid::new(),
            },
            Status::Pending,
        );

        let dump = store.read_dump();
        assert_eq!(dump.queue.len(), 1);
        assert!(matches!(dump.queue[0].status, Status::Pending));

        store.set_status(&id, Status::Done);
        assert!(matches!(store.read_dump().queue[0].status, Status::Done));

        store.remove_task(&id);
        assert!(store.read_dump().queue.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_restore_interrupted_skips_done() {
        let path =
            std::env::temp_dir().join(format!("dv-queue-restore-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let store = QueueStore::new(path.clone());

        let pending_item = Eid::new();
        store.save_task(
            Task::Enrich {
                item_id: pending_item.clone(),
            },
            Status::InProgress,
        );
        store.save_task(
            Task::Enrich {
                item_id: Eid::new(),
            },
            Status::Done,
        );

        let (tx, rx) = mpsc::channel();
        store.restore_interrupted(&tx);

        let restored: Vec<Task> = rx.try_iter().collect();
        assert_eq!(restored.len(), 1);
        match &restored[0] {
            Task::Enrich { item_id } => assert_eq!(*item_id, pending_item),
            other => panic!("unexpected task {other:?}"),
        }

        // the persisted queue was drained
        assert!(store.read_dump().queue.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_csv_sniff() {
        assert!(looks_like_delimited_rows("a,b,c\n1,2,3\n"));
        assert!(looks_like_delimited_rows("x\ty\n1\t2\n"));
        assert!(!looks_like_delimited_rows("just prose\nacross lines\n"));
        assert!(!looks_like_delimited_rows("one line only"));
        assert!(!looks_like_delimited_rows("a,b\n1,2,3,4\n"));
    }
}
