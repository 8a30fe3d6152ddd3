//! End-to-end scenarios: ingest through the engine facade, search through
//! the semantic index, delete with blob garbage collection.

use std::sync::Arc;

use super::support::{tiny_png, BagEmbedder, TestVault};
use crate::blobstore::BlobStore;
use crate::eid::Eid;
use crate::engine::Notifier;
use crate::enrich::{EnrichCtx, Status, Task};
use crate::errors::EngineError;
use crate::items::{self, Category, IndexJson, Item, ItemIndex, ItemKind, ItemMeta};
use crate::semantic::SemanticService;

#[test]
fn test_text_ingest_is_searchable_immediately() {
    let vault = TestVault::new();
    let engine = vault.engine();

    let item = engine.ingest_text("Remember to review PR #123").unwrap();
    assert_eq!(item.kind, ItemKind::Text);
    assert!(item.searchable_text.contains("remember to review pr #123"));
    assert_eq!(item.searchable_text, item.searchable_text.to_lowercase());

    // a successful ingest return implies the initial embedding exists
    let hits = engine.search("review pr", 5).unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].item.id, item.id);
}

#[test]
fn test_search_by_exact_title_finds_item() {
    let vault = TestVault::new();
    let engine = vault.engine();

    let item = engine.ingest_text("overlay hold threshold tuning").unwrap();
    let hits = engine.search(&item.title, 10).unwrap();
    assert!(hits.iter().any(|h| h.item.id == item.id));
}

#[test]
fn test_pasted_url_becomes_link_item() {
    let vault = TestVault::new();
    let engine = vault.engine();

    // engine-level defence: text that is a bare URL turns into a link
    let item = engine.ingest_text("https://example.com/docs").unwrap();
    assert_eq!(item.kind, ItemKind::Link);
    assert_eq!(item.category, Category::Links);
    assert_eq!(
        item.metadata.url.as_deref(),
        Some("https://example.com/docs")
    );

    let hits = engine.search("example docs", 5).unwrap();
    assert!(hits.iter().any(|h| h.item.id == item.id));
}

#[test]
fn test_same_png_three_times_dedups_blob_and_gc_waits_for_last_delete() {
    let mut vault = TestVault::new();
    let engine = vault.engine();

    let png = vault.scratch_file("shot.png", &tiny_png());

    let a = engine.ingest_file(&png).unwrap();
    let b = engine.ingest_file(&png).unwrap();
    let c = engine.ingest_file(&png).unwrap();

    assert_eq!(engine.list(None).unwrap().len(), 3);
    assert_eq!(vault.primary_blob_count(), 1);
    assert_eq!(a.hash, b.hash);
    assert_eq!(b.hash, c.hash);

    // let enrichment render the (single, idempotent) thumbnail
    drop(engine);
    vault.finish();
    assert_eq!(vault.thumbnail_count(), 1);

    vault.reopen();
    let engine = vault.engine();

    let enriched = engine.get(&a.id).unwrap();
    assert!(enriched.metadata.thumbnail_ref.is_some());
    assert_eq!(enriched.metadata.size_bytes, Some(tiny_png().len() as u64));

    // two deletes leave the shared blob in place
    engine.delete(&a.id).unwrap();
    engine.delete(&b.id).unwrap();
    assert_eq!(vault.primary_blob_count(), 1);
    assert_eq!(vault.thumbnail_count(), 1);

    // the last reference takes the blob and its thumbnail along
    engine.delete(&c.id).unwrap();
    assert_eq!(vault.primary_blob_count(), 0);
    assert_eq!(vault.thumbnail_count(), 0);
}

#[test]
fn test_document_becomes_searchable_by_body_after_enrichment() {
    let mut vault = TestVault::new();
    let engine = vault.engine();

    let doc = vault.scratch_file(
        "meeting-notes.txt",
        b"quarterly planning\nthe xylograph budget was approved\n",
    );

    let item = engine.ingest_file(&doc).unwrap();
    assert_eq!(item.category, Category::Documents);

    // before enrichment: found by filename, but not yet by body words
    let hits = engine.search("meeting-notes", 5).unwrap();
    assert!(hits.iter().any(|h| h.item.id == item.id));

    let before_score = engine
        .search("xylograph budget", 5)
        .unwrap()
        .iter()
        .find(|h| h.item.id == item.id)
        .map(|h| h.score)
        .unwrap_or(0.0);

    drop(engine);
    vault.finish();
    vault.reopen();
    let engine = vault.engine();

    // after enrichment: the body text reached the searchable text and the
    // embedding was refreshed
    let enriched = engine.get(&item.id).unwrap();
    assert!(enriched
        .metadata
        .extracted_text
        .as_deref()
        .unwrap()
        .contains("xylograph"));
    assert!(enriched.searchable_text.contains("xylograph"));

    let hits = engine.search("xylograph budget", 5).unwrap();
    let after = hits.iter().find(|h| h.item.id == item.id).unwrap();
    assert!(after.score > before_score);
}

#[test]
fn test_rejected_extension_leaves_no_trace() {
    let vault = TestVault::new();
    let engine = vault.engine();

    let mp3 = vault.scratch_file("song.mp3", b"ID3 not really audio");

    let result = engine.ingest_file(&mp3);
    assert!(matches!(result, Err(EngineError::FileRejected(_))));

    assert_eq!(engine.list(None).unwrap().len(), 0);
    assert_eq!(vault.primary_blob_count(), 0);
}

#[test]
fn test_zero_byte_file_dedups_on_empty_hash() {
    let vault = TestVault::new();
    let engine = vault.engine();

    let empty_a = vault.scratch_file("empty-a.txt", b"");
    let empty_b = vault.scratch_file("empty-b.txt", b"");

    let a = engine.ingest_file(&empty_a).unwrap();
    let b = engine.ingest_file(&empty_b).unwrap();

    assert_eq!(
        a.hash.as_deref(),
        Some("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
    );
    assert_eq!(a.hash, b.hash);
    assert_eq!(vault.primary_blob_count(), 1);
}

#[test]
fn test_delete_removes_item_from_search() {
    let vault = TestVault::new();
    let engine = vault.engine();

    let item = engine.ingest_text("ephemeral thought about gardening").unwrap();
    assert!(!engine.search("gardening thought", 5).unwrap().is_empty());

    engine.delete(&item.id).unwrap();

    assert!(matches!(
        engine.get(&item.id),
        Err(EngineError::NotFound(_))
    ));
    assert!(engine
        .search("gardening thought", 5)
        .unwrap()
        .iter()
        .all(|h| h.item.id != item.id));
}

#[test]
fn test_delete_missing_id_is_not_found() {
    let vault = TestVault::new();
    let engine = vault.engine();

    let result = engine.delete(&Eid::new());
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[test]
fn test_short_query_and_empty_vault_return_empty() {
    let vault = TestVault::new();
    let engine = vault.engine();

    // empty index
    assert!(engine.search("anything at all", 10).unwrap().is_empty());

    engine.ingest_text("some stored note").unwrap();

    // below the two-character minimum
    assert!(engine.search("a", 10).unwrap().is_empty());
}

#[test]
fn test_list_is_newest_first_and_filterable() {
    let vault = TestVault::new();
    let engine = vault.engine();

    engine.ingest_text("first idea").unwrap();
    engine
        .ingest_link("https://example.com/second", None)
        .unwrap();

    let listed = engine.list(None).unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed[0].created_at >= listed[1].created_at);

    let links = engine.list(Some(Category::Links)).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].kind, ItemKind::Link);
}

#[test]
fn test_ingest_bytes_materialises_a_file() {
    let vault = TestVault::new();
    let engine = vault.engine();

    let item = engine.ingest_bytes("dropped.png", &tiny_png()).unwrap();
    assert_eq!(item.kind, ItemKind::Image);
    assert_eq!(item.category, Category::Images);
    assert_eq!(item.metadata.filename.as_deref(), Some("dropped.png"));
    assert_eq!(vault.primary_blob_count(), 1);
}

#[test]
fn test_sweep_reclaims_unreferenced_blobs() {
    let vault = TestVault::new();
    let engine = vault.engine();

    let doc = vault.scratch_file("kept.txt", b"kept content");
    engine.ingest_file(&doc).unwrap();

    // plant an orphan directly in the store, as a crashed ingest would
    let store = BlobStore::open(
        vault.paths.blobs.clone(),
        vault.paths.thumbnails.clone(),
    )
    .unwrap();
    store.put(b"orphan bytes", Some("txt")).unwrap();
    assert_eq!(vault.primary_blob_count(), 2);

    let removed = engine.sweep().unwrap();
    assert_eq!(removed, 1);
    assert_eq!(vault.primary_blob_count(), 1);
}

#[test]
fn test_missing_blob_marks_item_damaged_and_hides_it_from_search() {
    let vault = TestVault::new();

    // assemble the enrichment context by hand so the corruption path can be
    // driven synchronously
    let items: Arc<dyn ItemIndex> =
        Arc::new(IndexJson::load(vault.paths.items.clone()).unwrap());
    let blobs = Arc::new(
        BlobStore::open(vault.paths.blobs.clone(), vault.paths.thumbnails.clone()).unwrap(),
    );
    let semantic = Arc::new(SemanticService::new(
        Arc::new(BagEmbedder),
        vault.paths.embeddings.clone(),
    ));

    let item = Item {
        id: Eid::new(),
        kind: ItemKind::File,
        category: Category::Documents,
        title: "ghost".to_string(),
        content: None,
        blob_ref: Some("0badc0de".to_string()),
        hash: Some("0badc0de".to_string()),
        mime_type: None,
        created_at: items::now_ms(),
        updated_at: items::now_ms(),
        damaged: false,
        metadata: ItemMeta::default(),
        searchable_text: "ghost".to_string(),
    };
    items.insert(item.clone()).unwrap();
    semantic
        .upsert(&item.id, item.created_at, &item.searchable_text)
        .unwrap();

    let ctx = EnrichCtx {
        items: items.clone(),
        blobs,
        semantic: semantic.clone(),
        llm: None,
        notifier: Arc::new(Notifier::new()),
    };

    let status = Task::Enrich {
        item_id: item.id.clone(),
    }
    .run(&ctx);

    assert!(matches!(status, Status::Error(_)));
    assert!(items.get(&item.id).unwrap().damaged);
    // the embedding is gone too, so search can't surface the ghost
    assert!(!semantic.ids().unwrap().contains(&item.id));
}

#[test]
fn test_items_updated_fires_on_ingest_and_delete() {
    let vault = TestVault::new();
    let engine = vault.engine();

    let rx = engine.subscribe();

    let item = engine.ingest_text("watch this space").unwrap();
    assert!(rx.try_recv().is_ok());

    engine.delete(&item.id).unwrap();
    assert!(rx.try_recv().is_ok());
}
