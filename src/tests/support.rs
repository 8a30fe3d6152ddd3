//! Shared helpers for the integration-style tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{Config, Paths};
use crate::engine::Engine;
use crate::semantic::{Embedder, EmbeddingError};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Deterministic bag-of-words embedder: tokens hash into a fixed number of
/// buckets, counts are L2-normalised. Shared tokens give real cosine
/// overlap, so ranking behaves like the production model without any
/// download.
pub struct BagEmbedder;

pub const BAG_DIMS: usize = 64;

impl Embedder for BagEmbedder {
    fn name(&self) -> &str {
        "test-bag-of-words"
    }

    fn dimensions(&self) -> usize {
        BAG_DIMS
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        use std::hash::{Hash, Hasher};

        let mut v = vec![0f32; BAG_DIMS];
        for token in text.split_whitespace() {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            token.hash(&mut hasher);
            v[(hasher.finish() as usize) % BAG_DIMS] += 1.0;
        }

        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        } else {
            v[0] = 1.0;
        }
        Ok(v)
    }
}

pub struct TestVault {
    pub engine: Option<Arc<Engine>>,
    pub paths: Paths,
}

impl TestVault {
    /// Fresh vault under a unique temp dir, queue running.
    pub fn new() -> TestVault {
        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let base = std::env::temp_dir().join(format!(
            "dv-vault-test-{}-{}",
            std::process::id(),
            counter
        ));
        let _ = std::fs::remove_dir_all(&base);

        let paths = Paths::under(base);
        let config = Config::default();

        let mut engine =
            Engine::new(&paths, &config, Arc::new(BagEmbedder)).expect("engine must build");
        engine.run_queue();

        TestVault {
            engine: Some(Arc::new(engine)),
            paths,
        }
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine.as_ref().expect("engine is running").clone()
    }

    /// Drain the enrichment queue: everything enqueued so far completes
    /// before this returns. The engine is gone afterwards.
    pub fn finish(&mut self) {
        let engine = self.engine.take().expect("engine is running");
        engine.shutdown();
        let mut engine = Arc::try_unwrap(engine)
            .map_err(|_| ())
            .expect("no other engine handles may be held across finish()");
        engine.wait_queue_finish();
    }

    /// Reopen the vault after `finish()`, like a process restart. The
    /// enrichment queue is not started; use `finish()`-then-`reopen()` when a
    /// test needs enrichment to have completed.
    pub fn reopen(&mut self) {
        assert!(self.engine.is_none(), "finish() the vault before reopening");
        let config = Config::default();
        let engine =
            Engine::new(&self.paths, &config, Arc::new(BagEmbedder)).expect("engine must rebuild");
        self.engine = Some(Arc::new(engine));
    }

    /// Files currently in the primary blob directory (temp files excluded).
    pub fn primary_blob_count(&self) -> usize {
        std::fs::read_dir(&self.paths.blobs)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.path().is_file())
                    .filter(|e| !e.file_name().to_string_lossy().contains(".tmp-"))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn thumbnail_count(&self) -> usize {
        std::fs::read_dir(&self.paths.thumbnails)
            .map(|entries| entries.flatten().filter(|e| e.path().is_file()).count())
            .unwrap_or(0)
    }

    /// Write a file into the vault's temp scratch area and return its path.
    pub fn scratch_file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let dir = self.paths.base.join("scratch");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }
}

impl Drop for TestVault {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.shutdown();
        }
        let _ = std::fs::remove_dir_all(&self.paths.base);
    }
}

/// A tiny valid PNG (2x2, opaque) for image-pipeline tests.
pub fn tiny_png() -> Vec<u8> {
    use std::io::Cursor;
    let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([200, 50, 50, 255]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}
