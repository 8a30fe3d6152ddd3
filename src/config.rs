use anyhow::Context;
use homedir::my_home;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.yaml";

const ENRICH_WORKERS: u16 = 2;
const HOLD_MS: u64 = 400;
const DEBOUNCE_MS: u64 = 50;
const CONFIRM_MS: u64 = 1500;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "enrich_workers")]
    pub enrich_workers: u16,

    #[serde(default)]
    pub semantic: SemanticConfig,

    #[serde(default)]
    pub overlay: OverlayConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default = "daemon_addr")]
    pub daemon_addr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticConfig {
    #[serde(default = "semantic_enabled")]
    pub enabled: bool,
    #[serde(default = "semantic_model")]
    pub model: String,
    #[serde(default = "download_timeout_secs")]
    pub download_timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "hold_ms")]
    pub hold_ms: u64,
    #[serde(default = "debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "confirm_ms")]
    pub confirm_ms: u64,
}

/// Optional local language-model endpoint. Used only by enrichment to
/// produce short titles/keywords/captions; never on the search path.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn enrich_workers() -> u16 {
    std::thread::available_parallelism()
        .map(|n| n.get().min(u16::MAX as usize) as u16)
        .unwrap_or(ENRICH_WORKERS)
}
fn daemon_addr() -> String {
    "127.0.0.1:7117".to_string()
}
fn semantic_enabled() -> bool {
    true
}
fn semantic_model() -> String {
    crate::semantic::DEFAULT_MODEL.to_string()
}
fn download_timeout_secs() -> u64 {
    300
}
fn hold_ms() -> u64 {
    HOLD_MS
}
fn debounce_ms() -> u64 {
    DEBOUNCE_MS
}
fn confirm_ms() -> u64 {
    CONFIRM_MS
}
fn llm_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        serde_yml::from_str("{}").expect("default config must deserialize")
    }
}

impl Default for SemanticConfig {
    fn default() -> Self {
        serde_yml::from_str("{}").expect("default config must deserialize")
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        serde_yml::from_str("{}").expect("default config must deserialize")
    }
}

impl Config {
    /// Load from `<base>/config.yaml`, writing a default file on first run.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let path = base_path.join(CONFIG_FILE);

        if !path.exists() {
            let config = Self::default();
            config.save_with(base_path)?;
            return Ok(config);
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_yml::from_str(&config_str)
            .with_context(|| format!("{} is malformed", path.display()))?;

        Ok(config)
    }

    pub fn save_with(&self, base_path: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(base_path)?;

        let path = base_path.join(CONFIG_FILE);
        let temp = base_path.join(format!("{CONFIG_FILE}.tmp"));

        let config_str = serde_yml::to_string(self)?;
        std::fs::write(&temp, config_str.as_bytes())?;
        std::fs::rename(&temp, &path)?;

        Ok(())
    }
}

/// Resolved filesystem layout of the vault.
#[derive(Clone, Debug)]
pub struct Paths {
    pub base: PathBuf,
    pub vault: PathBuf,
    pub items: PathBuf,
    pub embeddings: PathBuf,
    pub blobs: PathBuf,
    pub thumbnails: PathBuf,
    pub task_queue: PathBuf,
    pub models: PathBuf,
}

impl Paths {
    /// Base dir is `$DV_BASE_PATH` or `~/.local/share/dv`.
    pub fn resolve() -> anyhow::Result<Paths> {
        let base = match std::env::var("DV_BASE_PATH") {
            Ok(p) => PathBuf::from(p),
            Err(_) => {
                let home = my_home()
                    .ok()
                    .flatten()
                    .context("couldn't find home dir")?;
                home.join(".local/share/dv")
            }
        };

        Ok(Self::under(base))
    }

    pub fn under(base: PathBuf) -> Paths {
        let vault = base.join("vault");
        Paths {
            items: vault.join("items.json"),
            embeddings: vault.join("embeddings.bin"),
            blobs: vault.join("blobs"),
            thumbnails: vault.join("blobs/thumbnails"),
            task_queue: vault.join("task-queue.json"),
            models: base.join("models"),
            vault,
            base,
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.vault)?;
        std::fs::create_dir_all(&self.blobs)?;
        std::fs::create_dir_all(&self.thumbnails)?;
        std::fs::create_dir_all(&self.models)?;
        Ok(())
    }
}
