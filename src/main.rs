use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod blobstore;
mod cli;
mod config;
mod eid;
mod engine;
mod enrich;
mod errors;
mod extract;
mod images;
mod items;
mod llm;
mod lock;
mod overlay;
mod semantic;
#[cfg(test)]
mod tests;
mod web;

use cli::{Args, Command};
use config::{Config, Paths};
use engine::Engine;
use lock::FileLock;
use semantic::{DisabledEmbedder, Embedder, FastembedEmbedder};

fn setup_logger() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=warn", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the embedding function. A missing or broken model degrades to the
/// disabled embedder: capture keeps working, semantic search goes dark.
fn build_embedder(config: &Config, paths: &Paths) -> Arc<dyn Embedder> {
    if !config.semantic.enabled {
        return Arc::new(DisabledEmbedder);
    }

    let timeout = std::time::Duration::from_secs(config.semantic.download_timeout_secs);
    match FastembedEmbedder::new(&config.semantic.model, paths.models.clone(), Some(timeout)) {
        Ok(embedder) => Arc::new(embedder),
        Err(err) => {
            log::error!("embedding model unavailable, semantic search disabled: {err}");
            Arc::new(DisabledEmbedder)
        }
    }
}

/// Engine for a one-shot CLI command: queue running so enrichment completes
/// before the process exits.
fn one_shot_engine(paths: &Paths, config: &Config) -> anyhow::Result<Engine> {
    let embedder = build_embedder(config, paths);
    let mut engine = Engine::new(paths, config, embedder)?;
    engine.run_queue();
    Ok(engine)
}

fn finish_one_shot(engine: Arc<Engine>) {
    engine.shutdown();
    if let Ok(mut engine) = Arc::try_unwrap(engine).map_err(|_| ()) {
        engine.wait_queue_finish();
    }
}

fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "error") }
    }

    setup_logger();

    let args = Args::parse();
    let paths = Paths::resolve()?;
    let config = Config::load_with(&paths.base)?;

    match args.command {
        Command::Daemon => {
            let _lock = FileLock::try_acquire(&paths.base)
                .map_err(|_| anyhow::anyhow!("another dv instance is running"))?;

            let embedder = build_embedder(&config, &paths);
            let mut engine = Engine::new(&paths, &config, embedder)?;

            // reclaim blobs orphaned by ingests that died mid-flight, before
            // any new writes are in progress
            match engine.sweep() {
                Ok(0) => {}
                Ok(n) => log::info!("startup sweep reclaimed {n} orphaned files"),
                Err(err) => log::warn!("startup sweep failed: {err}"),
            }

            log::debug!("starting enrichment queue...");
            engine.run_queue();
            let engine = Arc::new(engine);

            log::debug!("starting overlay controller...");
            let surface = Arc::new(web::SurfaceBus::new());
            let (controller, _controller_thread) =
                overlay::spawn(engine.clone(), surface.clone(), &config.overlay);

            log::debug!("starting IPC daemon...");
            web::start_daemon(engine, controller, surface, &config.daemon_addr);
            Ok(())
        }

        Command::Add { text } => {
            let _lock = FileLock::try_acquire(&paths.base)?;
            let engine = Arc::new(one_shot_engine(&paths, &config)?);
            let result = cli::handle_add(&text.join(" "), &engine);
            finish_one_shot(engine);
            result
        }

        Command::AddFile { path } => {
            let _lock = FileLock::try_acquire(&paths.base)?;
            let engine = Arc::new(one_shot_engine(&paths, &config)?);
            let result = cli::handle_add_file(&path, &engine);
            finish_one_shot(engine);
            result
        }

        Command::AddLink { url, title } => {
            let _lock = FileLock::try_acquire(&paths.base)?;
            let engine = Arc::new(one_shot_engine(&paths, &config)?);
            let result = cli::handle_add_link(&url, title.as_deref(), &engine);
            finish_one_shot(engine);
            result
        }

        Command::Search { query, k } => {
            let embedder = build_embedder(&config, &paths);
            let engine = Arc::new(Engine::new(&paths, &config, embedder)?);
            cli::handle_search(&query.join(" "), k, &engine)
        }

        Command::List { category } => {
            let embedder: Arc<dyn Embedder> = Arc::new(DisabledEmbedder);
            let engine = Arc::new(Engine::new(&paths, &config, embedder)?);
            cli::handle_list(category.as_deref().and_then(cli::parse_category), &engine)
        }

        Command::Delete { id } => {
            let _lock = FileLock::try_acquire(&paths.base)?;
            let embedder = build_embedder(&config, &paths);
            let engine = Arc::new(Engine::new(&paths, &config, embedder)?);
            cli::handle_delete(&id, &engine)
        }

        Command::Sweep => {
            let _lock = FileLock::try_acquire(&paths.base)?;
            let embedder: Arc<dyn Embedder> = Arc::new(DisabledEmbedder);
            let engine = Arc::new(Engine::new(&paths, &config, embedder)?);
            cli::handle_sweep(&engine)
        }
    }
}
