use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::Engine;
use crate::items::{Category, Item};

#[derive(Parser, Debug)]
#[command(name = "dv", version, about = "personal dump vault")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the engine: overlay controller, enrichment queue, local IPC
    Daemon,

    /// Capture a text snippet
    Add {
        /// The text to capture (joined with spaces)
        text: Vec<String>,
    },

    /// Capture a file from a path
    AddFile { path: PathBuf },

    /// Capture a link
    AddLink {
        url: String,
        #[arg(long)]
        title: Option<String>,
    },

    /// Search the vault by meaning
    Search {
        query: Vec<String>,
        /// Maximum number of results
        #[arg(short, long, default_value_t = 10)]
        k: usize,
    },

    /// List items, newest first
    List {
        /// Filter by category (ideas, links, code, notes, images, documents, videos, csv, text)
        #[arg(long)]
        category: Option<String>,
    },

    /// Delete an item by id
    Delete { id: String },

    /// Reclaim orphaned blobs and stale derived artifacts
    Sweep,
}

pub fn parse_category(raw: &str) -> Option<Category> {
    let category = match raw.to_lowercase().as_str() {
        "ideas" => Category::Ideas,
        "links" => Category::Links,
        "code" => Category::Code,
        "notes" => Category::Notes,
        "images" => Category::Images,
        "documents" => Category::Documents,
        "videos" => Category::Videos,
        "csv" => Category::Csv,
        "text" => Category::Text,
        _ => return None,
    };
    Some(category)
}

pub fn handle_add(text: &str, engine: &Arc<Engine>) -> anyhow::Result<()> {
    let item = engine.ingest_text(text)?;
    print_item(&item);
    Ok(())
}

pub fn handle_add_file(path: &PathBuf, engine: &Arc<Engine>) -> anyhow::Result<()> {
    let item = engine.ingest_file(path)?;
    print_item(&item);
    Ok(())
}

pub fn handle_add_link(
    url: &str,
    title: Option<&str>,
    engine: &Arc<Engine>,
) -> anyhow::Result<()> {
    let item = engine.ingest_link(url, title)?;
    print_item(&item);
    Ok(())
}

pub fn handle_search(query: &str, k: usize, engine: &Arc<Engine>) -> anyhow::Result<()> {
    let hits = engine.search(query, k)?;

    if hits.is_empty() {
        println!("no results");
        return Ok(());
    }

    for hit in hits {
        println!(
            "{:.3}  {}  [{}]  {}",
            hit.score, hit.item.id, hit.item.category, hit.item.title
        );
    }
    Ok(())
}

pub fn handle_list(category: Option<Category>, engine: &Arc<Engine>) -> anyhow::Result<()> {
    let listed = engine.list(category)?;
    println!("{} items", listed.len());
    for item in listed {
        print_item(&item);
    }
    Ok(())
}

pub fn handle_delete(id: &str, engine: &Arc<Engine>) -> anyhow::Result<()> {
    engine.delete(&id.into())?;
    println!("deleted {id}");
    Ok(())
}

pub fn handle_sweep(engine: &Arc<Engine>) -> anyhow::Result<()> {
    let removed = engine.sweep()?;
    println!("reclaimed {removed} orphaned files");
    Ok(())
}

fn print_item(item: &Item) {
    let marker = if item.damaged { " (damaged)" } else { "" };
    println!("{}  [{}]  {}{}", item.id, item.category, item.title, marker);
}
