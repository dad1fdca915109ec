//! Falcon CLI - command-line front end for Falcon Core.
//!
//! Every subcommand builds one [`falcon_core::FalconCore`] rooted at
//! `--root` (or the platform data directory), runs a single operation and
//! prints the outcome. Structured results are printed as JSON on stdout;
//! logs go to stderr.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use falcon_core::{AppPaths, FalconCore};
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "falcon")]
#[command(about = "Browse, cache and download images from booru-style sites")]
struct Args {
    /// Data directory (defaults to the platform data dir)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List registered sites and their capabilities
    Sites,
    /// Search one site, or every searchable site with --all
    Search {
        /// Site id or alias (ignored with --all)
        #[arg(required_unless_present = "all")]
        site: Option<String>,
        /// Tags to search for
        tags: Vec<String>,
        #[arg(short, long, default_value = "1")]
        page: u32,
        #[arg(long)]
        all: bool,
    },
    /// Suggest tags of a site starting with a prefix
    Tags {
        site: String,
        prefix: String,
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Download one or more items by id
    Download {
        site: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Log in to a site
    Login {
        site: String,
        #[arg(short, long)]
        username: String,
        /// Password or API key
        #[arg(short, long)]
        secret: String,
        /// Keep the session across restarts
        #[arg(long)]
        remember: bool,
    },
    /// Log out of a site
    Logout { site: String },
    /// Manage favorite collections
    Favorites {
        #[command(subcommand)]
        action: FavoritesAction,
    },
    /// Inspect or clear the cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Show or clear search history
    History {
        #[arg(long)]
        site: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum FavoritesAction {
    /// List collections, or the items of one collection
    List { collection: Option<String> },
    Create { name: String },
    Rename { collection: String, name: String },
    Delete { collection: String },
    Add { collection: String, site: String, id: String },
    Remove { collection: String, site: String, id: String },
    /// Write all collections to a snapshot file
    Export { path: PathBuf },
    /// Load collections from a snapshot file
    Import {
        path: PathBuf,
        /// replace or union
        #[arg(long, default_value = "union")]
        strategy: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    Stats,
    Clear {
        /// Only drop entries for this site
        #[arg(long)]
        site: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let root = match args.root {
        Some(path) => path,
        None => AppPaths::default_root()?,
    };
    debug!("Data root: {}", root.display());

    let core = FalconCore::builder(&root).build()?;
    commands::run(&core, args.command).await
}
