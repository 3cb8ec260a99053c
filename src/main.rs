//! Curata watcher daemon.
//!
//! Reconciles the media tree with the catalog at startup, then watches for
//! filesystem changes until stopped.
//!
//! ## Usage
//!
//! ```bash
//! curata              # Reconcile, then watch
//! curata --once       # Reconcile and exit
//! ```

use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

use curata::clip::ClipIndex;
use curata::config::Config;
use curata::db::Database;
use curata::pipeline::Session;
use curata::{logging, watcher};

struct CliArgs {
    once: bool,
    config_path: Option<PathBuf>,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            once: false,
            config_path: None,
        }
    }
}

fn main() -> Result<()> {
    let args = parse_args();

    logging::init(None)?;
    info!("Curata starting...");

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!(media_root = %config.media.root.display(), "Config loaded");

    let db = Database::open(&config.db_path)?;
    db.initialize()?;
    info!(db_path = %config.db_path.display(), "Database opened");

    let clip = ClipIndex::onnx(&config);
    let session = Session::new(config, db, clip);

    watcher::preprocess(&session)?;
    info!("Startup reconciliation complete");

    let embedded = session
        .clip
        .embed_unclipped_items(&session.config, &session.db)?;
    if embedded > 0 {
        info!(count = embedded, "Backfilled embeddings");
    }

    if args.once {
        info!("Single-shot mode, exiting");
        return Ok(());
    }

    watcher::run(&session)
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                cli.once = true;
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    cli.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--version" | "-V" => {
                println!("curata {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

fn print_help() {
    println!(
        r#"curata - media curation pipeline daemon

USAGE:
    curata [OPTIONS]

OPTIONS:
    --once, -1          Reconcile the media tree once and exit
    --config, -c PATH   Path to config file
    --version, -V       Print version
    --help, -h          Show this help message

ENVIRONMENT:
    CURATA_CONFIG       Path to config file (overrides default location)
    CURATA_LOG          Log level (trace, debug, info, warn, error)

The daemon walks the watched roots at startup, folds any manual moves back
into the catalog, sweeps stale records, then watches for changes.
"#
    );
}
