//! pagesync - incremental page rendering with source-to-canvas coordinate sync.

mod build;
mod cli;
mod compiler;
mod config;
mod coords;
mod document;
mod logger;
mod serve;
mod signal;
mod synctex;
mod utils;
mod watch;

use anyhow::{Context, Result, bail};
use build::{Pipeline, Scheduler, build_once, job::GenerationClock};
use clap::Parser;
use cli::{Cli, Commands};
use compiler::FormatCache;
use config::{AppConfig, DocumentConfig};
use document::{Document, DocumentState};
use serve::{ApiContext, serve};
use signal::{MemoryStore, SignalDispatcher, cascade::cascade, dispatch::trace_viewers};
use std::sync::Arc;
use utils::exec::ProcessRunner;
use watch::watch_documents;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(AppConfig::load(&cli)?);

    match &cli.command {
        Commands::Watch { .. } => runtime()?.block_on(watch_all(config)),
        Commands::Build { document } => {
            runtime()?.block_on(build_all(config, document.as_deref()))
        }
        Commands::Extract { document } => extract(&config, document),
        Commands::Lookup { document, line } => lookup(&config, document, line),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn pipeline(config: &Arc<AppConfig>) -> Pipeline {
    Pipeline {
        config: Arc::clone(config),
        runner: Arc::new(ProcessRunner),
        formats: FormatCache::default(),
        dispatcher: SignalDispatcher::new(Arc::new(MemoryStore::default())),
    }
}

/// Look up a configured document by name.
fn document<'a>(config: &'a AppConfig, name: &str) -> Result<&'a DocumentConfig> {
    config
        .document(name)
        .with_context(|| format!("Unknown document `{name}`"))
}

/// Build everything, then watch, rebuild and serve queries until Ctrl+C.
async fn watch_all(config: Arc<AppConfig>) -> Result<()> {
    let scheduler = Arc::new(Scheduler::start(pipeline(&config)));
    tokio::spawn(trace_viewers(scheduler.pipeline().dispatcher.observe()));
    for handle in scheduler.handles() {
        handle.request_build(true);
    }

    if config.serve.watch {
        let watched = Arc::clone(&scheduler);
        std::thread::spawn(move || {
            if let Err(e) = watch_documents(&watched) {
                log!("watch"; "{e:#}");
            }
        });
    }

    let ctx = ApiContext::from_scheduler(&scheduler);
    tokio::task::spawn_blocking(move || serve(&ctx))
        .await
        .context("Query server stopped unexpectedly")??;

    scheduler.shutdown().await;
    Ok(())
}

/// One slow-path build of one or every primary document.
async fn build_all(config: Arc<AppConfig>, only: Option<&str>) -> Result<()> {
    let targets: Vec<&DocumentConfig> = match only {
        Some(name) => {
            let doc = document(&config, name)?;
            if doc.is_dependent() {
                let parent = doc.depends_on.as_deref().unwrap_or_default();
                bail!("`{name}` is derived from `{parent}`; build that instead");
            }
            vec![doc]
        }
        None => config.primaries().collect(),
    };

    let pipeline = pipeline(&config);
    let clock = GenerationClock::default();
    let mut failed = Vec::new();
    for target in targets {
        let state = Arc::new(DocumentState::new(Document::from_config(target, &config)));
        let token = clock.token(clock.advance());

        if let Err(e) = build_once(&pipeline, &state, &token).await {
            log!("error"; "{}: {e}", target.name);
            failed.push(target.name.clone());
            continue;
        }

        for dependent in config.dependents_of(&target.name) {
            let dependent = Document::from_config(dependent, &config);
            cascade(&state.doc, &dependent, &pipeline.dispatcher)
                .with_context(|| format!("Failed to refresh `{}`", dependent.name))?;
        }
    }

    if !failed.is_empty() {
        bail!("build failed: {}", failed.join(", "));
    }
    Ok(())
}

/// Parse the cross-reference log and persist the lookup table.
fn extract(config: &AppConfig, name: &str) -> Result<()> {
    let doc = Document::from_config(document(config, name)?, config);
    if doc.is_dependent() {
        bail!("`{name}` has no sources of its own");
    }

    let table = synctex::extract(&doc, &config.build.tracked_extensions, None)?;
    table
        .write(&doc.lookup_path())
        .with_context(|| format!("Failed to write {}", doc.lookup_path().display()))?;
    log!("synctex"; "{}: {} lines -> {}", name, table.len(), doc.lookup_path().display());
    Ok(())
}

/// Print one lookup entry as JSON on stdout.
fn lookup(config: &AppConfig, name: &str, line: &str) -> Result<()> {
    let doc = Document::from_config(document(config, name)?, config);
    let table = synctex::LookupTable::read(&doc.lookup_path())
        .with_context(|| format!("Failed to read {}", doc.lookup_path().display()))?;
    let Some(entry) = table.get_str(line) else {
        bail!("no entry for line `{line}` in `{name}`");
    };
    println!("{}", serde_json::to_string_pretty(entry)?);
    Ok(())
}
