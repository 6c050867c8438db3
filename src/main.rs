//! CLI entry point for the resumable downloader.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use resumable_dl::{
    Database, DownloadConfig, DownloadManager, DownloadRecord, DownloadRequest, DownloadSettings,
    NetworkMonitor, NotificationConfig, RecordStore, TracingNotifier,
};
use tracing::{debug, info};

mod app_config;
mod cli;
mod progress;

use app_config::{FileConfig, load_file_config};
use cli::{Args, Command, GetArgs, Selection};
use progress::{ProgressView, unfinished, watch_until_settled};

const DEFAULT_DB_FILE: &str = "downloads.db";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let file_config = load_file_config(args.config.as_deref())?;
    let db_path = args
        .db
        .clone()
        .or_else(|| file_config.db_path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE));
    let db = Database::new(&db_path)
        .await
        .with_context(|| format!("Failed to open database '{}'", db_path.display()))?;
    debug!(path = %db_path.display(), "database opened");

    if let Command::List { tag } = &args.command {
        return list(&RecordStore::new(db), tag.as_deref()).await;
    }

    let config = download_config(&file_config)?;
    let manager = DownloadManager::start(
        db,
        config,
        NetworkMonitor::default(),
        Arc::new(TracingNotifier),
    )?;

    let result = run(&manager, &args, &file_config).await;
    manager.shutdown().await;
    result
}

fn download_config(file_config: &FileConfig) -> Result<DownloadConfig> {
    let defaults = DownloadSettings::default();
    let max_concurrent = match file_config.max_concurrent {
        Some(value) => usize::try_from(value).context("max_concurrent out of range")?,
        None => defaults.max_concurrent_downloads,
    };
    let settings = DownloadSettings {
        connect_timeout_secs: file_config
            .connect_timeout_secs
            .unwrap_or(defaults.connect_timeout_secs),
        read_timeout_secs: file_config
            .read_timeout_secs
            .unwrap_or(defaults.read_timeout_secs),
        progress_interval_ms: file_config
            .progress_interval_ms
            .unwrap_or(defaults.progress_interval_ms),
        max_concurrent_downloads: max_concurrent,
        notification: NotificationConfig {
            enabled: file_config.notifications.unwrap_or(false),
            show_speed: true,
        },
    };
    Ok(DownloadConfig::from_settings(&settings)?)
}

async fn run(manager: &DownloadManager, args: &Args, file_config: &FileConfig) -> Result<()> {
    match &args.command {
        Command::Get(get) => {
            let ids = enqueue(manager, get, file_config)?;
            manager.flush().await?;
            wait_for(manager, &ids, args.quiet).await
        }
        Command::Resume(selection) => {
            let ids = select(manager, selection).await?;
            for id in &ids {
                manager.resume(*id)?;
            }
            manager.flush().await?;
            wait_for(manager, &ids, args.quiet).await
        }
        Command::Retry(selection) => {
            let ids = select(manager, selection).await?;
            for id in &ids {
                manager.retry(*id)?;
            }
            manager.flush().await?;
            wait_for(manager, &ids, args.quiet).await
        }
        Command::Cancel(selection) => {
            let ids = select(manager, selection).await?;
            for id in &ids {
                manager.cancel(*id)?;
            }
            manager.flush().await?;
            let mut view = ProgressView::new(false);
            watch_until_settled(manager.observe_downloads(), &ids, &mut view).await;
            info!(count = ids.len(), "Cancelled downloads");
            Ok(())
        }
        Command::Clear {
            selection,
            delete_file,
        } => {
            let ids = select(manager, selection).await?;
            for id in &ids {
                manager.clear_db(*id, *delete_file)?;
            }
            manager.flush().await?;
            info!(count = ids.len(), delete_file, "Cleared downloads");
            Ok(())
        }
        // Served without starting the manager.
        Command::List { .. } => Ok(()),
    }
}

fn enqueue(manager: &DownloadManager, get: &GetArgs, file_config: &FileConfig) -> Result<Vec<i64>> {
    if get.file_name.is_some() && get.urls.len() > 1 {
        bail!("--file-name can only be used with a single URL");
    }
    let dir = get
        .dir
        .clone()
        .or_else(|| file_config.download_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."));

    let mut ids = Vec::with_capacity(get.urls.len());
    for url in &get.urls {
        let mut request = DownloadRequest::new(url, &dir)
            .with_context(|| format!("Cannot download '{url}'"))?
            .headers(get.headers.iter().cloned().collect());
        if let Some(tag) = &get.tag {
            request = request.tag(tag.clone());
        }
        if let Some(file_name) = &get.file_name {
            request = request.with_file_name(file_name);
        }
        let id = manager.download(request)?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    info!(count = ids.len(), dir = %dir.display(), "Queued downloads");
    Ok(ids)
}

async fn select(manager: &DownloadManager, selection: &Selection) -> Result<Vec<i64>> {
    let records = if selection.all {
        manager.get_downloads().await?
    } else if let Some(tag) = &selection.tag {
        manager.get_downloads_by_tag(tag).await?
    } else {
        return Ok(selection.ids.clone());
    };
    Ok(records.into_iter().map(|record| record.id).collect())
}

/// Waits for `ids` to settle; Ctrl+C pauses them instead of aborting.
async fn wait_for(manager: &DownloadManager, ids: &[i64], quiet: bool) -> Result<()> {
    let mut view = ProgressView::new(!quiet);
    let watch = watch_until_settled(manager.observe_downloads(), ids, &mut view);
    tokio::pin!(watch);

    let mut interrupted = false;
    let settled = loop {
        tokio::select! {
            settled = &mut watch => break settled,
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("Failed to listen for Ctrl+C")?;
                info!("Interrupted, pausing downloads");
                interrupted = true;
                for id in ids {
                    manager.pause(*id)?;
                }
            }
        }
    };

    if !quiet {
        for record in &settled {
            println!("{}", summary_line(record));
        }
    }
    if interrupted {
        info!("Downloads paused; continue with `resumable-dl resume <ID>`");
        return Ok(());
    }
    let failed = unfinished(&settled);
    if failed > 0 {
        bail!("{failed} download(s) did not complete");
    }
    Ok(())
}

fn summary_line(record: &DownloadRecord) -> String {
    let destination = Path::new(&record.file_path).join(&record.file_name);
    if record.failure_reason.is_empty() {
        format!("{:<12} {}", record.status.as_str(), destination.display())
    } else {
        format!(
            "{:<12} {} ({})",
            record.status.as_str(),
            destination.display(),
            record.failure_reason
        )
    }
}

async fn list(store: &RecordStore, tag: Option<&str>) -> Result<()> {
    let records = match tag {
        Some(tag) => store.list_by_tag(tag).await?,
        None => store.list_all().await?,
    };
    if records.is_empty() {
        println!("No downloads");
        return Ok(());
    }
    for record in &records {
        println!(
            "{:<20} {:<12} {:>3}% {:<10} {}",
            record.id,
            record.status.as_str(),
            record.progress(),
            record.tag,
            record.url
        );
    }
    Ok(())
}
