//! Pagestore CLI - mounts a database device and reports cache statistics.

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use pagestore::config::StorageSettings;
use pagestore::device::DatabaseDevice;
use pagestore::event::LogEventSink;
use pagestore::session::{Connection, SessionManager};
use pagestore::storage::{
    BufferCache, DeviceId, DeviceRegistry, Page, PageType, VirtualPageId,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Pagestore - a page-oriented storage engine
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory
    #[arg(short = 'D', long, default_value = "./pagestore_data")]
    data_dir: PathBuf,

    /// Page size in bytes
    #[arg(long, default_value = "8192")]
    page_size: usize,

    /// Cache capacity in buffers before scavenging kicks in
    #[arg(long, default_value = "64")]
    scavenge_threshold: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    std::fs::create_dir_all(&args.data_dir).context("Failed to create data directory")?;
    let master_path = args.data_dir.join("master.pagestore");
    let is_create = !master_path.exists();

    let settings = StorageSettings {
        page_size: args.page_size,
        scavenge_threshold: args.scavenge_threshold,
        ..StorageSettings::default()
    };

    let sink = Arc::new(LogEventSink);
    let registry = Arc::new(DeviceRegistry::new());
    let cache = Arc::new(BufferCache::new(registry.clone(), &settings, sink.clone()));

    let master = Arc::new(DatabaseDevice::new(
        DeviceId::ZERO,
        "master",
        master_path.clone(),
        settings.page_size,
        registry,
        sink,
    ));
    master
        .open(is_create)
        .await
        .context("Failed to open master device")?;
    println!(
        "{} master device at {}",
        if is_create { "Created" } else { "Opened" },
        master_path.display()
    );

    // Run one unit of work under a session to prove the plumbing.
    let session_manager = SessionManager::new();
    let mut connection = Connection::new(
        session_manager.create_session(),
        master.clone(),
        settings.default_lock_timeout(),
    );

    let cache_for_action = cache.clone();
    connection
        .execute_under_session(|context| async move {
            let active = context.active_database().expect("active database");
            println!(
                "Session bound to database '{}' (device {})",
                active.name(),
                active.device_id()
            );

            let page_id = VirtualPageId::new(active.device_id(), 0);
            if is_create {
                let buffer = cache_for_action.allocate(page_id)?;
                let mut page = Page::new(page_id, PageType::Root);
                page.init(buffer)?;
                page.write_data(0, b"pagestore")?;
                page.save(&cache_for_action).await?;
                page.dispose()?;
                println!("Initialized root page {}", page_id);
            } else {
                let buffer = cache_for_action.fetch(page_id).await?;
                let mut page = Page::new(page_id, PageType::Root);
                page.load(buffer)?;
                println!("Loaded root page {}", page_id);
                page.dispose()?;
            }
            Ok(())
        })
        .await
        .context("Unit of work failed")?;

    let stats = cache.stats();
    println!(
        "Cache: {} buffer(s) cached, threshold {}, {} scavenge pass(es)",
        stats.cached_buffers, stats.scavenge_threshold, stats.scavenge_passes
    );

    connection.close().context("Failed to close connection")?;
    cache.flush_all().await.context("Failed to flush cache")?;
    master.close().await.context("Failed to close device")?;
    println!("Closed cleanly");

    Ok(())
}
