//! Start command implementation.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use snapcrawl_core::{
    exceeds_folder_limit, PageSource, Pipeline, RunSummary, SimilarityIndex, SqliteStore,
    StopReason,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::load_config;

/// Execute the start command.
pub async fn execute(
    config_path: &Path,
    target: Option<u64>,
    sources: Vec<String>,
    quiet: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(target) = target {
        config.project.target_saved_count = target;
    }
    if !sources.is_empty() {
        config.download.sources = sources;
    }
    if config.download.sources.is_empty() {
        bail!(snapcrawl_core::CrawlError::Config(
            "no sources: set download.sources or pass URLs".into()
        ));
    }

    let store = SqliteStore::open(
        &config.project.database_path,
        &config.project.storage_path,
        config.image.save_format,
        config.image.jpeg_quality,
    )
    .await
    .context("Failed to open the image database")?;
    let index = SimilarityIndex::from_hashes(store.load_hashes().await?);
    info!(
        indexed = index.len(),
        database = %config.project.database_path.display(),
        "Loaded stored hashes"
    );

    let source = PageSource::new(&config.download, &config.image)?.into_stream();

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight items");
            trigger.cancel();
        }
    });

    let target = config.project.target_saved_count;
    let storage = config.project.storage_path.clone();
    let folder_limit_mb = config.project.max_folder_size_mb;
    let auto_pack = config.packing.auto_pack;

    let store = Arc::new(store);
    let pipeline = Pipeline::builder(config)
        .sink(store.clone())
        .index(index)
        .shutdown(shutdown)
        .build()?;
    let summary = pipeline.run(source).await.context("Crawl failed")?;
    store.close().await;

    if !quiet {
        print_summary(&summary, target);
    }

    if auto_pack {
        match exceeds_folder_limit(&storage, folder_limit_mb) {
            Ok(true) => {
                warn!(
                    storage = %storage.display(),
                    limit_mb = folder_limit_mb,
                    "Storage folder over its size limit"
                );
                if !quiet {
                    println!(
                        "\n{} {} is over {folder_limit_mb} MB, run `snapcrawl pack` to archive it",
                        "Hint:".cyan().bold(),
                        storage.display()
                    );
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Could not measure the storage folder"),
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, target: u64) {
    let stats = &summary.stats;
    let headline = match summary.stop_reason {
        StopReason::TargetReached => "Target reached".green().bold(),
        StopReason::SourceExhausted => "Sources exhausted".yellow().bold(),
        StopReason::Shutdown => "Stopped".yellow().bold(),
    };

    println!();
    println!("{headline}");
    println!();
    println!("   {} {}", "Saved:".dimmed(), stats.saved.to_string().green());
    if target > 0 {
        println!("   {} {} / {}", "Stored:".dimmed(), stats.total_stored(), target);
    } else {
        println!("   {} {}", "Stored:".dimmed(), stats.total_stored());
    }
    println!("   {} {}", "Attempted:".dimmed(), stats.attempted);
    println!("   {} {}", "Requests:".dimmed(), stats.network_attempts);
    println!("   {} {}", "Discarded:".dimmed(), stats.discarded_total());
    for (reason, count) in &stats.discarded {
        println!("     {:<16} {}", reason.as_str(), count);
    }
    if stats.cancelled > 0 {
        println!("   {} {}", "Cancelled:".dimmed(), stats.cancelled);
    }
    if !summary.open_domains.is_empty() {
        println!(
            "   {} {}",
            "Open circuits:".dimmed(),
            summary.open_domains.join(", ").red()
        );
    }
    println!(
        "   {} {:.1}s",
        "Elapsed:".dimmed(),
        summary.elapsed.as_secs_f64()
    );
}
