//! Clean command implementation.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use snapcrawl_core::{clean_dataset, CleanReport, HeuristicClassifier, SqliteStore};

use super::load_config;

/// Execute the clean command.
pub async fn execute(config_path: &Path, force_dry_run: bool, quiet: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let db_path = &config.project.database_path;
    if !db_path.exists() {
        bail!("Database not found: {} (run `snapcrawl start` first)", db_path.display());
    }

    let mut postfilter = config.postfilter.clone();
    postfilter.dry_run |= force_dry_run;
    if !postfilter.enable {
        if !quiet {
            println!(
                "{} set postfilter.enable to true to clean the dataset",
                "Post-filter disabled:".yellow().bold()
            );
        }
        return Ok(());
    }

    let store = SqliteStore::open(
        db_path,
        &config.project.storage_path,
        config.image.save_format,
        config.image.jpeg_quality,
    )
    .await
    .context("Failed to open the image database")?;
    let report = clean_dataset(&store, Arc::new(HeuristicClassifier), &postfilter).await;
    store.close().await;
    let report = report.context("Clean failed")?;

    if !quiet {
        print_report(&report, postfilter.threshold);
    }
    Ok(())
}

fn print_report(report: &CleanReport, threshold: f32) {
    println!();
    if report.dry_run {
        println!("{}", "Clean (dry run)".yellow().bold());
    } else {
        println!("{}", "Clean".green().bold());
    }
    println!();
    println!("   {} {}", "Scanned:".dimmed(), report.scanned);
    println!(
        "   {} {} (score < {threshold})",
        "Flagged:".dimmed(),
        report.flagged
    );
    if report.dry_run {
        println!("   {} nothing (dry run)", "Removed:".dimmed());
    } else {
        println!("   {} {}", "Removed:".dimmed(), report.removed.to_string().red());
    }
}
