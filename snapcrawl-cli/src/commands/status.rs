//! Status command implementation.

use std::path::Path;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use serde_json::json;
use snapcrawl_core::SqliteStore;

use super::load_config;

/// Execute the status command.
pub async fn execute(config_path: &Path, as_json: bool, limit: usize) -> Result<()> {
    let config = load_config(config_path)?;
    let db_path = &config.project.database_path;
    if !db_path.exists() {
        bail!("Database not found: {} (run `snapcrawl start` first)", db_path.display());
    }

    let store = SqliteStore::open(
        db_path,
        &config.project.storage_path,
        config.image.save_format,
        config.image.jpeg_quality,
    )
    .await
    .context("Failed to open the image database")?;

    let basic = store.basic_stats().await?;
    let domains = store.stats_by_domain(limit).await?;
    let dates = store.stats_by_date(limit).await?;
    store.close().await;

    if as_json {
        let report = json!({
            "images": basic.images,
            "domains": basic.domains,
            "bytes": basic.bytes,
            "target": config.project.target_saved_count,
            "by_domain": domains
                .iter()
                .map(|(domain, count)| json!({ "domain": domain, "count": count }))
                .collect::<Vec<_>>(),
            "by_date": dates
                .iter()
                .map(|(date, count)| json!({ "date": date, "count": count }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("{}", "Dataset status".bold());
    println!();
    let target = config.project.target_saved_count;
    if target > 0 {
        println!("   {} {} / {}", "Images:".dimmed(), basic.images, target);
    } else {
        println!("   {} {}", "Images:".dimmed(), basic.images);
    }
    println!("   {} {}", "Domains:".dimmed(), basic.domains);
    println!("   {} {}", "Size:".dimmed(), format_bytes(basic.bytes));

    if !domains.is_empty() {
        println!();
        println!("   {}", "Top domains".dimmed());
        for (domain, count) in &domains {
            println!("     {count:>6}  {domain}");
        }
    }
    if !dates.is_empty() {
        println!();
        println!("   {}", "Recent days".dimmed());
        for (date, count) in &dates {
            println!("     {count:>6}  {date}");
        }
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
