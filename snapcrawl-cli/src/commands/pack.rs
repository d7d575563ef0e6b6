//! Pack command implementation.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use colored::Colorize;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::load_config;
use crate::ArchiveFormat;

/// Execute the pack command.
pub async fn execute(
    config_path: &Path,
    format: Option<ArchiveFormat>,
    output: Option<PathBuf>,
    quiet: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let format = format.unwrap_or_else(|| config.packing.format.into());
    let storage = config.project.storage_path.clone();
    if !storage.is_dir() {
        bail!("Storage folder not found: {}", storage.display());
    }

    let out_dir = match output {
        Some(dir) => dir,
        None => storage
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    let archive = out_dir.join(archive_name(Local::now(), format));

    let (storage_c, archive_c) = (storage.clone(), archive.clone());
    let files = tokio::task::spawn_blocking(move || write_archive(&storage_c, &archive_c, format))
        .await
        .context("Archive task failed")??;

    info!(archive = %archive.display(), files, "Packed storage folder");
    if !quiet {
        println!(
            "{} {} ({} files)",
            "Packed".green().bold(),
            archive.display(),
            files
        );
    }
    Ok(())
}

/// `dataset-YYYYMMDD-HHMMSS.<ext>`
pub fn archive_name(now: DateTime<Local>, format: ArchiveFormat) -> String {
    let ext = match format {
        ArchiveFormat::Zip => "zip",
        ArchiveFormat::Tar => "tar",
    };
    format!("dataset-{}.{ext}", now.format("%Y%m%d-%H%M%S"))
}

/// Regular files under `root`, sorted, as (absolute, relative with `/`) pairs.
/// Hidden entries such as in-progress temp files are skipped.
pub fn collect_files(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            let kind = entry.file_type()?;
            if kind.is_dir() {
                pending.push(path);
            } else if kind.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .with_context(|| format!("{} escapes {}", path.display(), root.display()))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push((path, relative));
            }
        }
    }
    out.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(out)
}

fn write_archive(storage: &Path, archive: &Path, format: ArchiveFormat) -> Result<usize> {
    let files = collect_files(storage)?;
    if let Some(parent) = archive.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to write {}", parent.display()))?;
    }
    let file = File::create(archive)
        .with_context(|| format!("Failed to write archive {}", archive.display()))?;
    let root = storage
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());

    match format {
        ArchiveFormat::Zip => {
            let mut zip = ZipWriter::new(BufWriter::new(file));
            let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
            for (path, relative) in &files {
                debug!(file = %relative, "Adding to zip");
                zip.start_file(format!("{root}/{relative}"), options)
                    .context("Failed to write archive entry")?;
                let mut source = File::open(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                std::io::copy(&mut source, &mut zip).context("Failed to write archive entry")?;
            }
            zip.finish()
                .context("Failed to write archive")?
                .flush()
                .context("Failed to write archive")?;
        }
        ArchiveFormat::Tar => {
            let mut tar = tar::Builder::new(BufWriter::new(file));
            for (path, relative) in &files {
                debug!(file = %relative, "Adding to tar");
                tar.append_path_with_name(path, format!("{root}/{relative}"))
                    .context("Failed to write archive entry")?;
            }
            tar.into_inner()
                .context("Failed to write archive")?
                .flush()
                .context("Failed to write archive")?;
        }
    }
    Ok(files.len())
}
