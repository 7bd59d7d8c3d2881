//! Bulk import of speaker folders.
//!
//! Scans the given folders first so the total is known, then walks every file once,
//! reporting `(current, total)` on the import progress channel.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use walkdir::WalkDir;

use super::{Job, JobContext};

#[derive(Debug, Clone)]
pub struct FolderImportJob {
    folders: Vec<PathBuf>,
}

impl FolderImportJob {
    pub fn new(folders: Vec<PathBuf>) -> Self {
        Self { folders }
    }
}

/// Collect every file below `roots`, depth first, sorted by name within each folder.
fn collect_files(roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for root in roots {
        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let entry =
                entry.with_context(|| format!("failed to read folder {}", root.display()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
    }
    Ok(files)
}

#[async_trait]
impl Job for FolderImportJob {
    async fn execute(&self, mut ctx: JobContext) -> Result<()> {
        let roots = self.folders.clone();
        let files = tokio::task::spawn_blocking(move || collect_files(&roots))
            .await
            .context("folder scan task failed")??;
        let total = files.len() as u64;
        tracing::info!(run = %ctx.run, folders = self.folders.len(), files = total, "importing");
        ctx.progress.report(0, total);

        for (i, path) in files.iter().enumerate() {
            if ctx.is_cancelled() {
                tracing::debug!(run = %ctx.run, imported = i, "import cancelled");
                return Ok(());
            }
            let meta = tokio::fs::metadata(path)
                .await
                .with_context(|| format!("failed to import {}", path.display()))?;
            tracing::trace!(path = %path.display(), bytes = meta.len(), "imported");
            ctx.progress.report(i as u64 + 1, total);
        }
        Ok(())
    }
}
