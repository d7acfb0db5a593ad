use crate::{memory::ContextMemory, Result};
use chrono::{Duration, Utc};
use flate2::{write::GzEncoder, Compression};
use std::{fs, fs::File, path::PathBuf};
use tar::Builder;
use tracing::{info, warn};

use super::{parse_iteration_number, timestamp_slug, IterationStatus};

impl ContextMemory {
    /// Pack iterations older than the retention window into the archive
    ///
    /// Each qualifying iteration directory becomes a single
    /// `archive/iteration_NNN_<timestamp>.tar.gz` and its source directory
    /// is removed. The active iteration is never archived. Returns the
    /// archive paths created.
    pub async fn archive_old_data(&self) -> Result<Vec<PathBuf>> {
        let mut index = self.index.lock().await;
        let now = Utc::now();
        let retention = Duration::days(i64::from(self.config.retention_days));

        let candidates: Vec<u32> = index
            .iterations
            .iter()
            .filter(|(number, meta)| {
                **number != index.current_iteration && meta.status == IterationStatus::Completed
            })
            .map(|(number, _)| *number)
            .collect();

        let mut archived = Vec::new();
        for number in candidates {
            let source = self.iteration_dir(number);
            if !source.exists() {
                index.iterations.remove(&number);
                continue;
            }

            let age = now - directory_timestamp(&source);
            if age < retention {
                continue;
            }

            let archive_name = format!(
                "iteration_{number:03}_{}.tar.gz",
                timestamp_slug(&now)
            );
            let archive_path = self.archive_dir().join(archive_name);

            let tar_gz = File::create(&archive_path)?;
            let encoder = GzEncoder::new(tar_gz, Compression::default());
            let mut builder = Builder::new(encoder);
            builder.append_dir_all(format!("iteration_{number:03}"), &source)?;
            builder.finish()?;

            fs::remove_dir_all(&source)?;
            index.iterations.remove(&number);
            for paths in index.component_index.values_mut() {
                paths.retain(|path| !path.starts_with(&source));
            }

            info!(
                "Archived iteration {:03} to {}",
                number,
                archive_path.display()
            );
            archived.push(archive_path);
        }

        if !archived.is_empty() {
            index.bytes_used = self.compute_bytes_used();
        }
        Ok(archived)
    }

    /// Remove iteration subdirectories that do not follow the
    /// `iteration_NNN` naming scheme
    ///
    /// Returns the number of directories removed.
    pub async fn collect_garbage(&self) -> Result<usize> {
        let mut index = self.index.lock().await;

        let mut removed = 0;
        for entry in fs::read_dir(self.iterations_dir())? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if parse_iteration_number(&name).is_some() {
                continue;
            }

            fs::remove_dir_all(&path)?;
            warn!("Garbage-collected stray directory {}", path.display());
            removed += 1;
        }

        if removed > 0 {
            index.bytes_used = self.compute_bytes_used();
        }
        Ok(removed)
    }
}

/// Best-effort age source for an iteration directory: the completion marker
/// timestamp when readable, the filesystem mtime otherwise.
fn directory_timestamp(dir: &std::path::Path) -> chrono::DateTime<Utc> {
    let marker = dir.join(super::ITERATION_SUMMARY_FILE);
    if let Some(completed_at) = super::read_timestamp_marker(&marker) {
        return completed_at;
    }

    fs::metadata(dir)
        .and_then(|meta| meta.modified())
        .map(chrono::DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}
