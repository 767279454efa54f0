//! Recursive directory transfers.
//!
//! A directory operation moves through `Listing -> Transferring` and ends
//! `Completed`, `PartiallyFailed` or `Cancelled`. The subtree is listed in
//! full first; a listing failure aborts before any transfer starts. Leaves
//! are then transferred with bounded concurrency, each exactly once, and
//! their outcomes aggregated into one [`TransferReport`].

use futures::stream::{self, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::TransferContext;
use crate::services::storage::pagination::collect_pages;
use crate::services::storage::path::{depth, PathStyle};
use crate::services::storage::{
    Capability, Entry, EntryType, ItemFailure, ListOptions, OperationError, OperationResult,
    TransferReport, TransferState,
};

/// A listed subtree.
#[derive(Debug, Default)]
pub struct Walk {
    /// Leaves: files and symlinks. Symlinks are not followed.
    pub files: Vec<Entry>,
    /// Every directory below the root, excluding the root itself.
    pub directories: Vec<Entry>,
}

impl Walk {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().filter_map(|f| f.size).sum()
    }
}

/// One leaf to transfer.
#[derive(Debug, Clone)]
pub struct TransferUnit<D> {
    /// Label used in progress and failure reports.
    pub source: String,
    pub destination: D,
    pub size: Option<u64>,
}

enum UnitOutcome {
    Done(String, u64),
    Failed(String, OperationError),
    Skipped,
}

impl TransferContext<'_> {
    /// List every descendant of `root`.
    pub async fn walk(&self, root: &str) -> OperationResult<Walk> {
        let options = ListOptions {
            include_hidden: Some(true),
            ..Default::default()
        };
        let mut walk = Walk::default();

        if self.backend.native_recursive_list() {
            let entries = collect_pages(options.clone().recursive(), |opts| async move {
                self.backend.list_page(root, &opts).await
            })
            .await?;
            for entry in entries {
                if entry.path == root {
                    continue;
                }
                if entry.is_dir() {
                    walk.directories.push(entry);
                } else {
                    walk.files.push(entry);
                }
            }
            return Ok(walk);
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root.to_string());
        let mut queue = VecDeque::from([root.to_string()]);

        while let Some(dir) = queue.pop_front() {
            self.cancel.check("list")?;
            let entries = collect_pages(options.clone(), |opts| {
                let dir = dir.clone();
                async move { self.backend.list_page(&dir, &opts).await }
            })
            .await?;

            for entry in entries {
                match entry.entry_type {
                    EntryType::Directory | EntryType::Bucket => {
                        if visited.insert(entry.path.clone()) {
                            queue.push_back(entry.path.clone());
                            walk.directories.push(entry);
                        }
                    }
                    EntryType::File | EntryType::Symlink => walk.files.push(entry),
                }
            }
        }

        debug!(
            "Walked {}: {} files, {} directories",
            root,
            walk.files.len(),
            walk.directories.len()
        );
        Ok(walk)
    }

    /// Run `transfer` once per unit with bounded concurrency.
    ///
    /// Cancellation is checked as each unit starts; units started before the
    /// signal finish normally, so `transfer` should run against
    /// [`TransferContext::unit`]. `files_processed` counts successful units
    /// only.
    pub async fn run_units<D, F, Fut>(
        &self,
        operation: &str,
        units: Vec<TransferUnit<D>>,
        transfer: F,
    ) -> OperationResult<TransferReport>
    where
        F: Fn(TransferUnit<D>) -> Fut,
        Fut: Future<Output = OperationResult<u64>>,
    {
        let mut report = TransferReport::new(operation);
        report.state = TransferState::Transferring;
        report.total_files = units.len() as u64;
        report.total_bytes = units.iter().filter_map(|u| u.size).sum();
        self.progress
            .set_totals(Some(report.total_bytes), Some(report.total_files));

        info!(
            "Starting {}: {} files, {} bytes",
            operation, report.total_files, report.total_bytes
        );

        let transfer = &transfer;
        let mut outcomes = stream::iter(units)
            .map(|unit| async move {
                if self.cancel.is_cancelled() {
                    return UnitOutcome::Skipped;
                }
                let source = unit.source.clone();
                match transfer(unit).await {
                    Ok(bytes) => UnitOutcome::Done(source, bytes),
                    Err(e) if e.is_cancelled() => UnitOutcome::Skipped,
                    Err(e) => UnitOutcome::Failed(source, e),
                }
            })
            .buffer_unordered(self.settings.directory_concurrency.max(1));

        let mut skipped = 0u64;
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                UnitOutcome::Done(source, bytes) => {
                    report.files_processed += 1;
                    report.bytes_transferred += bytes;
                    self.progress.file_done(&source);
                }
                UnitOutcome::Failed(source, e) => {
                    warn!("{} failed for {}: {}", operation, source, e);
                    report.failures.push(ItemFailure::new(source, &e));
                }
                UnitOutcome::Skipped => skipped += 1,
            }
        }

        if skipped > 0 {
            report.state = TransferState::Cancelled;
            info!(
                "{} cancelled after {} of {} files",
                operation, report.files_processed, report.total_files
            );
            return Err(OperationError::cancelled(operation).with_report(report));
        }
        if !report.failures.is_empty() {
            report.state = TransferState::PartiallyFailed;
            return Err(OperationError::partially_failed(report));
        }
        report.state = TransferState::Completed;
        info!(
            "{} completed: {} files, {} bytes",
            operation, report.files_processed, report.bytes_transferred
        );
        Ok(report)
    }

    /// Create directories shallowest first. Existing ones are fine.
    async fn ensure_directories(&self, mut paths: Vec<String>) -> OperationResult<()> {
        if self.backend.path_style() != PathStyle::Posix
            || !self.capabilities.contains(Capability::Mkdir)
        {
            return Ok(());
        }
        paths.sort_by_key(|p| depth(p));
        for path in paths {
            match self.backend.mkdir(&path).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn rebase(&self, src_root: &str, dst_root: &str, path: &str) -> String {
        let style = self.backend.path_style();
        let relative = style.relative(src_root, path).unwrap_or(path);
        style.join(dst_root, relative)
    }

    /// Copy the subtree at `src_root` to `dst_root` on the same backend.
    pub async fn copy_tree(&self, src_root: &str, dst_root: &str) -> OperationResult<TransferReport> {
        let walk = self.walk(src_root).await?;
        reject_nested(self.backend.path_style(), src_root, dst_root)?;

        let mut dirs: Vec<String> = vec![dst_root.to_string()];
        dirs.extend(
            walk.directories
                .iter()
                .map(|d| self.rebase(src_root, dst_root, &d.path)),
        );
        self.ensure_directories(dirs).await?;

        let units = walk
            .files
            .into_iter()
            .map(|f| TransferUnit {
                destination: self.rebase(src_root, dst_root, &f.path),
                source: f.path,
                size: f.size,
            })
            .collect();

        let started = &self.unit();
        self.run_units("copy", units, |unit| async move {
            started.copy_file(&unit.source, &unit.destination, unit.size).await
        })
        .await
    }

    /// Move a subtree by copying then deleting each entry, then removing
    /// source directories deepest first when the backend has `Rmdir`.
    pub async fn move_tree(&self, src_root: &str, dst_root: &str) -> OperationResult<TransferReport> {
        let walk = self.walk(src_root).await?;
        reject_nested(self.backend.path_style(), src_root, dst_root)?;

        let mut dirs: Vec<String> = vec![dst_root.to_string()];
        dirs.extend(
            walk.directories
                .iter()
                .map(|d| self.rebase(src_root, dst_root, &d.path)),
        );
        self.ensure_directories(dirs).await?;

        let mut source_dirs: Vec<String> = walk.directories.iter().map(|d| d.path.clone()).collect();
        source_dirs.push(src_root.to_string());

        let units = walk
            .files
            .into_iter()
            .map(|f| TransferUnit {
                destination: self.rebase(src_root, dst_root, &f.path),
                source: f.path,
                size: f.size,
            })
            .collect();

        let started = &self.unit();
        let report = self
            .run_units("move", units, |unit| async move {
                started
                    .relocate_file(&unit.source, &unit.destination, unit.size)
                    .await
            })
            .await?;

        self.remove_directories(source_dirs).await;
        Ok(report)
    }

    /// Best-effort rmdir, deepest first.
    async fn remove_directories(&self, mut dirs: Vec<String>) {
        if !self.capabilities.contains(Capability::Rmdir) {
            return;
        }
        dirs.sort_by_key(|p| std::cmp::Reverse(depth(p)));
        for dir in dirs {
            if let Err(e) = self.backend.rmdir(&dir).await {
                warn!("Failed to remove directory {}: {}", dir, e);
            }
        }
    }

    /// Delete every leaf below `root`, then its directories.
    pub async fn delete_tree(&self, root: &str) -> OperationResult<TransferReport> {
        let walk = self.walk(root).await?;
        let mut dirs: Vec<String> = walk.directories.iter().map(|d| d.path.clone()).collect();
        if self.backend.path_style() == PathStyle::Posix {
            dirs.push(root.to_string());
        }
        let keys: Vec<String> = walk.files.iter().map(|f| f.path.clone()).collect();

        let mut report = TransferReport::new("delete");
        report.state = TransferState::Transferring;
        report.total_files = keys.len() as u64;
        self.progress.set_totals(None, Some(report.total_files));

        let deleter = self.deleter();
        let outcome = if self.capabilities.contains(Capability::BatchDelete) {
            deleter
                .delete_batched(&keys, self.settings.batch_delete_cap)
                .await
        } else {
            deleter.delete_each(&keys).await
        };

        report.files_processed = outcome.deleted.len() as u64;
        report.failures = outcome.failed;

        if outcome.cancelled {
            report.state = TransferState::Cancelled;
            return Err(OperationError::cancelled("delete").with_report(report));
        }
        if !report.failures.is_empty() {
            report.state = TransferState::PartiallyFailed;
            return Err(OperationError::partially_failed(report));
        }
        self.remove_directories(dirs).await;
        report.state = TransferState::Completed;
        Ok(report)
    }

    /// Download the subtree at `remote_root` into `local_root`.
    pub async fn download_tree(&self, remote_root: &str, local_root: &Path) -> OperationResult<TransferReport> {
        let walk = self.walk(remote_root).await?;
        let style = self.backend.path_style();

        async_fs::create_dir_all(local_root).await?;
        for dir in &walk.directories {
            if let Some(relative) = style.relative(remote_root, &dir.path) {
                async_fs::create_dir_all(local_root.join(relative)).await?;
            }
        }

        let units = walk
            .files
            .into_iter()
            .filter_map(|f| {
                let relative = style.relative(remote_root, &f.path)?.to_string();
                Some(TransferUnit {
                    destination: local_root.join(relative),
                    source: f.path,
                    size: f.size,
                })
            })
            .collect();

        let started = &self.unit();
        self.run_units("download", units, |unit| async move {
            started
                .download_file(&unit.source, &unit.destination, unit.size)
                .await
        })
        .await
    }

    /// Upload the local directory `local_root` to `remote_root`.
    pub async fn upload_tree(&self, local_root: &Path, remote_root: &str) -> OperationResult<TransferReport> {
        let (files, dirs) = walk_local(local_root.to_path_buf()).await?;
        let style = self.backend.path_style();

        let mut remote_dirs = vec![remote_root.to_string()];
        remote_dirs.extend(dirs.iter().map(|d| style.join(remote_root, d)));
        self.ensure_directories(remote_dirs).await?;

        let units = files
            .into_iter()
            .map(|(relative, size)| TransferUnit {
                source: local_root.join(&relative).display().to_string(),
                destination: style.join(remote_root, &relative),
                size: Some(size),
            })
            .collect();

        let started = &self.unit();
        self.run_units("upload", units, |unit| async move {
            started
                .upload_file(Path::new(&unit.source), &unit.destination)
                .await
        })
        .await
    }
}

fn reject_nested(style: PathStyle, src_root: &str, dst_root: &str) -> OperationResult<()> {
    if style.relative(src_root, dst_root).is_some() {
        return Err(OperationError::invalid_input(format!(
            "Destination {} is inside source {}",
            dst_root, src_root
        )));
    }
    Ok(())
}

/// Walk a local directory on a blocking thread. Returns files as
/// `(relative path, size)` and directories as relative paths, both with `/`
/// separators. Symlinks are not followed.
async fn walk_local(root: PathBuf) -> OperationResult<(Vec<(String, u64)>, Vec<String>)> {
    smol::unblock(move || {
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        for entry in walkdir::WalkDir::new(&root).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| {
                let message = e.to_string();
                match e.into_io_error() {
                    Some(io) => OperationError::from(io),
                    None => OperationError::error(message),
                }
            })?;
            let relative = entry
                .path()
                .strip_prefix(&root)
                .map_err(|e| OperationError::error(e.to_string()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if entry.file_type().is_dir() {
                dirs.push(relative);
            } else {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                files.push((relative, size));
            }
        }
        Ok((files, dirs))
    })
    .await
}
