// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Export file copies.
//!
//! Small exports are copied inline by the bridge. Large ones (more than
//! [`DEFER_FILES`] files or more than [`DEFER_BYTES`] in total) are queued
//! on the [`CopyPool`] so the DCC gets its export-version id back at once.
//! Work that needs the files in place runs as the job's follow-up.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, error, info, warn};

/// Total size above which copies run in the background.
pub const DEFER_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// File count above which copies run in the background.
pub const DEFER_FILES: usize = 20;

/// One export's files to copy into a version directory.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyJob {
    /// `(source, destination)` pairs.
    pub files: Vec<(PathBuf, PathBuf)>,
    /// Staging directory removed once every file is copied.
    pub staging: Option<PathBuf>,
}

impl CopyJob {
    /// Plan copies of `sources` into `destination_dir`, never overwriting.
    pub fn plan(sources: &[PathBuf], destination_dir: &Path) -> Self {
        let mut taken = Vec::new();
        let files = sources
            .iter()
            .map(|source| {
                let dest = unique_destination(source, destination_dir, &taken);
                taken.push(dest.clone());
                (source.clone(), dest)
            })
            .collect();
        let staging = sources
            .first()
            .and_then(|f| f.parent())
            .map(Path::to_path_buf);
        Self { files, staging }
    }

    /// Destination paths, in source order.
    pub fn destinations(&self) -> Vec<PathBuf> {
        self.files.iter().map(|(_, dest)| dest.clone()).collect()
    }

    /// Whether this job should go to the background pool.
    pub async fn should_defer(&self) -> bool {
        if self.files.len() > DEFER_FILES {
            return true;
        }
        let mut total = 0u64;
        for (source, _) in &self.files {
            if let Ok(meta) = tokio::fs::metadata(source).await {
                total = total.saturating_add(meta.len());
            }
        }
        total > DEFER_BYTES
    }

    /// Copy every file, then clean up the staging directory.
    ///
    /// Returns the destinations that were written.
    pub async fn run(&self) -> Vec<PathBuf> {
        let mut copied = Vec::with_capacity(self.files.len());
        for (source, dest) in &self.files {
            match tokio::fs::copy(source, dest).await {
                Ok(bytes) => {
                    debug!(source = %source.display(), dest = %dest.display(), bytes, "Copied");
                    copied.push(dest.clone());
                }
                Err(e) => {
                    error!(source = %source.display(), dest = %dest.display(), error = %e, "Copy failed");
                }
            }
        }

        match &self.staging {
            Some(staging) if copied.len() == self.files.len() && !copied.is_empty() => {
                if let Err(e) = tokio::fs::remove_dir_all(staging).await {
                    warn!(dir = %staging.display(), error = %e, "Failed to remove staging dir");
                }
            }
            Some(staging) if copied.len() != self.files.len() => {
                warn!(dir = %staging.display(), "Missing files, keeping staging dir");
            }
            _ => {}
        }
        copied
    }
}

/// `dest_dir/<name>`, or `dest_dir/<stem>_<n>.<ext>` when taken.
fn unique_destination(source: &Path, dest_dir: &Path, taken: &[PathBuf]) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let candidate = dest_dir.join(&name);
    let is_free = |p: &Path| !p.exists() && !taken.iter().any(|t| t == p);
    if is_free(&candidate) {
        return candidate;
    }
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = source.extension().map(|e| e.to_string_lossy().into_owned());
    (1u32..)
        .map(|n| match &ext {
            Some(ext) => dest_dir.join(format!("{stem}_{n}.{ext}")),
            None => dest_dir.join(format!("{stem}_{n}")),
        })
        .find(|p| is_free(p))
        .unwrap_or(candidate)
}

/// Work run once a queued job's files are copied.
pub type FollowUp = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Queued {
    job: CopyJob,
    then: Option<FollowUp>,
}

impl Queued {
    async fn run(self) {
        let copied = self.job.run().await;
        info!(copied = copied.len(), total = self.job.files.len(), "Background copy finished");
        if let Some(then) = self.then {
            then.await;
        }
    }
}

/// Background worker draining [`CopyJob`]s one at a time.
pub struct CopyPool {
    sender: mpsc::UnboundedSender<Queued>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Queued>>>,
    shutdown: Arc<Notify>,
}

impl Default for CopyPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CopyPool {
    /// Idle pool; call [`run`](Self::run) in a task.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Queue a job. `false` once the pool has stopped.
    pub fn submit(&self, job: CopyJob) -> bool {
        self.sender.send(Queued { job, then: None }).is_ok()
    }

    /// Queue a job and run `then` after its copies.
    ///
    /// When the pool has stopped, the job and `then` are handed back.
    pub fn submit_then(
        &self,
        job: CopyJob,
        then: FollowUp,
    ) -> std::result::Result<(), (CopyJob, FollowUp)> {
        self.sender
            .send(Queued {
                job,
                then: Some(then),
            })
            .map_err(|mpsc::error::SendError(queued)| {
                let Queued { job, then } = queued;
                (job, then.unwrap_or_else(|| Box::pin(async {})))
            })
    }

    /// Handle used to stop the pool.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Process jobs until shutdown; queued jobs are finished first.
    pub async fn run(&self) {
        let Some(mut receiver) = self.receiver.lock().await.take() else {
            warn!("Copy pool already running");
            return;
        };
        info!("Copy pool started");
        loop {
            tokio::select! {
                job = receiver.recv() => match job {
                    Some(queued) => queued.run().await,
                    None => break,
                },
                _ = self.shutdown.notified() => {
                    receiver.close();
                    while let Some(queued) = receiver.recv().await {
                        queued.run().await;
                    }
                    break;
                }
            }
        }
        info!("Copy pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_plan_avoids_collisions() {
        let staging = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("cache.abc"), "old").unwrap();

        let a = staging.path().join("cache.abc");
        let job = CopyJob::plan(std::slice::from_ref(&a), dest.path());
        assert_eq!(job.destinations(), vec![dest.path().join("cache_1.abc")]);
        assert_eq!(job.staging.as_deref(), Some(staging.path()));
    }

    #[tokio::test]
    async fn test_run_removes_staging_when_complete() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("temp");
        std::fs::create_dir(&staging).unwrap();
        let dest = root.path().join("0001");
        std::fs::create_dir(&dest).unwrap();
        let files = vec![write(&staging, "a.abc", "a"), write(&staging, "b.abc", "b")];

        let job = CopyJob::plan(&files, &dest);
        assert!(!job.should_defer().await);
        let copied = job.run().await;

        assert_eq!(copied.len(), 2);
        assert_eq!(std::fs::read_to_string(dest.join("b.abc")).unwrap(), "b");
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn test_partial_copy_keeps_staging() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("temp");
        std::fs::create_dir(&staging).unwrap();
        let dest = root.path().join("0001");
        std::fs::create_dir(&dest).unwrap();
        let present = write(&staging, "a.abc", "a");
        let missing = staging.join("gone.abc");

        let copied = CopyJob::plan(&[present, missing], &dest).run().await;
        assert_eq!(copied.len(), 1);
        assert!(staging.exists());
    }

    #[tokio::test]
    async fn test_many_files_are_deferred() {
        let dest = tempfile::tempdir().unwrap();
        let sources: Vec<PathBuf> = (0..=DEFER_FILES)
            .map(|i| PathBuf::from(format!("/nowhere/f{i}.exr")))
            .collect();
        assert!(CopyJob::plan(&sources, dest.path()).should_defer().await);
    }

    #[tokio::test]
    async fn test_pool_finishes_queued_jobs_on_shutdown() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("temp");
        std::fs::create_dir(&staging).unwrap();
        let dest = root.path().join("0002");
        std::fs::create_dir(&dest).unwrap();
        let file = write(&staging, "x.usd", "x");

        let pool = Arc::new(CopyPool::new());
        assert!(pool.submit(CopyJob::plan(&[file], &dest)));
        let shutdown = pool.shutdown_handle();
        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run().await })
        };
        shutdown.notify_one();
        runner.await.unwrap();

        assert!(dest.join("x.usd").exists());
    }

    #[tokio::test]
    async fn test_follow_up_runs_after_every_copy() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("temp");
        std::fs::create_dir(&staging).unwrap();
        let dest = root.path().join("0003");
        std::fs::create_dir(&dest).unwrap();
        let files: Vec<PathBuf> = (0..DEFER_FILES + 5)
            .map(|i| write(&staging, &format!("frame.{i:04}.exr"), &"x".repeat(4096)))
            .collect();
        let job = CopyJob::plan(&files, &dest);
        assert!(job.should_defer().await);

        let pool = Arc::new(CopyPool::new());
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let listed = dest.clone();
        let then: FollowUp = Box::pin(async move {
            let count = std::fs::read_dir(&listed).unwrap().count();
            let _ = seen_tx.send(count);
        });
        assert!(pool.submit_then(job, then).is_ok());
        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run().await })
        };

        assert_eq!(seen_rx.await.unwrap(), DEFER_FILES + 5);
        pool.shutdown_handle().notify_one();
        runner.await.unwrap();
    }

    #[test]
    fn test_stopped_pool_hands_the_job_back() {
        let pool = CopyPool::new();
        drop(pool.receiver.try_lock().unwrap().take());
        let job = CopyJob::plan(&[PathBuf::from("/nowhere/a.abc")], Path::new("/nowhere"));
        let (returned, _then) = pool
            .submit_then(job.clone(), Box::pin(async {}))
            .err()
            .unwrap();
        assert_eq!(returned, job);
    }
}
