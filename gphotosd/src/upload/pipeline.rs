use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gphotos_core::{CommitRequest, ContentHash, PhotosClient, PhotosError, UploadProfile};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::disposition::{Disposition, Outcome};
use super::hash::{HashError, hash_file};
use super::queue::CandidateQueue;
use crate::sync::{SyncEngine, SyncReport};

pub const DEFAULT_MAX_FILE_BYTES: u64 = 100 * 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("remote error: {0}")]
    Remote(#[from] PhotosError),
    #[error("hash error: {0}")]
    Hash(#[from] HashError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
}

impl UploadError {
    fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Hash(HashError::Cancelled))
    }
}

/// A local file to be made present in the remote library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCandidate {
    pub path: PathBuf,
    /// Skips hashing when already known.
    pub hash: Option<ContentHash>,
}

impl UploadCandidate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.hash = Some(hash);
        self
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub workers: usize,
    pub profile: UploadProfile,
    pub max_file_bytes: u64,
    pub disposition: Disposition,
    /// Directory the candidates were discovered under; relocated files keep
    /// their path relative to it.
    pub batch_root: Option<PathBuf>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            profile: UploadProfile::default(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            disposition: Disposition::default(),
            batch_root: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Source path to media key, for uploads and duplicates alike.
    pub succeeded: BTreeMap<PathBuf, String>,
    pub failed: usize,
    pub duplicates: usize,
    pub bytes_uploaded: u64,
    /// Candidates never started because the batch was cancelled.
    pub skipped: usize,
    /// Mirror refresh run after the batch, if any.
    pub sync: Option<SyncReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CandidateOutcome {
    Duplicate { media_key: String },
    Uploaded { media_key: String, bytes: u64 },
}

/// Serialises work on identical content within one batch.
#[derive(Default)]
struct HashLocks {
    inner: Mutex<HashMap<ContentHash, Arc<Mutex<()>>>>,
}

impl HashLocks {
    async fn acquire(&self, hash: ContentHash) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            locks.entry(hash).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Uploads batches of candidates with a fixed number of workers.
pub struct UploadPipeline {
    client: PhotosClient,
    config: Arc<UploadConfig>,
    sync: Option<Arc<SyncEngine>>,
    cancel: CancellationToken,
}

impl UploadPipeline {
    pub fn new(client: PhotosClient, config: UploadConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
            sync: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Refreshes the mirror through `engine` after batches with a success.
    pub fn with_sync(mut self, engine: Arc<SyncEngine>) -> Self {
        self.sync = Some(engine);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Processes every candidate to a terminal state. One candidate failing
    /// never stops the others.
    pub async fn run(&self, candidates: Vec<UploadCandidate>) -> UploadReport {
        let total = candidates.len();
        let queue = Arc::new(Mutex::new(candidates.into_iter().collect::<CandidateQueue>()));
        let locks = Arc::new(HashLocks::default());
        let workers = self.config.workers.max(1).min(total.max(1));
        info!(candidates = total, workers, "starting upload batch");

        let (results, collected) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                client: self.client.clone(),
                config: Arc::clone(&self.config),
                locks: Arc::clone(&locks),
                queue: Arc::clone(&queue),
                cancel: self.cancel.clone(),
                results: results.clone(),
            };
            tasks.spawn(worker.run());
        }
        drop(results);

        let mut report = gather(collected, tasks, &queue, total).await;

        info!(
            succeeded = report.succeeded.len(),
            duplicates = report.duplicates,
            failed = report.failed,
            skipped = report.skipped,
            bytes = report.bytes_uploaded,
            "upload batch finished"
        );

        if !report.succeeded.is_empty() {
            if let Some(engine) = &self.sync {
                match engine.run_cycle().await {
                    Ok(sync) => report.sync = Some(sync),
                    Err(err) => warn!(error = %err, "post-upload sync failed"),
                }
            }
        }
        report
    }
}

/// Waits for every worker and builds the report from the results they sent.
/// Candidates held by a panicked worker count as failed.
async fn gather(
    mut collected: mpsc::UnboundedReceiver<CandidateResult>,
    mut tasks: JoinSet<()>,
    queue: &Mutex<CandidateQueue>,
    total: usize,
) -> UploadReport {
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "upload worker panicked");
        }
    }

    let skipped = queue.lock().await.drain().len();
    let mut report = UploadReport {
        skipped,
        ..UploadReport::default()
    };
    let mut settled = skipped;
    while let Ok((path, result)) = collected.try_recv() {
        record_result(&mut report, path, result);
        settled += 1;
    }
    let lost = total.saturating_sub(settled);
    if lost > 0 {
        error!(lost, "candidates abandoned by a panicked worker");
        report.failed += lost;
    }
    report
}

fn record_result(
    report: &mut UploadReport,
    path: PathBuf,
    result: Result<CandidateOutcome, UploadError>,
) {
    match result {
        Ok(CandidateOutcome::Duplicate { media_key }) => {
            report.duplicates += 1;
            report.succeeded.insert(path, media_key);
        }
        Ok(CandidateOutcome::Uploaded { media_key, bytes }) => {
            report.bytes_uploaded += bytes;
            report.succeeded.insert(path, media_key);
        }
        Err(err) if err.is_cancelled() => report.skipped += 1,
        Err(_) => report.failed += 1,
    }
}

struct Worker {
    id: usize,
    client: PhotosClient,
    config: Arc<UploadConfig>,
    locks: Arc<HashLocks>,
    queue: Arc<Mutex<CandidateQueue>>,
    cancel: CancellationToken,
    results: mpsc::UnboundedSender<CandidateResult>,
}

type CandidateResult = (PathBuf, Result<CandidateOutcome, UploadError>);

impl Worker {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                debug!(worker = self.id, "cancelled, not taking further candidates");
                break;
            }
            let Some(candidate) = self.queue.lock().await.dequeue() else {
                break;
            };
            let result = self.process(&candidate).await;
            self.settle(&candidate.path, &result).await;
            if self.results.send((candidate.path, result)).is_err() {
                break;
            }
        }
    }

    async fn process(&self, candidate: &UploadCandidate) -> Result<CandidateOutcome, UploadError> {
        let path = candidate.path.as_path();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(UploadError::NotAFile(path.to_path_buf()));
        }
        let size = metadata.len();
        if size > self.config.max_file_bytes {
            return Err(UploadError::TooLarge {
                size,
                limit: self.config.max_file_bytes,
            });
        }
        let modified_at = metadata
            .modified()
            .map(|at| OffsetDateTime::from(at).unix_timestamp())
            .unwrap_or_default();

        let hash = match candidate.hash {
            Some(hash) => hash,
            None => {
                hash_file(path, &self.cancel, |progress| {
                    trace!(
                        path = %path.display(),
                        hashed = progress.hashed,
                        total = progress.total,
                        "hashing"
                    );
                })
                .await?
                .hash
            }
        };

        let _guard = self.locks.acquire(hash).await;
        if let Some(media_key) = self.client.find_by_hash(&hash).await? {
            return Ok(CandidateOutcome::Duplicate { media_key });
        }

        let upload_token = self.client.get_upload_token(&hash, size).await?;
        let receipt = self.client.upload_file(&upload_token, path).await?;
        let media_key = self
            .client
            .commit_upload(&CommitRequest {
                receipt,
                file_name: file_name_of(path),
                hash,
                modified_at,
                profile: self.config.profile,
            })
            .await?;
        Ok(CandidateOutcome::Uploaded {
            media_key,
            bytes: size,
        })
    }

    async fn settle(&self, path: &Path, result: &Result<CandidateOutcome, UploadError>) {
        let outcome = match result {
            Ok(CandidateOutcome::Duplicate { media_key }) => {
                info!(path = %path.display(), media_key = %media_key, "already in library");
                Outcome::Duplicate
            }
            Ok(CandidateOutcome::Uploaded { media_key, bytes }) => {
                info!(path = %path.display(), media_key = %media_key, bytes = *bytes, "uploaded");
                Outcome::Uploaded
            }
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "upload failed");
                Outcome::Failed
            }
        };

        let batch_root = self.config.batch_root.as_deref();
        match self.config.disposition.apply(batch_root, path, outcome).await {
            Ok(placement) => debug!(path = %path.display(), ?placement, "file settled"),
            Err(err) => warn!(path = %path.display(), error = %err, "could not settle file"),
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
