use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gphotos_core::{PhotosClient, TokenClient, UploadProfile};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mirror::{MirrorStore, default_db_path};
use crate::sync::backoff::{Backoff, CycleSchedule};
use crate::sync::{SyncEngine, SyncError, SyncReport, SyncTrigger};
use crate::upload::{
    DEFAULT_MAX_FILE_BYTES, Disposition, UploadCandidate, UploadConfig, UploadPipeline,
    UploadReport,
};

const DEFAULT_TOKEN_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_UPLOAD_WORKERS: u64 = 1;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const SYNC_RETRY_BASE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub identity: String,
    pub token_url: String,
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub db_path: PathBuf,
    pub sync_interval: Duration,
    pub upload: UploadConfig,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars<F>(var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let identity = read_string_var(&var, "GPHOTOS_IDENTITY")
            .context("GPHOTOS_IDENTITY is not set")?;
        let home = dirs::home_dir().unwrap_or_default();
        let db_path = match read_string_var(&var, "GPHOTOS_DB_PATH") {
            Some(value) => expand_with_home(&value, &home),
            None => default_db_path(&identity).context("no location for the mirror database")?,
        };
        let profile = match read_string_var(&var, "GPHOTOS_UPLOAD_PROFILE") {
            Some(value) => value.parse::<UploadProfile>()?,
            None => UploadProfile::default(),
        };
        let workers = read_u64_var(&var, "GPHOTOS_UPLOAD_WORKERS", DEFAULT_UPLOAD_WORKERS);
        let disposition = Disposition {
            done_dir: read_string_var(&var, "GPHOTOS_DONE_DIR")
                .map(|value| expand_with_home(&value, &home)),
            error_dir: read_string_var(&var, "GPHOTOS_ERROR_DIR")
                .map(|value| expand_with_home(&value, &home)),
            delete_uploaded: read_bool_var(&var, "GPHOTOS_DELETE_UPLOADED", false),
        };

        Ok(Self {
            token_url: read_string_var(&var, "GPHOTOS_TOKEN_URL")
                .unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            api_url: read_string_var(&var, "GPHOTOS_API_URL"),
            token: read_string_var(&var, "GPHOTOS_TOKEN"),
            db_path,
            sync_interval: Duration::from_secs(read_u64_var(
                &var,
                "GPHOTOS_SYNC_INTERVAL_SECS",
                DEFAULT_SYNC_INTERVAL_SECS,
            )),
            upload: UploadConfig {
                workers: usize::try_from(workers).unwrap_or(usize::MAX),
                profile,
                max_file_bytes: read_u64_var(
                    &var,
                    "GPHOTOS_MAX_FILE_BYTES",
                    DEFAULT_MAX_FILE_BYTES,
                ),
                disposition,
                batch_root: None,
            },
            identity,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    client: PhotosClient,
    engine: Arc<SyncEngine>,
    trigger: SyncTrigger,
    cancel: CancellationToken,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let tokens = TokenClient::with_base_url(&config.token_url, &config.identity)
            .context("invalid token service url")?;
        let mut client = match config.api_url.as_deref() {
            Some(url) => PhotosClient::with_base_url(url, tokens),
            None => PhotosClient::new(tokens),
        }
        .context("invalid photos api url")?;
        if let Some(token) = config.token.as_deref() {
            client = client.with_token(token);
        }

        let store = MirrorStore::open(&config.db_path, &config.identity)
            .await
            .with_context(|| {
                format!("failed to open mirror database at {}", config.db_path.display())
            })?;
        let cancel = CancellationToken::new();
        let engine = Arc::new(SyncEngine::new(client.clone(), store).with_cancellation(cancel.clone()));

        Ok(Self {
            config,
            client,
            engine,
            trigger: SyncTrigger::new(),
            cancel,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn trigger(&self) -> SyncTrigger {
        self.trigger.clone()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels all work on the first Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    /// Raises the sync trigger on every SIGHUP until cancelled.
    #[cfg(unix)]
    pub fn trigger_on_hangup(&self) -> anyhow::Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut hangup =
            signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
        let trigger = self.trigger.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = hangup.recv() => {
                        if received.is_none() {
                            break;
                        }
                        info!("hangup received, triggering sync");
                        trigger.trigger();
                    }
                }
            }
        });
        Ok(())
    }

    pub async fn sync_once(&self) -> anyhow::Result<SyncReport> {
        self.engine.run_cycle().await.context("sync cycle failed")
    }

    /// Uploads `paths`. Relative paths are resolved against the working
    /// directory, which also serves as the batch root unless one is configured.
    pub async fn upload(&self, paths: Vec<PathBuf>) -> UploadReport {
        let cwd = std::env::current_dir().ok();
        let mut config = self.config.upload.clone();
        if config.batch_root.is_none() {
            config.batch_root = cwd.clone();
        }
        let pipeline = UploadPipeline::new(self.client.clone(), config)
            .with_sync(Arc::clone(&self.engine))
            .with_cancellation(self.cancel.clone());
        let candidates = anchor_paths(paths, cwd.as_deref())
            .into_iter()
            .map(UploadCandidate::new)
            .collect();
        pipeline.run(candidates).await
    }

    /// Scheduled sync loop; returns once cancelled.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            identity = %self.config.identity,
            db = %self.config.db_path.display(),
            interval_secs = self.config.sync_interval.as_secs(),
            "gphotosd started"
        );
        let backoff = Backoff::new(SYNC_RETRY_BASE, self.config.sync_interval, true);
        let mut schedule = CycleSchedule::new(self.config.sync_interval, backoff);

        loop {
            let wait = match self.engine.run_cycle().await {
                Ok(_) => schedule.record_success(),
                Err(SyncError::Cancelled) => break,
                Err(err) => {
                    let wait = schedule.record_failure();
                    warn!(
                        error = %err,
                        failures = schedule.failures(),
                        retry_in_secs = wait.as_secs(),
                        "sync cycle failed"
                    );
                    wait
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
                _ = self.trigger.notified() => debug!("sync triggered"),
            }
        }

        info!("gphotosd stopped");
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
