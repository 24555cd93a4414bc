use std::sync::Arc;

use gphotos_core::{DeltaPage, PhotosClient, PhotosError};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::mirror::{CursorUpdate, MirrorError, MirrorStore, PageEffect, SyncCursor};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote error: {0}")]
    Remote(#[from] PhotosError),
    #[error("mirror error: {0}")]
    Mirror(#[from] MirrorError),
    #[error("sync cycle cancelled")]
    Cancelled,
}

/// Counters of one completed sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    pub updated: usize,
    pub deleted: usize,
    pub pages: usize,
    /// True when this cycle finished the initial library download.
    pub initialized: bool,
}

impl SyncReport {
    fn absorb(&mut self, effect: PageEffect) {
        self.updated += effect.upserted;
        self.deleted += effect.deleted;
        self.pages += 1;
    }
}

/// Wakes the scheduled loop. Triggers raised while a cycle runs collapse
/// into a single follow-up cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
}

impl SyncTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Keeps the mirror converged with the remote library.
///
/// The cursor is advanced in the same transaction as the page it describes,
/// so an interrupted cycle resumes at the first unapplied page.
pub struct SyncEngine {
    client: PhotosClient,
    store: MirrorStore,
    cycle: Mutex<()>,
    last_report: watch::Sender<Option<SyncReport>>,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(client: PhotosClient, store: MirrorStore) -> Self {
        let (last_report, _) = watch::channel(None);
        Self {
            client,
            store,
            cycle: Mutex::new(()),
            last_report,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &MirrorStore {
        &self.store
    }

    pub fn client(&self) -> &PhotosClient {
        &self.client
    }

    /// Counters of the last successful cycle, if any.
    pub fn last_report(&self) -> Option<SyncReport> {
        *self.last_report.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SyncReport>> {
        self.last_report.subscribe()
    }

    /// Runs one full cycle. Concurrent callers wait for the running cycle to
    /// finish and then run their own.
    pub async fn run_cycle(&self) -> Result<SyncReport, SyncError> {
        let _guard = self.cycle.lock().await;
        let identity = self.store.identity();

        let cursor = self.store.get_cursor().await?;
        let initializing = !cursor.init_complete;
        let mut report = SyncReport::default();

        if cursor.is_paging() {
            info!(identity, page_token = %cursor.page_token, "resuming interrupted pagination");
            let anchor = resume_anchor(&cursor);
            self.drain_pages(cursor.page_token.clone(), &anchor, initializing, &mut report)
                .await?;
        }

        self.ensure_active()?;
        let state_token = self.store.get_cursor().await?.state_token;
        let page = self.client.get_library_state(&state_token).await?;
        let next_page = page.page_token.clone();
        let update = CursorUpdate {
            state_token: Some(next_state_token(&page, &state_token)),
            page_token: Some(next_page.clone()),
            page_anchor: Some(if next_page.is_empty() {
                String::new()
            } else {
                state_token.clone()
            }),
        };
        self.apply(&page, &update, &mut report).await?;

        if !next_page.is_empty() {
            self.drain_pages(next_page, &state_token, initializing, &mut report)
                .await?;
        }

        if initializing {
            self.store.set_init_complete(true).await?;
            report.initialized = true;
        }
        self.store
            .mark_synced(OffsetDateTime::now_utc().unix_timestamp())
            .await?;

        info!(
            identity,
            updated = report.updated,
            deleted = report.deleted,
            pages = report.pages,
            initialized = report.initialized,
            "sync cycle complete"
        );
        self.last_report.send_replace(Some(report));
        Ok(report)
    }

    async fn drain_pages(
        &self,
        mut page_token: String,
        anchor: &str,
        initializing: bool,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        while !page_token.is_empty() {
            self.ensure_active()?;
            let page = if initializing {
                self.client.get_library_page_init(&page_token).await?
            } else {
                self.client.get_library_page(&page_token, anchor).await?
            };
            let next = page.page_token.clone();
            let update = CursorUpdate {
                state_token: None,
                page_token: Some(next.clone()),
                page_anchor: next.is_empty().then(String::new),
            };
            self.apply(&page, &update, report).await?;
            page_token = next;
        }
        Ok(())
    }

    async fn apply(
        &self,
        page: &DeltaPage,
        update: &CursorUpdate,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let effect = self.store.apply_page(page, update).await?;
        debug!(
            identity = self.store.identity(),
            upserted = effect.upserted,
            deleted = effect.deleted,
            more = page.has_next_page(),
            "applied delta page"
        );
        report.absorb(effect);
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

/// State token a resumed pagination must be continued against.
fn resume_anchor(cursor: &SyncCursor) -> String {
    if cursor.page_anchor.is_empty() {
        cursor.state_token.clone()
    } else {
        cursor.page_anchor.clone()
    }
}

fn next_state_token(page: &DeltaPage, requested: &str) -> String {
    if page.state_token.is_empty() {
        requested.to_string()
    } else {
        page.state_token.clone()
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
