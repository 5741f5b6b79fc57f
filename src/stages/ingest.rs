/*!
 * Ingest stage: polls one account's feed and stores new posts as `Pending`.
 */

use log::{error, info, warn};
use std::sync::Arc;

use super::ScanGuard;
use crate::app_config::AccountConfig;
use crate::errors::{ProviderError, StageError};
use crate::events::{EventBus, PipelineEvent};
use crate::platform::{FeedSource, compare_post_ids};
use crate::store::{NewPost, PipelineStore};

/// Per-account ingest service
pub struct IngestService {
    account: AccountConfig,
    store: Arc<dyn PipelineStore>,
    feed: Arc<dyn FeedSource>,
    bus: Arc<EventBus>,
    max_posts_per_request: usize,
    guard: ScanGuard,
}

impl IngestService {
    pub fn new(
        account: AccountConfig,
        store: Arc<dyn PipelineStore>,
        feed: Arc<dyn FeedSource>,
        bus: Arc<EventBus>,
        max_posts_per_request: usize,
    ) -> Arc<Self> {
        let guard = ScanGuard::new(format!("ingest:{}", account.name));
        Arc::new(Self {
            account,
            store,
            feed,
            bus,
            max_posts_per_request,
            guard,
        })
    }

    pub fn account(&self) -> &AccountConfig {
        &self.account
    }

    /// Whether a scan of this service is running
    pub fn is_scanning(&self) -> bool {
        self.guard.is_running()
    }

    /// Poll the feed until no re-scan is pending. Returns false when the
    /// trigger was merged into a scan already running.
    pub async fn scan(&self) -> bool {
        let Some(mut permit) = self.guard.try_enter() else {
            return false;
        };
        loop {
            match self.scan_once().await {
                Ok(stored) if stored > 0 => {
                    self.bus.emit(&PipelineEvent::IngestionCompleted {
                        account_id: self.account.name.clone(),
                        outcome: Ok(stored),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[ingest:{}] Scan failed: {}", self.account.name, e);
                    self.bus.emit(&PipelineEvent::IngestionCompleted {
                        account_id: self.account.name.clone(),
                        outcome: Err(e.to_string()),
                    });
                }
            }
            if !permit.should_rescan() {
                return true;
            }
        }
    }

    /// One poll; returns the number of newly stored posts
    async fn scan_once(&self) -> Result<usize, StageError> {
        let name = &self.account.name;
        let cursor = self
            .store
            .ingest_cursor(name)
            .await
            .map_err(StageError::Store)?;

        let posts = match self
            .feed
            .fetch_posts(&self.account, cursor.as_deref(), self.max_posts_per_request)
            .await
        {
            Ok(posts) => posts,
            Err(ProviderError::RateLimitExceeded {
                retry_after_secs, ..
            }) => {
                warn!(
                    "[ingest:{}] Feed rate limited (retry after {:?}s); skipping this scan",
                    name, retry_after_secs
                );
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(newest) = posts
            .iter()
            .map(|p| p.id.clone())
            .max_by(|a, b| compare_post_ids(a, b))
        else {
            info!("[ingest:{}] No new posts", name);
            return Ok(0);
        };

        let fetched = posts.len();
        let new_posts: Vec<NewPost> = posts.into_iter().map(NewPost::from).collect();
        let stored = self
            .store
            .insert_posts(new_posts)
            .await
            .map_err(StageError::Store)?;
        self.store
            .set_ingest_cursor(name, &newest)
            .await
            .map_err(StageError::Store)?;

        info!(
            "[ingest:{}] Stored {} of {} fetched post(s), cursor at {}",
            name, stored, fetched, newest
        );
        Ok(stored)
    }
}
