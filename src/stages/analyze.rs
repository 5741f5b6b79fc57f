/*!
 * Analyze stage: groups pending posts into threads.
 *
 * A post belongs to the thread named by its conversation id, or to a thread
 * of its own when it has none. The post whose id equals the thread id is the
 * root. Posts move `Pending -> Analyzed`; every thread that received posts
 * and is still `Pending` then moves to `Analyzed` and is announced with
 * `AnalysisCompleted`.
 */

use log::{debug, info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::ScanGuard;
use crate::errors::StageError;
use crate::events::{EventBus, EventHandler, EventKind, PipelineEvent};
use crate::status::Status;
use crate::store::{PipelineStore, Thread, transition_post, transition_thread};

/// Global analyze service
pub struct AnalyzeService {
    store: Arc<dyn PipelineStore>,
    bus: Arc<EventBus>,
    guard: ScanGuard,
    /// Event-triggered scans spawned but not yet finished
    background: AtomicUsize,
}

impl AnalyzeService {
    /// Create the service and subscribe it to successful ingestions
    pub fn new(store: Arc<dyn PipelineStore>, bus: Arc<EventBus>) -> Arc<Self> {
        let service = Arc::new(Self {
            store,
            bus: bus.clone(),
            guard: ScanGuard::new("analyze"),
            background: AtomicUsize::new(0),
        });
        bus.subscribe(EventKind::IngestionCompleted, Self::handler(&service));
        service
    }

    fn handler(service: &Arc<Self>) -> EventHandler {
        let weak: Weak<Self> = Arc::downgrade(service);
        Arc::new(move |event: &PipelineEvent| {
            let PipelineEvent::IngestionCompleted { outcome, .. } = event else {
                return Ok(());
            };
            if outcome.is_err() {
                return Ok(());
            }
            let Some(service) = weak.upgrade() else {
                return Ok(());
            };
            let handle = tokio::runtime::Handle::try_current()?;
            service.background.fetch_add(1, Ordering::SeqCst);
            handle.spawn(async move {
                service.scan().await;
                service.background.fetch_sub(1, Ordering::SeqCst);
            });
            Ok(())
        })
    }

    /// No scan running and none scheduled by an ingestion event
    pub fn is_idle(&self) -> bool {
        self.background.load(Ordering::SeqCst) == 0 && !self.guard.is_running()
    }

    /// Analyze until no re-scan is pending. Returns false when the trigger
    /// was merged into a scan already running.
    pub async fn scan(&self) -> bool {
        let Some(mut permit) = self.guard.try_enter() else {
            return false;
        };
        loop {
            if let Err(e) = self.scan_once().await {
                warn!("[analyze] Scan aborted: {}", e);
            }
            if !permit.should_rescan() {
                return true;
            }
        }
    }

    /// One pass over pending posts; returns the number of threads announced
    async fn scan_once(&self) -> Result<usize, StageError> {
        let store = self.store.as_ref();
        let posts = store
            .posts_by_status(Status::Pending)
            .await
            .map_err(StageError::Store)?;
        if posts.is_empty() {
            debug!("[analyze] No pending posts");
            return Ok(0);
        }

        let mut touched: Vec<Thread> = Vec::new();
        for post in &posts {
            let thread_id = post.thread_key().to_string();
            let thread = store
                .ensure_thread(&thread_id, &post.author_id)
                .await
                .map_err(StageError::Store)?;
            store
                .attach_post(&post.id, &thread_id, post.id == thread_id)
                .await
                .map_err(StageError::Store)?;

            match transition_post(store, post, Status::Analyzed).await {
                Ok(_) => {}
                Err(StageError::Transition(e)) => {
                    warn!("[analyze] Skipping post {}: {}", post.id, e);
                    continue;
                }
                Err(e) => return Err(e),
            }

            if thread.status != Status::Pending {
                warn!(
                    "[analyze] Post {} joined thread {} which is already {}",
                    post.id, thread.id, thread.status
                );
                continue;
            }
            if !touched.iter().any(|t| t.id == thread.id) {
                touched.push(thread);
            }
        }

        let mut announced = 0;
        for thread in touched {
            match transition_thread(store, &thread, Status::Analyzed).await {
                Ok(true) => {
                    self.bus.emit(&PipelineEvent::AnalysisCompleted {
                        thread_id: thread.id.clone(),
                        author_id: thread.author_id.clone(),
                    });
                    announced += 1;
                }
                Ok(false) => debug!("[analyze] Thread {} moved on concurrently", thread.id),
                Err(StageError::Transition(e)) => {
                    warn!("[analyze] Skipping thread {}: {}", thread.id, e)
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "[analyze] Analyzed {} post(s) into {} thread(s)",
            posts.len(),
            announced
        );
        Ok(announced)
    }
}
