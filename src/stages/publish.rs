/*!
 * Publish stage.
 *
 * `PublishService` owns one account's publication queue and feeds it with
 * translated threads of that account. `PublishProcessor` publishes the
 * posts of a thread root first, each as a reply to the previous one.
 * Posts published by an earlier attempt are not sent again; their platform
 * id anchors the next reply.
 */

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::{ScanGuard, ThreadTask, fail_thread};
use crate::app_config::{AccountConfig, QueueSettings};
use crate::errors::{ProviderError, StageError};
use crate::events::{EventBus, EventHandler, EventKind, PipelineEvent};
use crate::platform::PublishTarget;
use crate::queue::{Task, TaskId, TaskProcessor, TaskQueue};
use crate::status::Status;
use crate::store::{PipelineStore, transition_thread};

const TASK_TYPE: &str = "publish";

/// Rate-limit waits allowed for a single post before the attempt fails
const MAX_RATE_LIMIT_WAITS: u32 = 3;

/// Publishes the posts of one thread
pub struct PublishProcessor {
    account: AccountConfig,
    store: Arc<dyn PipelineStore>,
    publisher: Arc<dyn PublishTarget>,
    max_rate_limit_wait: Duration,
}

impl PublishProcessor {
    pub fn new(
        account: AccountConfig,
        store: Arc<dyn PipelineStore>,
        publisher: Arc<dyn PublishTarget>,
        max_rate_limit_wait: Duration,
    ) -> Self {
        Self {
            account,
            store,
            publisher,
            max_rate_limit_wait,
        }
    }

    /// Publish one post, waiting out short rate-limit resets in place
    async fn publish_post(&self, text: &str, reply_to: Option<&str>) -> Result<String, ProviderError> {
        let mut waits = 0;
        loop {
            match self.publisher.publish(&self.account, text, reply_to).await {
                Ok(id) => return Ok(id),
                Err(e) => {
                    let wait = e.retry_after().map(Duration::from_secs);
                    match wait {
                        Some(wait) if wait <= self.max_rate_limit_wait && waits < MAX_RATE_LIMIT_WAITS => {
                            waits += 1;
                            warn!(
                                "[publish:{}] Rate limited; waiting {:?} before retrying",
                                self.account.name, wait
                            );
                            tokio::time::sleep(wait).await;
                        }
                        _ => return Err(e),
                    }
                }
            }
        }
    }

    async fn publish_thread(&self, thread_id: &str) -> Result<(), StageError> {
        let store = self.store.as_ref();
        let thread = store
            .get_thread(thread_id)
            .await
            .map_err(StageError::Store)?
            .ok_or_else(|| StageError::NotFound {
                entity: "thread",
                id: thread_id.to_string(),
            })?;

        if thread.status != Status::Translated {
            debug!(
                "[publish:{}] Thread {} is {}; nothing to do",
                self.account.name, thread.id, thread.status
            );
            return Ok(());
        }

        let posts = store
            .thread_posts(thread_id)
            .await
            .map_err(StageError::Store)?;
        let mut reply_to: Option<String> = None;
        let mut published = 0;
        for post in &posts {
            match post.status {
                Status::Published => {
                    if let Some(id) = &post.published_id {
                        reply_to = Some(id.clone());
                    }
                    continue;
                }
                Status::Translated => {}
                other => {
                    warn!(
                        "[publish:{}] Skipping post {} of thread {}: status {}",
                        self.account.name, post.id, thread.id, other
                    );
                    continue;
                }
            }

            let text = match post.translated_text.as_deref() {
                Some(text) => text,
                None => {
                    warn!(
                        "[publish:{}] Post {} has no translated text; publishing the original",
                        self.account.name, post.id
                    );
                    post.text.as_str()
                }
            };

            let platform_id = self.publish_post(text, reply_to.as_deref()).await?;
            store
                .mark_published(&post.id, &platform_id)
                .await
                .map_err(StageError::Store)?;
            reply_to = Some(platform_id);
            published += 1;
        }

        if transition_thread(store, &thread, Status::Published).await? {
            info!(
                "[publish:{}] Thread {} published ({} post(s))",
                self.account.name, thread.id, published
            );
        }
        Ok(())
    }
}

#[async_trait]
impl TaskProcessor for PublishProcessor {
    async fn process(&self, task: &Task) -> anyhow::Result<()> {
        let payload: ThreadTask = task.decode()?;

        match self.publish_thread(&payload.thread_id).await {
            Ok(()) => Ok(()),
            Err(StageError::Transition(e)) => {
                warn!("[publish:{}] Thread {}: {}", self.account.name, payload.thread_id, e);
                Ok(())
            }
            Err(e) => {
                if task.is_final_attempt() {
                    if let Err(fail) =
                        fail_thread(self.store.as_ref(), &payload.thread_id, Status::Translated)
                            .await
                    {
                        warn!(
                            "[publish:{}] Could not mark thread {} failed: {}",
                            self.account.name, payload.thread_id, fail
                        );
                    }
                }
                Err(e.into())
            }
        }
    }
}

/// Per-account publish service
pub struct PublishService {
    account: AccountConfig,
    store: Arc<dyn PipelineStore>,
    queue: TaskQueue,
    queued: Mutex<HashMap<String, TaskId>>,
    guard: ScanGuard,
}

impl PublishService {
    /// Create the service, install its processor and subscribe it to
    /// successful `TranslationCompleted` events
    pub fn new(
        account: AccountConfig,
        store: Arc<dyn PipelineStore>,
        bus: Arc<EventBus>,
        publisher: Arc<dyn PublishTarget>,
        settings: &QueueSettings,
        max_rate_limit_wait: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let queue = TaskQueue::new(settings.to_queue_config(format!("publish:{}", account.name)));
        queue.set_processor(Arc::new(PublishProcessor::new(
            account.clone(),
            store.clone(),
            publisher,
            max_rate_limit_wait,
        )))?;

        let service = Arc::new(Self {
            guard: ScanGuard::new(format!("publish:{}", account.name)),
            account,
            store,
            queue,
            queued: Mutex::new(HashMap::new()),
        });
        bus.subscribe(EventKind::TranslationCompleted, Self::handler(&service));
        Ok(service)
    }

    fn handler(service: &Arc<Self>) -> EventHandler {
        let weak: Weak<Self> = Arc::downgrade(service);
        Arc::new(move |event: &PipelineEvent| {
            let PipelineEvent::TranslationCompleted {
                thread_id,
                author_id,
                outcome,
            } = event
            else {
                return Ok(());
            };
            if outcome.is_err() {
                return Ok(());
            }
            let Some(service) = weak.upgrade() else {
                return Ok(());
            };
            if *author_id != service.account.target_user_id {
                return Ok(());
            }
            service.enqueue(thread_id);
            Ok(())
        })
    }

    pub fn account(&self) -> &AccountConfig {
        &self.account
    }

    /// Whether a scan of this service is running
    pub fn is_scanning(&self) -> bool {
        self.guard.is_running()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Queue a thread unless a task for it is still pending or in flight
    pub fn enqueue(&self, thread_id: &str) -> Option<TaskId> {
        let mut queued = self.queued.lock();
        if let Some(existing) = queued.get(thread_id) {
            if self.queue.task_status(*existing).is_some() {
                debug!(
                    "[publish:{}] Thread {} already queued as {}",
                    self.account.name, thread_id, existing
                );
                return None;
            }
        }
        let task = self.queue.add_task(TASK_TYPE, ThreadTask::payload(thread_id));
        queued.insert(thread_id.to_string(), task.id);
        Some(task.id)
    }

    /// Queue every translated thread of this account. Returns false when
    /// the trigger was merged into a scan already running.
    pub async fn scan(&self) -> bool {
        let Some(mut permit) = self.guard.try_enter() else {
            return false;
        };
        loop {
            match self
                .store
                .threads_by_status(Status::Translated, Some(&self.account.target_user_id))
                .await
            {
                Ok(threads) => {
                    let queued = threads
                        .iter()
                        .filter_map(|t| self.enqueue(&t.id))
                        .count();
                    self.queued
                        .lock()
                        .retain(|_, id| self.queue.task_status(*id).is_some());
                    info!(
                        "[publish:{}] Scan found {} translated thread(s), queued {}",
                        self.account.name,
                        threads.len(),
                        queued
                    );
                }
                Err(e) => warn!("[publish:{}] Scan aborted: {:#}", self.account.name, e),
            }
            if !permit.should_rescan() {
                return true;
            }
        }
    }
}
