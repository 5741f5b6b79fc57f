/*!
 * Translate stage.
 *
 * `TranslateService` owns one account's translation queue and feeds it with
 * analyzed threads of that account, both from `AnalysisCompleted` events and
 * from periodic scans. `TranslationProcessor` translates a thread post by
 * post; posts already translated are skipped so a retried task resumes where
 * the previous attempt stopped.
 */

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use super::{ScanGuard, ThreadTask, fail_thread};
use crate::app_config::{AccountConfig, QueueSettings};
use crate::errors::StageError;
use crate::events::{EventBus, EventHandler, EventKind, PipelineEvent};
use crate::providers::TranslationProvider;
use crate::queue::{Task, TaskId, TaskProcessor, TaskQueue};
use crate::status::{Status, is_valid_transition};
use crate::store::{PipelineStore, transition_thread};

const TASK_TYPE: &str = "translate";

/// Language pair of the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguagePair {
    pub source: String,
    pub target: String,
}

/// Translates the posts of one thread
pub struct TranslationProcessor {
    store: Arc<dyn PipelineStore>,
    bus: Arc<EventBus>,
    provider: Arc<dyn TranslationProvider>,
    languages: LanguagePair,
}

impl TranslationProcessor {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        bus: Arc<EventBus>,
        provider: Arc<dyn TranslationProvider>,
        languages: LanguagePair,
    ) -> Self {
        Self {
            store,
            bus,
            provider,
            languages,
        }
    }

    async fn translate_thread(&self, thread_id: &str) -> Result<(), StageError> {
        let store = self.store.as_ref();
        let thread = store
            .get_thread(thread_id)
            .await
            .map_err(StageError::Store)?
            .ok_or_else(|| StageError::NotFound {
                entity: "thread",
                id: thread_id.to_string(),
            })?;

        if thread.status != Status::Analyzed {
            debug!(
                "[translate] Thread {} is {}; nothing to do",
                thread.id, thread.status
            );
            return Ok(());
        }

        let posts = store
            .thread_posts(thread_id)
            .await
            .map_err(StageError::Store)?;
        let mut translated = 0;
        for post in &posts {
            if post.status == Status::Translated {
                continue;
            }
            if !is_valid_transition(post.status, Status::Translated) {
                warn!(
                    "[translate] Skipping post {} of thread {}: status {}",
                    post.id, thread.id, post.status
                );
                continue;
            }

            let text = self
                .provider
                .translate(&post.text, &self.languages.source, &self.languages.target)
                .await?;
            store
                .save_translation(&post.id, &text)
                .await
                .map_err(StageError::Store)?;
            translated += 1;
        }

        if transition_thread(store, &thread, Status::Translated).await? {
            info!(
                "[translate] Thread {} translated ({} post(s) via {})",
                thread.id,
                translated,
                self.provider.name()
            );
            self.bus.emit(&PipelineEvent::TranslationCompleted {
                thread_id: thread.id.clone(),
                author_id: thread.author_id.clone(),
                outcome: Ok(()),
            });
        }
        Ok(())
    }

    async fn give_up(&self, thread_id: &str, error: &StageError) {
        if let Err(e) = fail_thread(self.store.as_ref(), thread_id, Status::Analyzed).await {
            warn!("[translate] Could not mark thread {} failed: {}", thread_id, e);
        }
        let author_id = match self.store.get_thread(thread_id).await {
            Ok(Some(thread)) => thread.author_id,
            _ => String::new(),
        };
        self.bus.emit(&PipelineEvent::TranslationCompleted {
            thread_id: thread_id.to_string(),
            author_id,
            outcome: Err(error.to_string()),
        });
    }
}

#[async_trait]
impl TaskProcessor for TranslationProcessor {
    async fn process(&self, task: &Task) -> anyhow::Result<()> {
        let payload: ThreadTask = task.decode()?;

        match self.translate_thread(&payload.thread_id).await {
            Ok(()) => Ok(()),
            Err(StageError::Transition(e)) => {
                warn!("[translate] Thread {}: {}", payload.thread_id, e);
                Ok(())
            }
            Err(e) => {
                if task.is_final_attempt() {
                    self.give_up(&payload.thread_id, &e).await;
                }
                Err(e.into())
            }
        }
    }
}

/// Per-account translate service
pub struct TranslateService {
    account: AccountConfig,
    store: Arc<dyn PipelineStore>,
    queue: TaskQueue,
    queued: Mutex<HashMap<String, TaskId>>,
    guard: ScanGuard,
}

impl TranslateService {
    /// Create the service, install its processor and subscribe it to
    /// `AnalysisCompleted`
    pub fn new(
        account: AccountConfig,
        store: Arc<dyn PipelineStore>,
        bus: Arc<EventBus>,
        provider: Arc<dyn TranslationProvider>,
        languages: LanguagePair,
        settings: &QueueSettings,
    ) -> anyhow::Result<Arc<Self>> {
        let queue = TaskQueue::new(settings.to_queue_config(format!("translate:{}", account.name)));
        queue.set_processor(Arc::new(TranslationProcessor::new(
            store.clone(),
            bus.clone(),
            provider,
            languages,
        )))?;

        let service = Arc::new(Self {
            guard: ScanGuard::new(format!("translate:{}", account.name)),
            account,
            store,
            queue,
            queued: Mutex::new(HashMap::new()),
        });
        bus.subscribe(EventKind::AnalysisCompleted, Self::handler(&service));
        Ok(service)
    }

    fn handler(service: &Arc<Self>) -> EventHandler {
        let weak: Weak<Self> = Arc::downgrade(service);
        Arc::new(move |event: &PipelineEvent| {
            let PipelineEvent::AnalysisCompleted {
                thread_id,
                author_id,
            } = event
            else {
                return Ok(());
            };
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
                    "[translate:{}] Thread {} already queued as {}",
                    self.account.name, thread_id, existing
                );
                return None;
            }
        }
        let task = self.queue.add_task(TASK_TYPE, ThreadTask::payload(thread_id));
        queued.insert(thread_id.to_string(), task.id);
        Some(task.id)
    }

    /// Queue every analyzed thread of this account. Returns false when the
    /// trigger was merged into a scan already running.
    pub async fn scan(&self) -> bool {
        let Some(mut permit) = self.guard.try_enter() else {
            return false;
        };
        loop {
            match self
                .store
                .threads_by_status(Status::Analyzed, Some(&self.account.target_user_id))
                .await
            {
                Ok(threads) => {
                    let queued = threads
                        .iter()
                        .filter_map(|t| self.enqueue(&t.id))
                        .count();
                    self.forget_finished();
                    info!(
                        "[translate:{}] Scan found {} analyzed thread(s), queued {}",
                        self.account.name,
                        threads.len(),
                        queued
                    );
                }
                Err(e) => warn!("[translate:{}] Scan aborted: {:#}", self.account.name, e),
            }
            if !permit.should_rescan() {
                return true;
            }
        }
    }

    /// Drop bookkeeping for tasks the queue no longer knows
    fn forget_finished(&self) {
        let mut queued = self.queued.lock();
        queued.retain(|_, id| self.queue.task_status(*id).is_some());
    }
}
