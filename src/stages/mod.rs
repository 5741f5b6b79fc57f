/*!
 * Stage services of the pipeline.
 *
 * - `ingest`: per account, polls the feed and stores new posts
 * - `analyze`: global, groups pending posts into threads
 * - `translate`: per account, queues analyzed threads for translation
 * - `publish`: per account, queues translated threads for publication
 *
 * Every service serializes its scans with a [`ScanGuard`]. A trigger that
 * arrives while a scan runs is not lost: it is recorded and the running
 * scan makes one more pass before releasing the guard.
 */

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::StageError;
use crate::status::{Status, is_valid_transition};
use crate::store::{PipelineStore, transition_thread};

pub mod analyze;
pub mod ingest;
pub mod publish;
pub mod translate;

pub use analyze::AnalyzeService;
pub use ingest::IngestService;
pub use publish::{PublishProcessor, PublishService};
pub use translate::{TranslateService, TranslationProcessor};

/// Pipeline phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Ingest,
    Analyze,
    Translate,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Ingest => "ingest",
            Stage::Analyze => "analyze",
            Stage::Translate => "translate",
            Stage::Publish => "publish",
        };
        write!(f, "{}", name)
    }
}

/// Payload of translate and publish tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadTask {
    pub thread_id: String,
}

impl ThreadTask {
    pub fn payload(thread_id: &str) -> serde_json::Value {
        serde_json::json!({ "thread_id": thread_id })
    }
}

#[derive(Debug, Default)]
struct GuardState {
    running: bool,
    rescan: bool,
}

/// Single-flight guard of a service's scans, coalescing concurrent triggers
#[derive(Debug)]
pub struct ScanGuard {
    name: String,
    state: Mutex<GuardState>,
}

impl ScanGuard {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(GuardState::default()),
        }
    }

    /// Enter the guard, or record a re-scan request if a scan already runs
    pub fn try_enter(&self) -> Option<ScanPermit<'_>> {
        let mut state = self.state.lock();
        if state.running {
            if !state.rescan {
                warn!(
                    "[{}] Scan already in progress; re-scan queued",
                    self.name
                );
            }
            state.rescan = true;
            return None;
        }
        state.running = true;
        Some(ScanPermit {
            guard: self,
            released: false,
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

/// Held while a scan runs
pub struct ScanPermit<'a> {
    guard: &'a ScanGuard,
    released: bool,
}

impl ScanPermit<'_> {
    /// Consume a pending re-scan request, or release the guard when there is none
    pub fn should_rescan(&mut self) -> bool {
        let mut state = self.guard.state.lock();
        if state.rescan {
            state.rescan = false;
            debug!("[{}] Running queued re-scan", self.guard.name);
            true
        } else {
            state.running = false;
            self.released = true;
            false
        }
    }
}

impl Drop for ScanPermit<'_> {
    fn drop(&mut self) {
        if !self.released {
            let mut state = self.guard.state.lock();
            state.running = false;
            state.rescan = false;
        }
    }
}

/// Give up on a thread after its last attempt failed.
///
/// Posts of the thread still in `stuck` move to `Failed`, then the thread
/// does. Posts that already advanced keep their status.
pub(crate) async fn fail_thread(
    store: &dyn PipelineStore,
    thread_id: &str,
    stuck: Status,
) -> Result<(), StageError> {
    let Some(thread) = store.get_thread(thread_id).await.map_err(StageError::Store)? else {
        return Ok(());
    };

    let posts = store
        .thread_posts(thread_id)
        .await
        .map_err(StageError::Store)?;
    for post in posts.iter().filter(|p| p.status == stuck) {
        store
            .update_post_status(&post.id, stuck, Status::Failed)
            .await
            .map_err(StageError::Store)?;
    }

    if is_valid_transition(thread.status, Status::Failed) {
        transition_thread(store, &thread, Status::Failed).await?;
        warn!("Thread {} marked as failed", thread_id);
    }
    Ok(())
}
