/*!
 * Persistence contract of the pipeline.
 *
 * Stage services only talk to storage through [`PipelineStore`]. Status
 * updates are conditional (`UPDATE ... WHERE status = expected`) so re-running
 * a stage on an entity that already moved on is a no-op. The
 * [`transition_post`] and [`transition_thread`] helpers check the lifecycle
 * table before touching the store.
 */

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::StageError;
use crate::status::{Status, ensure_transition};

/// A post as stored by the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Platform id of the source post
    pub id: String,
    pub author_id: String,
    pub text: String,
    /// Platform conversation the post belongs to, if any
    pub conversation_id: Option<String>,
    /// Thread assigned by the analyzer
    pub thread_id: Option<String>,
    pub is_root: bool,
    pub status: Status,
    pub translated_text: Option<String>,
    /// Platform id of the published translation
    pub published_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Post {
    /// Thread key: the conversation id, or the post's own id when standalone
    pub fn thread_key(&self) -> &str {
        self.conversation_id.as_deref().unwrap_or(&self.id)
    }
}

/// A post to insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPost {
    pub id: String,
    pub author_id: String,
    pub text: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A thread of posts translated and published together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub author_id: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Number of posts and threads per status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusCounts {
    pub posts: HashMap<Status, u64>,
    pub threads: HashMap<Status, u64>,
}

impl StatusCounts {
    pub fn posts_in(&self, status: Status) -> u64 {
        self.posts.get(&status).copied().unwrap_or(0)
    }

    pub fn threads_in(&self, status: Status) -> u64 {
        self.threads.get(&status).copied().unwrap_or(0)
    }
}

/// Storage operations needed by the stage services
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Insert new posts as `Pending`; ids already known are ignored.
    /// Returns the number of rows actually inserted.
    async fn insert_posts(&self, posts: Vec<NewPost>) -> Result<usize>;

    async fn get_post(&self, id: &str) -> Result<Option<Post>>;

    /// Posts in `status`, oldest first
    async fn posts_by_status(&self, status: Status) -> Result<Vec<Post>>;

    /// Posts of a thread in publication order: root first, then by creation time
    async fn thread_posts(&self, thread_id: &str) -> Result<Vec<Post>>;

    async fn get_thread(&self, id: &str) -> Result<Option<Thread>>;

    /// Threads in `status`, oldest first, optionally restricted to one author
    async fn threads_by_status(&self, status: Status, author_id: Option<&str>)
    -> Result<Vec<Thread>>;

    /// Return the thread, creating it as `Pending` when missing
    async fn ensure_thread(&self, thread_id: &str, author_id: &str) -> Result<Thread>;

    async fn attach_post(&self, post_id: &str, thread_id: &str, is_root: bool) -> Result<()>;

    /// Set `next` if the post is still in `expected`; returns whether it changed
    async fn update_post_status(&self, id: &str, expected: Status, next: Status) -> Result<bool>;

    /// Set `next` if the thread is still in `expected`; returns whether it changed
    async fn update_thread_status(&self, id: &str, expected: Status, next: Status)
    -> Result<bool>;

    /// Store the translated text and move the post `Analyzed -> Translated`
    async fn save_translation(&self, post_id: &str, translated_text: &str) -> Result<bool>;

    /// Store the platform id and move the post `Translated -> Published`
    async fn mark_published(&self, post_id: &str, published_id: &str) -> Result<bool>;

    /// Id of the newest post ingested for an account
    async fn ingest_cursor(&self, account: &str) -> Result<Option<String>>;

    async fn set_ingest_cursor(&self, account: &str, post_id: &str) -> Result<()>;

    async fn status_counts(&self) -> Result<StatusCounts>;
}

/// Move a post to `next` after checking the lifecycle table.
///
/// Returns `Ok(false)` when the stored status no longer matches `post.status`.
pub async fn transition_post(
    store: &dyn PipelineStore,
    post: &Post,
    next: Status,
) -> Result<bool, StageError> {
    ensure_transition(post.status, next)?;
    store
        .update_post_status(&post.id, post.status, next)
        .await
        .map_err(StageError::Store)
}

/// Move a thread to `next` after checking the lifecycle table.
pub async fn transition_thread(
    store: &dyn PipelineStore,
    thread: &Thread,
    next: Status,
) -> Result<bool, StageError> {
    ensure_transition(thread.status, next)?;
    store
        .update_thread_status(&thread.id, thread.status, next)
        .await
        .map_err(StageError::Store)
}
