/*!
 * Social platform contracts.
 *
 * The pipeline reads posts through a [`FeedSource`] and writes translated
 * posts through a [`PublishTarget`]. Both report failures as
 * [`ProviderError`]; a rate limit is `ProviderError::RateLimitExceeded`.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::app_config::AccountConfig;
use crate::errors::ProviderError;
use crate::store::NewPost;

pub mod dry_run;
pub mod spool;

pub use dry_run::DryRunPublisher;
pub use spool::SpoolFeed;

/// A post as delivered by a feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedPost {
    pub id: String,
    pub author_id: String,
    pub text: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<FetchedPost> for NewPost {
    fn from(post: FetchedPost) -> Self {
        NewPost {
            id: post.id,
            author_id: post.author_id,
            text: post.text,
            conversation_id: post.conversation_id,
            created_at: post.created_at,
        }
    }
}

/// Source of new posts for an account
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Posts newer than `since_id`, oldest first, at most `max_results`
    async fn fetch_posts(
        &self,
        account: &AccountConfig,
        since_id: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<FetchedPost>, ProviderError>;
}

/// Destination of translated posts
#[async_trait]
pub trait PublishTarget: Send + Sync {
    /// Publish `text` for `account`, as a reply to `reply_to` when given.
    /// Returns the platform id of the new post.
    async fn publish(
        &self,
        account: &AccountConfig,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String, ProviderError>;
}

/// Order post ids numerically when both are numbers, textually otherwise
pub fn compare_post_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    }
}
