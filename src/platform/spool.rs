/*!
 * File-backed feed.
 *
 * Each account reads `<spool_dir>/<account name>.json`, a JSON array of
 * [`FetchedPost`]. A missing file means no new posts.
 */

use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};

use super::{FeedSource, FetchedPost, compare_post_ids};
use crate::app_config::AccountConfig;
use crate::errors::ProviderError;

/// Feed reading posts from JSON files in a directory
#[derive(Debug, Clone)]
pub struct SpoolFeed {
    dir: PathBuf,
}

impl SpoolFeed {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn account_file(&self, account: &AccountConfig) -> PathBuf {
        self.dir.join(format!("{}.json", account.name))
    }
}

#[async_trait]
impl FeedSource for SpoolFeed {
    async fn fetch_posts(
        &self,
        account: &AccountConfig,
        since_id: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<FetchedPost>, ProviderError> {
        let path = self.account_file(account);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No spool file for {} at {:?}", account.name, path);
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(ProviderError::RequestFailed(format!(
                    "Failed to read {:?}: {}",
                    path, e
                )));
            }
        };

        let mut posts: Vec<FetchedPost> = serde_json::from_str(&content)
            .map_err(|e| ProviderError::ParseError(format!("{:?}: {}", path, e)))?;

        if let Some(since) = since_id {
            posts.retain(|p| compare_post_ids(&p.id, since).is_gt());
        }
        posts.sort_by(|a, b| compare_post_ids(&a.id, &b.id));
        posts.truncate(max_results);

        debug!(
            "Spool feed returned {} post(s) for {}",
            posts.len(),
            account.name
        );
        Ok(posts)
    }
}
