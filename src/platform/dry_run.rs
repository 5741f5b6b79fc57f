/*!
 * Publisher for local runs: logs each post instead of sending it and hands
 * back a synthetic platform id.
 */

use async_trait::async_trait;
use log::info;
use uuid::Uuid;

use super::PublishTarget;
use crate::app_config::AccountConfig;
use crate::errors::ProviderError;

/// Publisher that only logs what it would post
#[derive(Debug, Clone, Default)]
pub struct DryRunPublisher;

impl DryRunPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PublishTarget for DryRunPublisher {
    async fn publish(
        &self,
        account: &AccountConfig,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String, ProviderError> {
        let id = format!("dry-run-{}", Uuid::new_v4());
        match reply_to {
            Some(parent) => info!("[dry run] {} replies to {}: {}", account.name, parent, text),
            None => info!("[dry run] {} posts: {}", account.name, text),
        }
        Ok(id)
    }
}
