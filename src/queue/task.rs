/*!
 * Queued unit of work.
 */

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::QueueError;

/// Task identifier
pub type TaskId = Uuid;

/// Execution status of a task inside its queue. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// A unit of work owned by exactly one queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Free-form type tag, e.g. "translate"
    pub task_type: String,

    /// Opaque payload; must identify the target entity
    pub payload: serde_json::Value,

    /// Higher dequeues first
    pub priority: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: TaskStatus,

    /// Failed attempts so far
    pub retries: u32,

    /// Re-attempts allowed after the first attempt
    pub max_retries: u32,

    /// Message of the last failed attempt
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        task_type: impl Into<String>,
        payload: serde_json::Value,
        priority: i32,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            payload,
            priority,
            created_at: now,
            updated_at: now,
            status: TaskStatus::Pending,
            retries: 0,
            max_retries,
            error: None,
        }
    }

    /// Whether a failure of the current attempt exhausts the retry budget
    pub fn is_final_attempt(&self) -> bool {
        self.retries >= self.max_retries
    }

    /// Decode the payload into a typed structure
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| QueueError::InvalidPayload {
            task_id: self.id.to_string(),
            reason: e.to_string(),
        })
    }

    pub(crate) fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
