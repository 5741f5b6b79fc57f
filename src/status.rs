/*!
 * Lifecycle status of posts and threads.
 *
 * Every persisted entity moves along a fixed directed graph:
 *
 * ```text
 * Pending -> Analyzed -> Translated -> Published
 *    \          \            \             \
 *     +----------+------------+-------------+--> Failed
 * ```
 *
 * `Failed` is terminal. Callers check a transition with
 * [`is_valid_transition`] or [`ensure_transition`] before persisting it.
 */

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::StatusTransitionError;

/// Lifecycle status of a post or a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Analyzed,
    Translated,
    Published,
    Failed,
}

impl Status {
    /// Every status, in lifecycle order
    pub const ALL: [Status; 5] = [
        Status::Pending,
        Status::Analyzed,
        Status::Translated,
        Status::Published,
        Status::Failed,
    ];

    /// Statuses reachable from this one in a single step
    pub fn allowed_transitions(self) -> &'static [Status] {
        match self {
            Status::Pending => &[Status::Analyzed, Status::Failed],
            Status::Analyzed => &[Status::Translated, Status::Failed],
            Status::Translated => &[Status::Published, Status::Failed],
            Status::Published => &[Status::Failed],
            Status::Failed => &[],
        }
    }

    /// A terminal status has no outgoing transition
    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Analyzed => "analyzed",
            Status::Translated => "translated",
            Status::Published => "published",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Status::Pending),
            "analyzed" => Ok(Status::Analyzed),
            "translated" => Ok(Status::Translated),
            "published" => Ok(Status::Published),
            "failed" => Ok(Status::Failed),
            _ => Err(anyhow!("Invalid status: {}", s)),
        }
    }
}

/// Whether `next` is a legal successor of `current`
pub fn is_valid_transition(current: Status, next: Status) -> bool {
    current.allowed_transitions().contains(&next)
}

/// Same lookup as [`is_valid_transition`], reported as an error carrying both states
pub fn ensure_transition(current: Status, next: Status) -> Result<(), StatusTransitionError> {
    if is_valid_transition(current, next) {
        Ok(())
    } else {
        Err(StatusTransitionError::InvalidTransition {
            from: current,
            to: next,
        })
    }
}
