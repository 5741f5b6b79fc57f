/*!
 * # threadrelay
 *
 * An event-driven pipeline that ingests social posts, groups them into
 * threads, translates them and republishes them.
 *
 * ## Architecture
 *
 * The library is organized in these main modules:
 * - `status`: lifecycle state machine of posts and threads
 * - `events`: in-process publish/subscribe bus between stages
 * - `queue`: priority task queue with bounded concurrency and backoff retry
 * - `stages`: the ingest, analyze, translate and publish services
 * - `pipeline`: keyed service registry, timers and shutdown
 * - `store`: persistence contract, implemented by `database` over SQLite
 * - `providers`: translation providers (HTTP endpoint, mock)
 * - `platform`: feed and publish contracts (spool files, dry run)
 * - `app_config`: configuration management
 * - `errors`: custom error types for the application
 *
 * ## License
 *
 * This project is licensed under the MIT License
 */

// Global lints configuration
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::collapsible_if)]

pub mod app_config;
pub mod database;
pub mod errors;
pub mod events;
pub mod pipeline;
pub mod platform;
pub mod providers;
pub mod queue;
pub mod stages;
pub mod status;
pub mod store;

// Re-export main types for easier usage
pub use app_config::Config;
pub use errors::{AppError, ProviderError, QueueError, StageError, StatusTransitionError};
pub use events::{EventBus, EventKind, PipelineEvent};
pub use pipeline::{Collaborators, Pipeline, ServiceRegistry};
pub use queue::{QueueConfig, QueueStats, Task, TaskProcessor, TaskQueue, TaskStatus};
pub use stages::Stage;
pub use status::{Status, ensure_transition, is_valid_transition};
