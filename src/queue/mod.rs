/*!
 * In-memory task queues used by the translate and publish stages.
 */

pub mod task;
pub mod task_queue;

pub use task::{Task, TaskId, TaskStatus};
pub use task_queue::{QueueConfig, QueueStats, TaskProcessor, TaskQueue, backoff_delay};
