/*!
 * SQLite persistence for posts, threads and ingest cursors.
 *
 * `Repository` implements [`crate::store::PipelineStore`].
 */

pub mod connection;
pub mod models;
pub mod repository;
pub mod schema;

pub use connection::DatabaseConnection;
pub use repository::Repository;
