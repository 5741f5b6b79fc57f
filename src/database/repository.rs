/*!
 * SQLite implementation of the pipeline store.
 *
 * All statements run on tokio's blocking pool through
 * `DatabaseConnection::execute_async`. Status changes are single-row
 * conditional updates, so a stage re-running on an entity that already
 * advanced changes nothing.
 */

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;

use super::connection::DatabaseConnection;
use super::models::{POST_COLUMNS, PostRecord, THREAD_COLUMNS, ThreadRecord};
use crate::status::Status;
use crate::store::{NewPost, PipelineStore, Post, StatusCounts, Thread};

/// Repository for database operations
#[derive(Clone)]
pub struct Repository {
    db: DatabaseConnection,
}

impl Repository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Create a repository with the default database location
    pub fn new_default() -> Result<Self> {
        let db = DatabaseConnection::new_default()?;
        Ok(Self::new(db))
    }

    /// Create a repository with an in-memory database (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let db = DatabaseConnection::new_in_memory()?;
        Ok(Self::new(db))
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    fn query_posts(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Post>> {
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map(args, PostRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records.into_iter().map(Post::try_from).collect()
    }

    fn query_threads(
        conn: &Connection,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Thread>> {
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map(args, ThreadRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records.into_iter().map(Thread::try_from).collect()
    }

    fn get_thread_sync(conn: &Connection, id: &str) -> Result<Option<Thread>> {
        let record = conn
            .query_row(
                &format!("SELECT {} FROM threads WHERE id = ?1", THREAD_COLUMNS),
                [id],
                ThreadRecord::from_row,
            )
            .optional()?;
        record.map(Thread::try_from).transpose()
    }

    fn count_by_status(conn: &Connection, table: &str) -> Result<HashMap<Status, u64>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status",
            table
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            counts.insert(status.parse::<Status>()?, count.max(0) as u64);
        }
        Ok(counts)
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering
fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now() -> String {
    timestamp(Utc::now())
}

#[async_trait]
impl PipelineStore for Repository {
    async fn insert_posts(&self, posts: Vec<NewPost>) -> Result<usize> {
        if posts.is_empty() {
            return Ok(0);
        }

        self.db
            .transaction_async(move |tx| {
                let now = now();
                let mut inserted = 0;
                for post in &posts {
                    inserted += tx.execute(
                        r#"
                        INSERT OR IGNORE INTO posts (
                            id, author_id, text, conversation_id, status, created_at, updated_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                        "#,
                        params![
                            post.id,
                            post.author_id,
                            post.text,
                            post.conversation_id,
                            Status::Pending.as_str(),
                            timestamp(post.created_at),
                            now,
                        ],
                    )?;
                }
                debug!("Inserted {} of {} posts", inserted, posts.len());
                Ok(inserted)
            })
            .await
    }

    async fn get_post(&self, id: &str) -> Result<Option<Post>> {
        let id = id.to_string();
        self.db
            .execute_async(move |conn| {
                let record = conn
                    .query_row(
                        &format!("SELECT {} FROM posts WHERE id = ?1", POST_COLUMNS),
                        [&id],
                        PostRecord::from_row,
                    )
                    .optional()?;
                record.map(Post::try_from).transpose()
            })
            .await
    }

    async fn posts_by_status(&self, status: Status) -> Result<Vec<Post>> {
        self.db
            .execute_async(move |conn| {
                Self::query_posts(
                    conn,
                    &format!(
                        "SELECT {} FROM posts WHERE status = ?1 ORDER BY created_at ASC, id ASC",
                        POST_COLUMNS
                    ),
                    &[&status.as_str()],
                )
            })
            .await
    }

    async fn thread_posts(&self, thread_id: &str) -> Result<Vec<Post>> {
        let thread_id = thread_id.to_string();
        self.db
            .execute_async(move |conn| {
                Self::query_posts(
                    conn,
                    &format!(
                        "SELECT {} FROM posts WHERE thread_id = ?1 \
                         ORDER BY is_root DESC, created_at ASC, id ASC",
                        POST_COLUMNS
                    ),
                    &[&thread_id],
                )
            })
            .await
    }

    async fn get_thread(&self, id: &str) -> Result<Option<Thread>> {
        let id = id.to_string();
        self.db
            .execute_async(move |conn| Self::get_thread_sync(conn, &id))
            .await
    }

    async fn threads_by_status(
        &self,
        status: Status,
        author_id: Option<&str>,
    ) -> Result<Vec<Thread>> {
        let author_id = author_id.map(str::to_string);
        self.db
            .execute_async(move |conn| match author_id {
                Some(author_id) => Self::query_threads(
                    conn,
                    &format!(
                        "SELECT {} FROM threads WHERE status = ?1 AND author_id = ?2 \
                         ORDER BY created_at ASC, id ASC",
                        THREAD_COLUMNS
                    ),
                    &[&status.as_str(), &author_id],
                ),
                None => Self::query_threads(
                    conn,
                    &format!(
                        "SELECT {} FROM threads WHERE status = ?1 ORDER BY created_at ASC, id ASC",
                        THREAD_COLUMNS
                    ),
                    &[&status.as_str()],
                ),
            })
            .await
    }

    async fn ensure_thread(&self, thread_id: &str, author_id: &str) -> Result<Thread> {
        let thread_id = thread_id.to_string();
        let author_id = author_id.to_string();
        self.db
            .transaction_async(move |tx| {
                let now = now();
                let created = tx.execute(
                    r#"
                    INSERT OR IGNORE INTO threads (id, author_id, status, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?4)
                    "#,
                    params![thread_id, author_id, Status::Pending.as_str(), now],
                )?;
                if created > 0 {
                    debug!("Created thread {}", thread_id);
                }
                Self::get_thread_sync(tx, &thread_id)?
                    .ok_or_else(|| anyhow::anyhow!("Thread {} vanished after insert", thread_id))
            })
            .await
    }

    async fn attach_post(&self, post_id: &str, thread_id: &str, is_root: bool) -> Result<()> {
        let post_id = post_id.to_string();
        let thread_id = thread_id.to_string();
        self.db
            .execute_async(move |conn| {
                let changed = conn.execute(
                    "UPDATE posts SET thread_id = ?2, is_root = ?3, updated_at = ?4 WHERE id = ?1",
                    params![post_id, thread_id, is_root, now()],
                )?;
                if changed == 0 {
                    return Err(anyhow::anyhow!("Post {} not found", post_id));
                }
                Ok(())
            })
            .await
    }

    async fn update_post_status(&self, id: &str, expected: Status, next: Status) -> Result<bool> {
        let id = id.to_string();
        self.db
            .execute_async(move |conn| {
                let changed = conn.execute(
                    "UPDATE posts SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
                    params![id, expected.as_str(), next.as_str(), now()],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    async fn update_thread_status(
        &self,
        id: &str,
        expected: Status,
        next: Status,
    ) -> Result<bool> {
        let id = id.to_string();
        self.db
            .execute_async(move |conn| {
                let changed = conn.execute(
                    "UPDATE threads SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
                    params![id, expected.as_str(), next.as_str(), now()],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    async fn save_translation(&self, post_id: &str, translated_text: &str) -> Result<bool> {
        let post_id = post_id.to_string();
        let translated_text = translated_text.to_string();
        self.db
            .execute_async(move |conn| {
                let changed = conn.execute(
                    r#"
                    UPDATE posts SET translated_text = ?2, status = ?3, updated_at = ?5
                    WHERE id = ?1 AND status = ?4
                    "#,
                    params![
                        post_id,
                        translated_text,
                        Status::Translated.as_str(),
                        Status::Analyzed.as_str(),
                        now()
                    ],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    async fn mark_published(&self, post_id: &str, published_id: &str) -> Result<bool> {
        let post_id = post_id.to_string();
        let published_id = published_id.to_string();
        self.db
            .execute_async(move |conn| {
                let changed = conn.execute(
                    r#"
                    UPDATE posts SET published_id = ?2, status = ?3, updated_at = ?5
                    WHERE id = ?1 AND status = ?4
                    "#,
                    params![
                        post_id,
                        published_id,
                        Status::Published.as_str(),
                        Status::Translated.as_str(),
                        now()
                    ],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    async fn ingest_cursor(&self, account: &str) -> Result<Option<String>> {
        let account = account.to_string();
        self.db
            .execute_async(move |conn| {
                let cursor = conn
                    .query_row(
                        "SELECT last_post_id FROM ingest_cursors WHERE account = ?1",
                        [&account],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(cursor)
            })
            .await
    }

    async fn set_ingest_cursor(&self, account: &str, post_id: &str) -> Result<()> {
        let account = account.to_string();
        let post_id = post_id.to_string();
        self.db
            .execute_async(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO ingest_cursors (account, last_post_id, updated_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(account) DO UPDATE SET
                        last_post_id = excluded.last_post_id,
                        updated_at = excluded.updated_at
                    "#,
                    params![account, post_id, now()],
                )?;
                Ok(())
            })
            .await
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        self.db
            .execute_async(|conn| {
                Ok(StatusCounts {
                    posts: Self::count_by_status(conn, "posts")?,
                    threads: Self::count_by_status(conn, "threads")?,
                })
            })
            .await
    }
}
