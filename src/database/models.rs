/*!
 * Row types of the SQLite tables.
 *
 * Timestamps and statuses are stored as text (RFC 3339 and lowercase
 * status names) and converted to the store's domain types on read.
 */

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Row;

use crate::status::Status;
use crate::store::{Post, Thread};

/// Columns selected for a post, in `PostRecord::from_row` order
pub const POST_COLUMNS: &str = "id, author_id, text, conversation_id, thread_id, is_root, status, \
     translated_text, published_id, created_at";

/// Columns selected for a thread, in `ThreadRecord::from_row` order
pub const THREAD_COLUMNS: &str = "id, author_id, status, created_at, updated_at";

/// Raw `posts` row
#[derive(Debug, Clone)]
pub struct PostRecord {
    pub id: String,
    pub author_id: String,
    pub text: String,
    pub conversation_id: Option<String>,
    pub thread_id: Option<String>,
    pub is_root: bool,
    pub status: String,
    pub translated_text: Option<String>,
    pub published_id: Option<String>,
    pub created_at: String,
}

impl PostRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            author_id: row.get(1)?,
            text: row.get(2)?,
            conversation_id: row.get(3)?,
            thread_id: row.get(4)?,
            is_root: row.get(5)?,
            status: row.get(6)?,
            translated_text: row.get(7)?,
            published_id: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

impl TryFrom<PostRecord> for Post {
    type Error = anyhow::Error;

    fn try_from(record: PostRecord) -> Result<Self> {
        Ok(Post {
            status: record
                .status
                .parse()
                .with_context(|| format!("post {}", record.id))?,
            created_at: parse_timestamp(&record.created_at)?,
            id: record.id,
            author_id: record.author_id,
            text: record.text,
            conversation_id: record.conversation_id,
            thread_id: record.thread_id,
            is_root: record.is_root,
            translated_text: record.translated_text,
            published_id: record.published_id,
        })
    }
}

/// Raw `threads` row
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub id: String,
    pub author_id: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl ThreadRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            author_id: row.get(1)?,
            status: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}

impl TryFrom<ThreadRecord> for Thread {
    type Error = anyhow::Error;

    fn try_from(record: ThreadRecord) -> Result<Self> {
        Ok(Thread {
            status: record
                .status
                .parse::<Status>()
                .with_context(|| format!("thread {}", record.id))?,
            created_at: parse_timestamp(&record.created_at)?,
            updated_at: parse_timestamp(&record.updated_at)?,
            id: record.id,
            author_id: record.author_id,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp: {}", value))?;
    Ok(parsed.with_timezone(&Utc))
}
