//! Durable transcript storage.
//!
//! Every transcript lives in a single `transcripts` row keyed by video id.
//! Each operation that mutates a row is one SQL statement (`UPDATE … RETURNING`,
//! `INSERT … ON CONFLICT … RETURNING`, `DELETE … RETURNING`) so concurrent
//! requests for the same video can never lose a counter increment or observe a
//! half-written record.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLUMNS: &str = "video_id, captions, language, title, author, thumbnail_url, \
                       source_url, timestamps, fetch_count, created_at, last_accessed";

/// One caption cue with its offset and length in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampEntry {
    pub text: String,
    pub start: f64,
    pub duration: f64,
}

/// A persisted transcript row.
///
/// `created_at` and `last_accessed` are RFC 3339 UTC strings with fixed
/// millisecond precision, which keeps SQL ordering on the raw text
/// chronological.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub video_id: String,
    pub captions: String,
    pub language: String,
    pub title: String,
    pub author: String,
    pub thumbnail_url: Option<String>,
    pub source_url: String,
    pub timestamps: Option<Vec<TimestampEntry>>,
    pub fetch_count: i64,
    pub created_at: String,
    pub last_accessed: String,
}

/// Current time in the format stored in `created_at` / `last_accessed`.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Handle to the transcript database.
///
/// Cheap to clone; each call opens its own connection so blocking tasks never
/// share a `rusqlite::Connection`.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    db_path: PathBuf,
}

impl TranscriptStore {
    /// Opens (and if necessary creates) the database and its schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating transcript directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("opening transcript DB {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode for transcript DB")?;

        let tx = conn.transaction()?;
        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS transcripts (
                video_id TEXT PRIMARY KEY,
                captions TEXT NOT NULL,
                language TEXT NOT NULL,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                thumbnail_url TEXT,
                source_url TEXT NOT NULL,
                timestamps TEXT,
                fetch_count INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_accessed TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transcripts_last_accessed
                ON transcripts(last_accessed);
            "#,
        )
        .context("creating transcript schema")?;
        tx.commit()?;

        Ok(Self {
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("opening transcript DB {}", self.db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        f(&conn)
    }

    pub fn find_by_video_id(&self, video_id: &str) -> Result<Option<Transcript>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM transcripts WHERE video_id = ?1"
            ))?;
            let mut rows = stmt.query([video_id])?;
            let transcript = rows.next()?.map(row_to_transcript).transpose()?;
            Ok(transcript)
        })
    }

    /// Bumps `fetch_count` and `last_accessed` and returns the updated row.
    /// A missing video leaves the table untouched and yields `None`.
    pub fn get_and_touch(&self, video_id: &str) -> Result<Option<Transcript>> {
        let now = timestamp_now();
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                UPDATE transcripts
                SET fetch_count = fetch_count + 1,
                    last_accessed = MAX(last_accessed, ?2)
                WHERE video_id = ?1
                RETURNING {COLUMNS}
                "#
            ))?;
            let mut rows = stmt.query(params![video_id, now])?;
            let transcript = rows.next()?.map(row_to_transcript).transpose()?;
            Ok(transcript)
        })
    }

    /// Most recently accessed first, plus the unfiltered row count. Read-only.
    pub fn list(&self, limit: u32, offset: u32) -> Result<(Vec<Transcript>, u64)> {
        self.with_connection(|conn| {
            // Both reads see the same snapshot.
            let tx = conn.unchecked_transaction()?;
            let total: i64 = tx.query_row("SELECT COUNT(*) FROM transcripts", [], |row| {
                row.get(0)
            })?;

            let mut transcripts = Vec::new();
            {
                let mut stmt = tx.prepare(&format!(
                    r#"
                    SELECT {COLUMNS}
                    FROM transcripts
                    ORDER BY last_accessed DESC, video_id ASC
                    LIMIT ?1 OFFSET ?2
                    "#
                ))?;
                let mut rows = stmt.query(params![limit, offset])?;
                while let Some(row) = rows.next()? {
                    transcripts.push(row_to_transcript(row)?);
                }
            }
            tx.commit()?;

            Ok((transcripts, total.max(0) as u64))
        })
    }

    /// Inserts the transcript with `fetch_count = 1`, or refreshes the content
    /// of an existing row and increments its counter. `created_at` and
    /// `source_url` of an existing row are kept. Returns the stored row.
    pub fn upsert(&self, transcript: &Transcript) -> Result<Transcript> {
        let timestamps_json = transcript
            .timestamps
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serializing timestamps")?;

        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                INSERT INTO transcripts (
                    video_id, captions, language, title, author, thumbnail_url,
                    source_url, timestamps, fetch_count, created_at, last_accessed
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10)
                ON CONFLICT(video_id) DO UPDATE SET
                    captions = excluded.captions,
                    language = excluded.language,
                    title = excluded.title,
                    author = excluded.author,
                    thumbnail_url = excluded.thumbnail_url,
                    timestamps = excluded.timestamps,
                    fetch_count = transcripts.fetch_count + 1,
                    last_accessed = MAX(transcripts.last_accessed, excluded.last_accessed)
                RETURNING {COLUMNS}
                "#
            ))?;
            let mut rows = stmt.query(params![
                transcript.video_id,
                transcript.captions,
                transcript.language,
                transcript.title,
                transcript.author,
                transcript.thumbnail_url,
                transcript.source_url,
                timestamps_json,
                transcript.created_at,
                transcript.last_accessed,
            ])?;
            let row = rows
                .next()?
                .context("upsert did not return the stored transcript")?;
            let stored = row_to_transcript(row)?;
            Ok(stored)
        })
    }

    /// Removes the row and hands back what was stored.
    pub fn delete(&self, video_id: &str) -> Result<Option<Transcript>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "DELETE FROM transcripts WHERE video_id = ?1 RETURNING {COLUMNS}"
            ))?;
            let mut rows = stmt.query([video_id])?;
            let transcript = rows.next()?.map(row_to_transcript).transpose()?;
            Ok(transcript)
        })
    }
}

/// Converts a SQL row into a `Transcript`, decoding the timestamps blob.
fn row_to_transcript(row: &Row<'_>) -> Result<Transcript> {
    let timestamps_json: Option<String> = row.get("timestamps")?;
    let timestamps = timestamps_json
        .as_deref()
        .map(serde_json::from_str::<Vec<TimestampEntry>>)
        .transpose()
        .context("parsing stored timestamps JSON")?;

    Ok(Transcript {
        video_id: row.get("video_id")?,
        captions: row.get("captions")?,
        language: row.get("language")?,
        title: row.get("title")?,
        author: row.get("author")?,
        thumbnail_url: row.get("thumbnail_url")?,
        source_url: row.get("source_url")?,
        timestamps,
        fetch_count: row.get("fetch_count")?,
        created_at: row.get("created_at")?,
        last_accessed: row.get("last_accessed")?,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn sample_transcript(video_id: &str) -> Transcript {
        let now = timestamp_now();
        Transcript {
            video_id: video_id.into(),
            captions: "Test captions content for testing purposes".into(),
            language: "en".into(),
            title: "Test Video Title".into(),
            author: "Test Author".into(),
            thumbnail_url: Some(format!("https://i.ytimg.com/vi/{video_id}/hqdefault.jpg")),
            source_url: format!("https://www.youtube.com/watch?v={video_id}"),
            timestamps: None,
            fetch_count: 1,
            created_at: now.clone(),
            last_accessed: now,
        }
    }

    /// Inserts a row verbatim, bypassing the counter logic of `upsert`.
    pub fn seed(store: &TranscriptStore, video_id: &str, fetch_count: i64, last_accessed: &str) {
        let conn = Connection::open(store.path()).unwrap();
        conn.execute(
            r#"
            INSERT INTO transcripts (
                video_id, captions, language, title, author, thumbnail_url,
                source_url, timestamps, fetch_count, created_at, last_accessed
            ) VALUES (?1, 'seeded captions', 'en', 'Seeded', 'Seeder', NULL, ?1, NULL, ?2, ?3, ?3)
            "#,
            params![video_id, fetch_count, last_accessed],
        )
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{sample_transcript, seed};
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn open_store() -> (TempDir, TranscriptStore) {
        let dir = tempdir().unwrap();
        let store = TranscriptStore::open(dir.path().join("nested/transcripts.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn find_is_side_effect_free() {
        let (_dir, store) = open_store();
        seed(&store, "dQw4w9WgXcQ", 3, "2024-01-01T00:00:00.000Z");

        let first = store.find_by_video_id("dQw4w9WgXcQ").unwrap().unwrap();
        let second = store.find_by_video_id("dQw4w9WgXcQ").unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.fetch_count, 3);
        assert!(store.find_by_video_id("missing0000").unwrap().is_none());
    }

    #[test]
    fn timestamps_round_trip_in_order() {
        let (_dir, store) = open_store();
        let mut transcript = sample_transcript("dQw4w9WgXcQ");
        let cues = vec![
            TimestampEntry {
                text: "first".into(),
                start: 0.0,
                duration: 1.25,
            },
            TimestampEntry {
                text: "second".into(),
                start: 1.25,
                duration: 0.5,
            },
            TimestampEntry {
                text: "third".into(),
                start: 1.75,
                duration: 3.0,
            },
        ];
        transcript.timestamps = Some(cues.clone());
        store.upsert(&transcript).unwrap();

        let stored = store.find_by_video_id("dQw4w9WgXcQ").unwrap().unwrap();
        assert_eq!(stored.timestamps, Some(cues));
    }

    #[test]
    fn absent_timestamps_stay_absent() {
        let (_dir, store) = open_store();
        store.upsert(&sample_transcript("dQw4w9WgXcQ")).unwrap();
        let stored = store.find_by_video_id("dQw4w9WgXcQ").unwrap().unwrap();
        assert!(stored.timestamps.is_none());
    }

    #[test]
    fn get_and_touch_increments_by_one_each_call() {
        let (_dir, store) = open_store();
        seed(&store, "dQw4w9WgXcQ", 5, "2024-01-01T00:00:00.000Z");

        let mut previous = store.find_by_video_id("dQw4w9WgXcQ").unwrap().unwrap();
        for expected in 6..=8 {
            let touched = store.get_and_touch("dQw4w9WgXcQ").unwrap().unwrap();
            assert_eq!(touched.fetch_count, expected);
            assert!(touched.last_accessed >= previous.last_accessed);
            assert!(touched.last_accessed >= touched.created_at);
            previous = touched;
        }
    }

    #[test]
    fn get_and_touch_never_moves_last_accessed_backwards() {
        let (_dir, store) = open_store();
        seed(&store, "dQw4w9WgXcQ", 1, "2999-01-01T00:00:00.000Z");
        let touched = store.get_and_touch("dQw4w9WgXcQ").unwrap().unwrap();
        assert_eq!(touched.last_accessed, "2999-01-01T00:00:00.000Z");
    }

    #[test]
    fn get_and_touch_on_missing_row_creates_nothing() {
        let (_dir, store) = open_store();
        assert!(store.get_and_touch("dQw4w9WgXcQ").unwrap().is_none());
        let (rows, total) = store.list(10, 0).unwrap();
        assert!(rows.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn upsert_twice_keeps_one_row_and_counts_both_writes() {
        let (_dir, store) = open_store();
        let first = store.upsert(&sample_transcript("dQw4w9WgXcQ")).unwrap();
        assert_eq!(first.fetch_count, 1);

        let mut refreshed = sample_transcript("dQw4w9WgXcQ");
        refreshed.captions = "updated captions".into();
        refreshed.source_url = "https://youtu.be/dQw4w9WgXcQ".into();
        refreshed.created_at = "2999-01-01T00:00:00.000Z".into();
        let second = store.upsert(&refreshed).unwrap();

        assert_eq!(second.fetch_count, 2);
        assert_eq!(second.captions, "updated captions");
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.source_url, first.source_url);

        let (rows, total) = store.list(10, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(total, 1);
    }

    #[test]
    fn concurrent_upserts_do_not_lose_increments() {
        let (_dir, store) = open_store();
        let writers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.upsert(&sample_transcript("dQw4w9WgXcQ")).unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let stored = store.find_by_video_id("dQw4w9WgXcQ").unwrap().unwrap();
        assert_eq!(stored.fetch_count, 8);
    }

    #[test]
    fn list_paginates_by_last_accessed_desc() {
        let (_dir, store) = open_store();
        seed(&store, "video111111", 1, "2024-01-01T00:00:00.000Z");
        seed(&store, "video222222", 1, "2024-01-03T00:00:00.000Z");
        seed(&store, "video333333", 1, "2024-01-02T00:00:00.000Z");

        let (page, total) = store.list(2, 0).unwrap();
        assert_eq!(total, 3);
        let ids: Vec<_> = page.iter().map(|t| t.video_id.as_str()).collect();
        assert_eq!(ids, ["video222222", "video333333"]);

        let (tail, total) = store.list(10, 2).unwrap();
        assert_eq!(total, 3);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].video_id, "video111111");
    }

    #[test]
    fn list_is_idempotent_and_does_not_touch_counters() {
        let (_dir, store) = open_store();
        seed(&store, "video111111", 4, "2024-01-01T00:00:00.000Z");
        seed(&store, "video222222", 9, "2024-01-02T00:00:00.000Z");

        let first = store.list(50, 0).unwrap();
        let second = store.list(50, 0).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            store.find_by_video_id("video111111").unwrap().unwrap().fetch_count,
            4
        );
    }

    #[test]
    fn delete_returns_previous_record() {
        let (_dir, store) = open_store();
        seed(&store, "dQw4w9WgXcQ", 2, "2024-01-01T00:00:00.000Z");

        let deleted = store.delete("dQw4w9WgXcQ").unwrap().unwrap();
        assert_eq!(deleted.video_id, "dQw4w9WgXcQ");
        assert_eq!(deleted.fetch_count, 2);
        assert!(store.find_by_video_id("dQw4w9WgXcQ").unwrap().is_none());
        assert!(store.delete("dQw4w9WgXcQ").unwrap().is_none());
    }
}
