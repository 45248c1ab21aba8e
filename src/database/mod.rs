pub mod models;

#[cfg(test)]
mod tests;

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub use models::*;

const EPISODE_COLUMNS: &str = "id, source_id, guid, title, description, audio_url, link,
    published_date, added_date, transcript_text, transcript_origin,
    transcript_words_json IS NOT NULL, transcript_url, source_item_id, source_status,
    transcription_id, status_checked_at, exclusion_tag";

const MISSING_TRANSCRIPT: &str = "(transcript_text IS NULL OR TRIM(transcript_text) = '')";

/// Timestamps are stored as RFC 3339 UTC with second precision so that
/// lexical comparison in SQL matches chronological order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // WAL so readers are not blocked by the engine's status writes
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                guid TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                audio_url TEXT,
                link TEXT,
                published_date TEXT,
                added_date TEXT NOT NULL,
                transcript_text TEXT,
                transcript_origin TEXT,
                transcript_words_json TEXT,
                transcribed_date TEXT,
                transcript_url TEXT,
                source_item_id INTEGER,
                source_status TEXT,
                transcription_id TEXT,
                status_checked_at TEXT,
                exclusion_tag TEXT,
                UNIQUE(source_id, guid)
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_source_published
                ON episodes(source_id, published_date DESC);
            CREATE INDEX IF NOT EXISTS idx_episodes_status
                ON episodes(source_status, source_id);
            CREATE INDEX IF NOT EXISTS idx_episodes_item
                ON episodes(source_item_id);

            -- App settings (key-value store)
            CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY,
                value TEXT,
                updated_at TEXT DEFAULT (datetime('now'))
            );
        "#,
        )?;
        Ok(())
    }

    fn row_to_episode(row: &Row<'_>) -> rusqlite::Result<Episode> {
        Ok(Episode {
            id: row.get(0)?,
            source_id: row.get(1)?,
            guid: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            audio_url: row.get(5)?,
            link: row.get(6)?,
            published_date: row.get(7)?,
            added_date: row.get(8)?,
            transcript_text: row.get(9)?,
            transcript_origin: row.get(10)?,
            has_transcript_data: row.get::<_, i32>(11)? == 1,
            transcript_url: row.get(12)?,
            source_item_id: row.get(13)?,
            source_status: row.get::<_, Option<String>>(14)?.map(SourceStatus::from),
            transcription_id: row.get(15)?,
            status_checked_at: row.get(16)?,
            exclusion_tag: row.get(17)?,
        })
    }

    /// Run a filtered episode SELECT. `conditions` are ANDed; `source_ids`
    /// becomes an `IN (...)` clause when present.
    fn query_episodes(
        &self,
        conditions: &[&str],
        mut params: Vec<Box<dyn ToSql>>,
        source_ids: Option<&[String]>,
        limit: Option<i64>,
    ) -> Result<Vec<Episode>> {
        let mut clauses: Vec<String> = conditions.iter().map(|c| c.to_string()).collect();
        if let Some(ids) = source_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; ids.len()].join(", ");
            clauses.push(format!("source_id IN ({})", placeholders));
            for id in ids {
                params.push(Box::new(id.clone()));
            }
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        // SQLite treats a negative LIMIT as "no limit"
        params.push(Box::new(limit.unwrap_or(-1)));

        let sql = format!(
            "SELECT {} FROM episodes {} ORDER BY published_date DESC, id DESC LIMIT ?",
            EPISODE_COLUMNS, where_clause
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let episodes = stmt
            .query_map(param_refs.as_slice(), Self::row_to_episode)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(episodes)
    }

    // =========================================================================
    // Episode writes
    // =========================================================================

    /// Insert or update each episode by `(source_id, guid)`.
    ///
    /// Optional fields merge with `COALESCE` so a sparser re-upsert never
    /// erases data, and transcript columns are never touched here.
    /// Returns `(new_count, updated_count)`.
    pub fn upsert_episodes(&self, episodes: &[NewEpisode]) -> Result<(usize, usize)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = format_timestamp(Utc::now());
        let mut added = 0usize;
        let mut updated = 0usize;

        for ep in episodes {
            let existing_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM episodes WHERE source_id = ? AND guid = ?",
                    params![ep.source_id, ep.guid],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(id) = existing_id {
                tx.execute(
                    "UPDATE episodes SET
                        title = ?,
                        description = COALESCE(?, description),
                        audio_url = COALESCE(?, audio_url),
                        link = COALESCE(?, link),
                        published_date = COALESCE(?, published_date),
                        transcript_url = COALESCE(?, transcript_url),
                        source_item_id = COALESCE(?, source_item_id),
                        exclusion_tag = COALESCE(exclusion_tag, ?)
                     WHERE id = ?",
                    params![
                        ep.title,
                        ep.description,
                        ep.audio_url,
                        ep.link,
                        ep.published_date,
                        ep.transcript_url,
                        ep.source_item_id,
                        ep.exclusion_tag,
                        id
                    ],
                )?;
                updated += 1;
            } else {
                tx.execute(
                    "INSERT INTO episodes (source_id, guid, title, description, audio_url, link,
                        published_date, added_date, transcript_url, source_item_id, exclusion_tag)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        ep.source_id,
                        ep.guid,
                        ep.title,
                        ep.description,
                        ep.audio_url,
                        ep.link,
                        ep.published_date,
                        now,
                        ep.transcript_url,
                        ep.source_item_id,
                        ep.exclusion_tag
                    ],
                )?;
                added += 1;
            }
        }

        tx.commit()?;
        Ok((added, updated))
    }

    /// Attach external catalog ids. Entries are `(source_id, guid, item_id)`.
    pub fn set_source_item_ids(&self, ids: &[(String, String, i64)]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0usize;
        for (source_id, guid, item_id) in ids {
            changed += tx.execute(
                "UPDATE episodes SET source_item_id = ? WHERE source_id = ? AND guid = ?",
                params![item_id, source_id, guid],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    pub fn set_exclusion_tag(&self, source_id: &str, guid: &str, tag: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE episodes SET exclusion_tag = ? WHERE source_id = ? AND guid = ?",
            params![tag, source_id, guid],
        )?;
        Ok(())
    }

    /// Cache service statuses, stamping `status_checked_at` with now.
    pub fn set_statuses(&self, updates: &[StatusUpdate]) -> Result<usize> {
        self.set_statuses_at(updates, Utc::now())
    }

    pub fn set_statuses_at(&self, updates: &[StatusUpdate], checked_at: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let checked_at = format_timestamp(checked_at);
        let mut changed = 0usize;
        for u in updates {
            changed += tx.execute(
                "UPDATE episodes SET
                    source_status = ?,
                    transcription_id = COALESCE(?, transcription_id),
                    status_checked_at = ?
                 WHERE source_id = ? AND guid = ?",
                params![u.status.as_str(), u.transcription_id, checked_at, u.source_id, u.guid],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Store the flattened transcript text, and the word array when given,
    /// in one write. Returns false when the episode does not exist.
    pub fn set_transcript(
        &self,
        source_id: &str,
        guid: &str,
        text: &str,
        origin: TranscriptOrigin,
        words: Option<&[TranscriptWord]>,
    ) -> Result<bool> {
        let words_json = match words {
            Some(w) if !w.is_empty() => Some(serde_json::to_string(w)?),
            _ => None,
        };
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE episodes SET
                transcript_text = ?,
                transcript_origin = ?,
                transcript_words_json = COALESCE(?, transcript_words_json),
                transcribed_date = ?
             WHERE source_id = ? AND guid = ?",
            params![
                text,
                origin.as_str(),
                words_json,
                format_timestamp(Utc::now()),
                source_id,
                guid
            ],
        )?;
        Ok(changed > 0)
    }

    /// Attach word-level data to an episode that already has text.
    /// The plain text column is left untouched.
    pub fn set_transcript_data(&self, episode_id: i64, words: &[TranscriptWord]) -> Result<bool> {
        let words_json = serde_json::to_string(words)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE episodes SET transcript_words_json = ? WHERE id = ?",
            params![words_json, episode_id],
        )?;
        Ok(changed > 0)
    }

    // =========================================================================
    // Episode queries
    // =========================================================================

    pub fn get_episode(&self, source_id: &str, guid: &str) -> Result<Option<Episode>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM episodes WHERE source_id = ? AND guid = ?",
            EPISODE_COLUMNS
        );
        let episode = conn
            .query_row(&sql, params![source_id, guid], Self::row_to_episode)
            .optional()?;
        Ok(episode)
    }

    /// Every episode of a source, newest first.
    pub fn get_episodes_for_source(&self, source_id: &str) -> Result<Vec<Episode>> {
        self.query_episodes(
            &["source_id = ?"],
            vec![Box::new(source_id.to_string())],
            None,
            None,
        )
    }

    /// Untagged episodes without a transcript whose status was not checked
    /// within `cooldown`.
    pub fn get_episodes_missing_transcript(
        &self,
        source_id: &str,
        limit: Option<i64>,
        cooldown: Duration,
    ) -> Result<Vec<Episode>> {
        let cooldown = chrono::Duration::from_std(cooldown)
            .unwrap_or_else(|_| chrono::Duration::days(3650));
        let cutoff = format_timestamp(Utc::now() - cooldown);
        self.query_episodes(
            &[
                "source_id = ?",
                MISSING_TRANSCRIPT,
                "exclusion_tag IS NULL",
                "(status_checked_at IS NULL OR status_checked_at < ?)",
            ],
            vec![Box::new(source_id.to_string()), Box::new(cutoff)],
            None,
            limit,
        )
    }

    /// Episodes the service has never been asked to transcribe.
    pub fn get_episodes_needing_request(
        &self,
        source_ids: Option<&[String]>,
        limit: Option<i64>,
    ) -> Result<Vec<Episode>> {
        self.query_episodes(
            &[
                "(source_status IS NULL OR source_status = 'not_started')",
                "source_item_id IS NOT NULL",
                "exclusion_tag IS NULL",
                MISSING_TRANSCRIPT,
            ],
            Vec::new(),
            source_ids,
            limit,
        )
    }

    /// Episodes already triggered upstream, plus "done" rows that never
    /// produced text.
    pub fn get_episodes_in_processing(&self, source_ids: Option<&[String]>) -> Result<Vec<Episode>> {
        self.query_episodes(
            &[
                "source_status IN ('requested', 'running', 'processing', 'done')",
                "source_item_id IS NOT NULL",
                "exclusion_tag IS NULL",
                MISSING_TRANSCRIPT,
            ],
            Vec::new(),
            source_ids,
            None,
        )
    }

    /// Episodes with text but no word-level data.
    pub fn get_episodes_needing_enrichment(
        &self,
        source_ids: Option<&[String]>,
        limit: Option<i64>,
    ) -> Result<Vec<Episode>> {
        self.query_episodes(
            &[
                "transcript_text IS NOT NULL",
                "TRIM(transcript_text) != ''",
                "transcript_words_json IS NULL",
                "source_item_id IS NOT NULL",
                "exclusion_tag IS NULL",
            ],
            Vec::new(),
            source_ids,
            limit,
        )
    }

    pub fn get_transcript(&self, episode_id: i64) -> Result<Option<TranscriptData>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, transcript_text, transcript_origin, transcript_words_json, transcribed_date
                 FROM episodes WHERE id = ? AND transcript_text IS NOT NULL",
                params![episode_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((episode_id, full_text, origin, words_json, transcribed_date)) = row else {
            return Ok(None);
        };
        let words = match words_json {
            Some(json) => Some(serde_json::from_str::<Vec<TranscriptWord>>(&json)?),
            None => None,
        };
        Ok(Some(TranscriptData {
            episode_id,
            full_text,
            origin,
            words,
            transcribed_date,
        }))
    }

    pub fn get_source_summary(&self, source_id: &str) -> Result<SourceSummary> {
        let conn = self.conn()?;
        let summary = conn.query_row(
            &format!(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN NOT {missing} THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN exclusion_tag IS NOT NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN source_item_id IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN {missing} AND exclusion_tag IS NULL AND source_item_id IS NOT NULL
                        AND source_status IN ('requested', 'running', 'processing', 'done') THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN {missing} AND exclusion_tag IS NULL AND source_item_id IS NOT NULL
                        AND (source_status IS NULL OR source_status = 'not_started') THEN 1 ELSE 0 END), 0)
                 FROM episodes WHERE source_id = ?",
                missing = MISSING_TRANSCRIPT
            ),
            params![source_id],
            |row| {
                Ok(SourceSummary {
                    source_id: source_id.to_string(),
                    total: row.get(0)?,
                    with_transcript: row.get(1)?,
                    excluded: row.get(2)?,
                    without_item_id: row.get(3)?,
                    in_processing: row.get(4)?,
                    needing_request: row.get(5)?,
                })
            },
        )?;
        Ok(summary)
    }

    /// Episode counts per cached service status. Episodes never checked are
    /// reported under "unchecked".
    pub fn count_by_status(&self, source_id: &str) -> Result<Vec<(String, i64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT COALESCE(source_status, 'unchecked') AS status, COUNT(*)
             FROM episodes WHERE source_id = ?
             GROUP BY status ORDER BY status",
        )?;
        let rows = stmt
            .query_map(params![source_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM app_settings WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO app_settings (key, value, updated_at) VALUES (?, ?, datetime('now'))",
            params![key, value],
        )?;
        Ok(())
    }
}
