#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use shutterrank_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, replay_snapshot, MatchEvent, MatchEventInput,
    Photo, PhotoId, RankedPhoto, RatingConfig,
};
use ulid::Ulid;

const RANK_MIGRATION_VERSION: i64 = 1;

const SCHEMA_RANK_V1: &str = r"
CREATE TABLE IF NOT EXISTS rating_configs (
  config_version INTEGER PRIMARY KEY,
  config_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS photos (
  photo_id TEXT PRIMARY KEY,
  display_url TEXT NOT NULL,
  title TEXT NOT NULL,
  width INTEGER CHECK (width >= 1 OR width IS NULL),
  height INTEGER CHECK (height >= 1 OR height IS NULL),
  loaded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS match_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  winner_id TEXT NOT NULL,
  loser_id TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  CHECK (winner_id <> loser_id)
);

CREATE TRIGGER IF NOT EXISTS trg_match_events_no_update
BEFORE UPDATE ON match_events
BEGIN
  SELECT RAISE(FAIL, 'match_events rows are immutable');
END;

CREATE INDEX IF NOT EXISTS idx_match_events_occurred
  ON match_events(occurred_at, event_seq);

CREATE TABLE IF NOT EXISTS presented_pairs (
  slot INTEGER PRIMARY KEY CHECK (slot = 1),
  left_id TEXT NOT NULL,
  right_id TEXT NOT NULL,
  presented_at TEXT NOT NULL
);
";

// Deliberately no foreign key from match_events to photos: an imported log
// may reference photos that vanished from the catalog, and replay tolerates
// those by skipping.

pub struct SqliteRankStore {
    conn: Connection,
}

/// Result of a full-log snapshot rebuild. Ranked entries are derived state
/// and never written back to the database.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct SnapshotReport {
    pub entries: Vec<RankedPhoto>,
    pub photo_count: usize,
    pub processed_events: usize,
    pub skipped_events: usize,
    pub last_event_seq: i64,
}

impl SqliteRankStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_RANK_V1)
            .context("failed to apply rank schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RANK_MIGRATION_VERSION, now],
            )
            .context("failed to register rank schema migration")?;

        self.upsert_config(&RatingConfig::v1())?;

        Ok(())
    }

    pub fn upsert_config(&self, config: &RatingConfig) -> Result<()> {
        config
            .validate()
            .map_err(|err| anyhow!("invalid rating configuration: {err}"))?;

        let payload = serde_json::to_string(config).context("failed to serialize config")?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO rating_configs(config_version, config_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(config_version) DO UPDATE SET
                   config_json = excluded.config_json,
                   created_at = excluded.created_at",
                params![i64::from(config.config_version), payload, now],
            )
            .context("failed to upsert rating config")?;

        Ok(())
    }

    /// The highest stored config version is the active one.
    pub fn active_config(&self) -> Result<RatingConfig> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT config_json FROM rating_configs
                 ORDER BY config_version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read active rating config")?;

        let json = json.ok_or_else(|| anyhow!("no rating config stored; run migrate first"))?;
        let value: Value = serde_json::from_str(&json).context("invalid stored config JSON")?;
        RatingConfig::from_json(&value).map_err(|err| anyhow!("failed to parse config: {err}"))
    }

    /// Replaces the photo catalog wholesale. The recent-pair memory is
    /// cleared because its ids may no longer exist.
    pub fn import_catalog(&mut self, photos: &[Photo]) -> Result<usize> {
        for photo in photos {
            photo
                .validate()
                .map_err(|err| anyhow!("catalog validation failed: {err}"))?;
        }

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start catalog transaction")?;

        tx.execute("DELETE FROM photos", [])
            .context("failed to clear photo catalog")?;
        tx.execute("DELETE FROM presented_pairs", [])
            .context("failed to clear presented pair")?;

        for photo in photos {
            tx.execute(
                "INSERT INTO photos(photo_id, display_url, title, width, height, loaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    photo.id.as_str(),
                    photo.display_url,
                    photo.title,
                    photo.width,
                    photo.height,
                    now,
                ],
            )
            .with_context(|| format!("failed to insert photo {}", photo.id))?;
        }

        tx.commit().context("failed to commit catalog transaction")?;
        Ok(photos.len())
    }

    pub fn list_photos(&self) -> Result<Vec<Photo>> {
        let mut stmt = self.conn.prepare(
            "SELECT photo_id, display_url, title, width, height
             FROM photos
             ORDER BY rowid ASC",
        )?;

        let rows = stmt.query_map([], parse_photo_row)?;
        collect_rows(rows)
    }

    fn photo_exists(&self, id: &PhotoId) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM photos WHERE photo_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to check photo existence")?;
        Ok(found.is_some())
    }

    /// Appends one vote. Unlike imported history, a live vote must name
    /// photos present in the catalog.
    pub fn append_event(&mut self, input: &MatchEventInput) -> Result<MatchEvent> {
        input
            .validate()
            .map_err(|err| anyhow!("event validation failed: {err}"))?;

        for id in [&input.winner_id, &input.loser_id] {
            if !self.photo_exists(id)? {
                return Err(anyhow!("photo {id} is not in the catalog"));
            }
        }

        let event_id = match input.event_id {
            Some(value) => value,
            None => Ulid::new(),
        };
        let recorded_at = now_utc();

        let tx = self
            .conn
            .transaction()
            .context("failed to start event transaction")?;

        tx.execute(
            "INSERT INTO match_events(event_id, winner_id, loser_id, occurred_at, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event_id.to_string(),
                input.winner_id.as_str(),
                input.loser_id.as_str(),
                format_rfc3339(input.occurred_at).map_err(|err| anyhow!(err.to_string()))?,
                format_rfc3339(recorded_at).map_err(|err| anyhow!(err.to_string()))?,
            ],
        )
        .context("failed to append match event")?;

        let event_seq = tx.last_insert_rowid();
        tx.commit().context("failed to commit event transaction")?;

        Ok(MatchEvent {
            event_seq,
            event_id,
            winner_id: input.winner_id.clone(),
            loser_id: input.loser_id.clone(),
            occurred_at: input.occurred_at,
            recorded_at,
        })
    }

    /// Drops the newest event (undo). Returns the dropped event, or `None`
    /// for an empty log.
    pub fn undo_last(&mut self) -> Result<Option<MatchEvent>> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start undo transaction")?;

        let last = {
            let mut stmt = tx.prepare(
                "SELECT event_seq, event_id, winner_id, loser_id, occurred_at, recorded_at
                 FROM match_events
                 ORDER BY event_seq DESC LIMIT 1",
            )?;
            stmt.query_row([], parse_event_row).optional()?
        };

        let Some(event) = last else {
            return Ok(None);
        };

        tx.execute(
            "DELETE FROM match_events WHERE event_seq = ?1",
            params![event.event_seq],
        )
        .context("failed to drop last match event")?;
        tx.commit().context("failed to commit undo transaction")?;

        Ok(Some(event))
    }

    /// Events in append order. Replay re-sorts by `(occurred_at, event_seq)`
    /// itself, so no timestamp ordering is promised here.
    pub fn list_events(&self) -> Result<Vec<MatchEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_seq, event_id, winner_id, loser_id, occurred_at, recorded_at
             FROM match_events
             ORDER BY event_seq ASC",
        )?;

        let rows = stmt.query_map([], parse_event_row)?;
        collect_rows(rows)
    }

    /// Replaces the event log wholesale (backup import). Every incoming
    /// event is validated first; original timestamps are preserved so the
    /// imported log replays to the same snapshot it was exported from.
    pub fn replace_log(&mut self, inputs: &[MatchEventInput]) -> Result<usize> {
        for input in inputs {
            input
                .validate()
                .map_err(|err| anyhow!("import validation failed: {err}"))?;
        }

        let recorded_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start import transaction")?;

        tx.execute("DELETE FROM match_events", [])
            .context("failed to clear match log")?;
        tx.execute("DELETE FROM presented_pairs", [])
            .context("failed to clear presented pair")?;

        for input in inputs {
            let event_id = match input.event_id {
                Some(value) => value,
                None => Ulid::new(),
            };
            tx.execute(
                "INSERT INTO match_events(event_id, winner_id, loser_id, occurred_at, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event_id.to_string(),
                    input.winner_id.as_str(),
                    input.loser_id.as_str(),
                    format_rfc3339(input.occurred_at).map_err(|err| anyhow!(err.to_string()))?,
                    recorded_at,
                ],
            )
            .context("failed to insert imported match event")?;
        }

        tx.commit().context("failed to commit import transaction")?;
        Ok(inputs.len())
    }

    /// Rebuilds the ranked snapshot from the full event log. Always a full
    /// recompute; nothing incremental is trusted across invocations.
    pub fn rebuild_snapshot(&self) -> Result<SnapshotReport> {
        let photos = self.list_photos()?;
        let events = self.list_events()?;
        let config = self.active_config()?;

        let summary = replay_snapshot(&photos, &events, &config)
            .map_err(|err| anyhow!("snapshot rebuild failed: {err}"))?;

        let last_event_seq: Option<i64> = self
            .conn
            .query_row("SELECT MAX(event_seq) FROM match_events", [], |row| {
                row.get(0)
            })
            .context("failed to read last event seq")?;

        Ok(SnapshotReport {
            photo_count: photos.len(),
            entries: summary.entries,
            processed_events: summary.processed_events,
            skipped_events: summary.skipped_events,
            last_event_seq: last_event_seq.unwrap_or(0),
        })
    }

    /// The immediately preceding presented pair, for repeat avoidance.
    pub fn last_presented(&self) -> Result<Option<(PhotoId, PhotoId)>> {
        let pair: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT left_id, right_id FROM presented_pairs WHERE slot = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to read presented pair")?;

        Ok(pair.map(|(left, right)| (PhotoId::new(left), PhotoId::new(right))))
    }

    pub fn record_presented(&self, left: &PhotoId, right: &PhotoId) -> Result<()> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO presented_pairs(slot, left_id, right_id, presented_at)
                 VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(slot) DO UPDATE SET
                   left_id = excluded.left_id,
                   right_id = excluded.right_id,
                   presented_at = excluded.presented_at",
                params![left.as_str(), right.as_str(), now],
            )
            .context("failed to record presented pair")?;
        Ok(())
    }
}

fn parse_photo_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Photo> {
    Ok(Photo {
        id: PhotoId::new(row.get::<_, String>(0)?),
        display_url: row.get(1)?,
        title: row.get(2)?,
        width: row.get(3)?,
        height: row.get(4)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MatchEvent> {
    let event_seq: i64 = row.get(0)?;
    let event_id_raw: String = row.get(1)?;
    let winner_id: String = row.get(2)?;
    let loser_id: String = row.get(3)?;
    let occurred_raw: String = row.get(4)?;
    let recorded_raw: String = row.get(5)?;

    let event_id = Ulid::from_string(&event_id_raw)
        .map_err(|err| conversion_failure(1, Box::new(err)))?;
    let occurred_at =
        parse_rfc3339_utc(&occurred_raw).map_err(|err| conversion_failure(4, Box::new(err)))?;
    let recorded_at =
        parse_rfc3339_utc(&recorded_raw).map_err(|err| conversion_failure(5, Box::new(err)))?;

    Ok(MatchEvent {
        event_seq,
        event_id,
        winner_id: PhotoId::new(winner_id),
        loser_id: PhotoId::new(loser_id),
        occurred_at,
        recorded_at,
    })
}

fn conversion_failure(
    column: usize,
    err: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, err)
}

fn collect_rows<T, F>(rows: rusqlite::MappedRows<'_, F>) -> Result<Vec<T>>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut items = Vec::new();
    for row in rows {
        items.push(row.context("failed to read row")?);
    }
    Ok(items)
}
