/*
    swapify-sync | Background reconciliation engine for Swapify shared playlists.
    Copyright (C) 2025  Israel Alberto Roldan Vega

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! SQLite persistence for the local model.
//!
//! Timestamps are stored as Unix milliseconds. Every write touches a single
//! row and is either an insert-or-ignore, an upsert, or an update guarded by
//! the row's current state, so replaying a partially applied cycle is safe.

use crate::models::{
    ArchiveThreshold, ListenRecord, PlaybackCursor, Reaction, ReactionKind, RemovalDelay,
    RemovalPolicy, SharedPlaylist, SharedTrack, TrackStatus, TrackedSnapshot, User,
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        access_token TEXT,
        token_valid INTEGER NOT NULL DEFAULT 1,
        auto_negative_reactions INTEGER NOT NULL DEFAULT 0,
        last_poll_cursor INTEGER,
        last_playback_json TEXT,
        playback_version INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS playlists (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        owner_id TEXT NOT NULL REFERENCES users(id),
        spotify_playlist_id TEXT NOT NULL,
        archive_spotify_playlist_id TEXT,
        max_tracks_per_user INTEGER,
        max_track_age_days INTEGER NOT NULL DEFAULT 0,
        removal_delay TEXT NOT NULL DEFAULT 'immediate',
        archive_threshold TEXT NOT NULL DEFAULT 'none'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS playlist_members (
        playlist_id TEXT NOT NULL REFERENCES playlists(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id),
        joined_at INTEGER NOT NULL,
        PRIMARY KEY (playlist_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS shared_tracks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        playlist_id TEXT NOT NULL REFERENCES playlists(id) ON DELETE CASCADE,
        track_id TEXT NOT NULL,
        track_uri TEXT NOT NULL,
        added_by TEXT NOT NULL,
        added_at INTEGER NOT NULL,
        completed_at INTEGER,
        status TEXT NOT NULL DEFAULT 'active',
        status_at INTEGER,
        remote_pending INTEGER NOT NULL DEFAULT 0,
        needs_evaluation INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS shared_tracks_one_live_per_uri
        ON shared_tracks (playlist_id, track_uri)
        WHERE status IN ('active', 'pending_removal')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS listens (
        playlist_id TEXT NOT NULL REFERENCES playlists(id) ON DELETE CASCADE,
        shared_track_id INTEGER NOT NULL REFERENCES shared_tracks(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL,
        listened_at INTEGER NOT NULL,
        listen_duration_ms INTEGER NOT NULL,
        was_skipped INTEGER NOT NULL,
        UNIQUE (playlist_id, shared_track_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reactions (
        playlist_id TEXT NOT NULL REFERENCES playlists(id) ON DELETE CASCADE,
        shared_track_id INTEGER NOT NULL REFERENCES shared_tracks(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL,
        reaction TEXT NOT NULL,
        is_auto INTEGER NOT NULL DEFAULT 0,
        reacted_at INTEGER NOT NULL,
        UNIQUE (playlist_id, shared_track_id, user_id)
    )
    "#,
];

const TRACK_COLUMNS: &str = "id, playlist_id, track_id, track_uri, added_by, added_at, \
                             completed_at, status, status_at, remote_pending";

const PLAYLIST_COLUMNS: &str = "id, name, owner_id, spotify_playlist_id, archive_spotify_playlist_id, \
                                max_tracks_per_user, max_track_age_days, removal_delay, archive_threshold";

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) the database at `url` and applies the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Opened store at {}", url);
        Ok(store)
    }

    /// A private in-memory database. One connection, since every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        // Databases created before tracks could be flagged for evaluation.
        let has_marker: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pragma_table_info('shared_tracks') WHERE name = 'needs_evaluation')",
        )
        .fetch_one(&self.pool)
        .await?;
        if !has_marker {
            sqlx::query("ALTER TABLE shared_tracks ADD COLUMN needs_evaluation INTEGER NOT NULL DEFAULT 0")
                .execute(&self.pool)
                .await?;
            info!("Added needs_evaluation to shared_tracks");
        }
        debug!("Schema up to date");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Users
    // ---------------------------------------------------------------------

    /// Account link / relink. Keeps the poll cursor of an existing user.
    pub async fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, display_name, access_token, token_valid, auto_negative_reactions)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                access_token = excluded.access_token,
                token_valid = excluded.token_valid,
                auto_negative_reactions = excluded.auto_negative_reactions
            "#,
        )
        .bind(&user.id)
        .bind(&user.display_name)
        .bind(&user.access_token)
        .bind(user.token_valid)
        .bind(user.auto_negative_reactions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, display_name, access_token, token_valid, auto_negative_reactions \
             FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| user_from_row(&row)).transpose()
    }

    /// Users with a usable token and at least one playlist membership.
    pub async fn eligible_users(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, display_name, access_token, token_valid, auto_negative_reactions
            FROM users u
            WHERE u.token_valid = 1
              AND u.access_token IS NOT NULL
              AND EXISTS (SELECT 1 FROM playlist_members m WHERE m.user_id = u.id)
            ORDER BY u.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(user_from_row).collect()
    }

    pub async fn mark_token_invalid(&self, user_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET token_valid = 0 WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The only reader of a user's poll state.
    pub async fn load_cursor(&self, user_id: &str) -> Result<PlaybackCursor, StoreError> {
        let row = sqlx::query(
            "SELECT last_poll_cursor, last_playback_json, playback_version FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(PlaybackCursor::default());
        };

        let json: Option<String> = row.try_get("last_playback_json")?;
        let tracked = match json {
            Some(json) => match serde_json::from_str::<TrackedSnapshot>(&json) {
                Ok(tracked) => Some(tracked),
                Err(e) => {
                    warn!("Discarding unreadable playback snapshot for {}: {}", user_id, e);
                    None
                }
            },
            None => None,
        };
        let poll_cursor: Option<i64> = row.try_get("last_poll_cursor")?;

        Ok(PlaybackCursor {
            tracked,
            poll_cursor: poll_cursor.map(from_millis),
            version: row.try_get("playback_version")?,
        })
    }

    /// The only writer of a user's poll state. Returns `false` (and writes
    /// nothing) when someone else saved since `cursor` was loaded.
    pub async fn save_cursor(&self, user_id: &str, cursor: &PlaybackCursor) -> Result<bool, StoreError> {
        let json = cursor
            .tracked
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Encode {
                what: "playback snapshot",
                reason: e.to_string(),
            })?;

        let result = sqlx::query(
            r#"
            UPDATE users
            SET last_playback_json = ?, last_poll_cursor = ?, playback_version = playback_version + 1
            WHERE id = ? AND playback_version = ?
            "#,
        )
        .bind(json)
        .bind(cursor.poll_cursor.map(to_millis))
        .bind(user_id)
        .bind(cursor.version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ---------------------------------------------------------------------
    // Playlists and membership
    // ---------------------------------------------------------------------

    pub async fn upsert_playlist(&self, playlist: &SharedPlaylist) -> Result<(), StoreError> {
        let policy = &playlist.policy;
        sqlx::query(
            r#"
            INSERT INTO playlists (
                id, name, owner_id, spotify_playlist_id, archive_spotify_playlist_id,
                max_tracks_per_user, max_track_age_days, removal_delay, archive_threshold
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                owner_id = excluded.owner_id,
                spotify_playlist_id = excluded.spotify_playlist_id,
                archive_spotify_playlist_id = COALESCE(excluded.archive_spotify_playlist_id, playlists.archive_spotify_playlist_id),
                max_tracks_per_user = excluded.max_tracks_per_user,
                max_track_age_days = excluded.max_track_age_days,
                removal_delay = excluded.removal_delay,
                archive_threshold = excluded.archive_threshold
            "#,
        )
        .bind(&playlist.id)
        .bind(&playlist.name)
        .bind(&playlist.owner_id)
        .bind(&playlist.spotify_playlist_id)
        .bind(&playlist.archive_spotify_playlist_id)
        .bind(policy.max_tracks_per_user.map(i64::from))
        .bind(i64::from(policy.max_track_age_days))
        .bind(policy.removal_delay.as_str())
        .bind(policy.archive_threshold.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_playlist(&self, playlist_id: &str) -> Result<Option<SharedPlaylist>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM playlists WHERE id = ?", PLAYLIST_COLUMNS))
            .bind(playlist_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| playlist_from_row(&row)).transpose()
    }

    pub async fn playlists(&self) -> Result<Vec<SharedPlaylist>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {} FROM playlists ORDER BY id", PLAYLIST_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(playlist_from_row).collect()
    }

    /// Records the lazily created archive playlist. First writer wins.
    pub async fn set_archive_playlist(&self, playlist_id: &str, spotify_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE playlists SET archive_spotify_playlist_id = ? \
             WHERE id = ? AND archive_spotify_playlist_id IS NULL",
        )
        .bind(spotify_id)
        .bind(playlist_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn add_member(&self, playlist_id: &str, user_id: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO playlist_members (playlist_id, user_id, joined_at) VALUES (?, ?, ?)")
            .bind(playlist_id)
            .bind(user_id)
            .bind(to_millis(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn members(&self, playlist_id: &str) -> Result<Vec<String>, StoreError> {
        let members = sqlx::query_scalar(
            "SELECT user_id FROM playlist_members WHERE playlist_id = ? ORDER BY user_id",
        )
        .bind(playlist_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    pub async fn is_member(&self, playlist_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM playlist_members WHERE playlist_id = ? AND user_id = ?)",
        )
        .bind(playlist_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    // ---------------------------------------------------------------------
    // Shared tracks
    // ---------------------------------------------------------------------

    /// Inserts a live row. `None` when a live row for the URI already exists.
    pub async fn insert_track(
        &self,
        playlist_id: &str,
        track_id: &str,
        track_uri: &str,
        added_by: &str,
        added_at: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO shared_tracks (playlist_id, track_id, track_uri, added_by, added_at, status)
            VALUES (?, ?, ?, ?, ?, 'active')
            "#,
        )
        .bind(playlist_id)
        .bind(track_id)
        .bind(track_uri)
        .bind(added_by)
        .bind(to_millis(added_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Live row for {} already in {}", track_uri, playlist_id);
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    pub async fn get_track(&self, track_id: i64) -> Result<Option<SharedTrack>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM shared_tracks WHERE id = ?", TRACK_COLUMNS))
            .bind(track_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| track_from_row(&row)).transpose()
    }

    /// Active and pending-removal rows of one playlist, oldest first.
    pub async fn live_tracks(&self, playlist_id: &str) -> Result<Vec<SharedTrack>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM shared_tracks \
             WHERE playlist_id = ? AND status IN ('active', 'pending_removal') \
             ORDER BY added_at, id",
            TRACK_COLUMNS
        ))
        .bind(playlist_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(track_from_row).collect()
    }

    /// Live rows for `track_uri` in every playlist `user_id` belongs to.
    pub async fn live_tracks_for_member(
        &self,
        user_id: &str,
        track_uri: &str,
    ) -> Result<Vec<SharedTrack>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM shared_tracks \
             WHERE track_uri = ? AND status IN ('active', 'pending_removal') \
               AND playlist_id IN (SELECT playlist_id FROM playlist_members WHERE user_id = ?) \
             ORDER BY id",
            TRACK_COLUMNS
        ))
        .bind(track_uri)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(track_from_row).collect()
    }

    pub async fn count_live_tracks_by(&self, playlist_id: &str, user_id: &str) -> Result<u32, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM shared_tracks \
             WHERE playlist_id = ? AND added_by = ? AND status IN ('active', 'pending_removal')",
        )
        .bind(playlist_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    /// Ids of live rows whose scheduled removal or hard expiry has passed, or
    /// that were flagged with [`Store::request_evaluation`].
    pub async fn due_track_ids(&self, now: DateTime<Utc>) -> Result<Vec<i64>, StoreError> {
        let now = to_millis(now);
        let ids = sqlx::query_scalar(
            r#"
            SELECT t.id FROM shared_tracks t
            WHERE t.status = 'pending_removal' AND t.status_at <= ?
            UNION
            SELECT t.id FROM shared_tracks t
            WHERE t.needs_evaluation = 1 AND t.status IN ('active', 'pending_removal')
            UNION
            SELECT t.id FROM shared_tracks t
            JOIN playlists p ON p.id = t.playlist_id
            WHERE t.status IN ('active', 'pending_removal')
              AND p.max_track_age_days > 0
              AND t.added_at + p.max_track_age_days * 86400000 < ?
            ORDER BY 1
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Makes a live row due on the next cycle regardless of its deadlines.
    pub async fn request_evaluation(&self, track_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE shared_tracks SET needs_evaluation = 1 \
             WHERE id = ? AND status IN ('active', 'pending_removal')",
        )
        .bind(track_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_evaluation(&self, track_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE shared_tracks SET needs_evaluation = 0 WHERE id = ?")
            .bind(track_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Active → PendingRemoval. `false` if the row was no longer active.
    pub async fn schedule_removal(
        &self,
        track_id: i64,
        completed_at: DateTime<Utc>,
        remove_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE shared_tracks
            SET status = 'pending_removal', status_at = ?, completed_at = COALESCE(completed_at, ?)
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(to_millis(remove_at))
        .bind(to_millis(completed_at))
        .bind(track_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Live → Removed. Exactly one caller gets `true` for a given row.
    pub async fn claim_removal(
        &self,
        track_id: i64,
        at: DateTime<Utc>,
        completed: bool,
        remote_pending: bool,
    ) -> Result<bool, StoreError> {
        let at_ms = to_millis(at);
        let result = sqlx::query(
            r#"
            UPDATE shared_tracks
            SET status = 'removed', status_at = ?, remote_pending = ?,
                completed_at = CASE WHEN ? THEN COALESCE(completed_at, ?) ELSE completed_at END
            WHERE id = ? AND status IN ('active', 'pending_removal')
            "#,
        )
        .bind(at_ms)
        .bind(remote_pending)
        .bind(completed)
        .bind(at_ms)
        .bind(track_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Removed → Archived once the archive copy exists.
    pub async fn mark_archived(&self, track_id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE shared_tracks SET status = 'archived', status_at = ? WHERE id = ? AND status = 'removed'",
        )
        .bind(to_millis(at))
        .bind(track_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_remote_pending(&self, track_id: i64, pending: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE shared_tracks SET remote_pending = ? WHERE id = ?")
            .bind(pending)
            .bind(track_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removed rows whose removal has not been confirmed on Spotify yet.
    pub async fn remote_pending_tracks(&self, playlist_id: &str) -> Result<Vec<SharedTrack>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM shared_tracks \
             WHERE playlist_id = ? AND remote_pending = 1 AND status IN ('removed', 'archived') \
             ORDER BY id",
            TRACK_COLUMNS
        ))
        .bind(playlist_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(track_from_row).collect()
    }

    // ---------------------------------------------------------------------
    // Listens and reactions
    // ---------------------------------------------------------------------

    /// Insert-or-ignore. `true` only when this call created the record.
    pub async fn record_listen(&self, listen: &ListenRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO listens
                (playlist_id, shared_track_id, user_id, listened_at, listen_duration_ms, was_skipped)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&listen.playlist_id)
        .bind(listen.shared_track_id)
        .bind(&listen.user_id)
        .bind(to_millis(listen.listened_at))
        .bind(listen.listen_duration_ms as i64)
        .bind(listen.was_skipped)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn listens(&self, shared_track_id: i64) -> Result<Vec<ListenRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT playlist_id, shared_track_id, user_id, listened_at, listen_duration_ms, was_skipped \
             FROM listens WHERE shared_track_id = ? ORDER BY user_id",
        )
        .bind(shared_track_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ListenRecord {
                    playlist_id: row.try_get("playlist_id")?,
                    shared_track_id: row.try_get("shared_track_id")?,
                    user_id: row.try_get("user_id")?,
                    listened_at: from_millis(row.try_get("listened_at")?),
                    listen_duration_ms: row.try_get::<i64, _>("listen_duration_ms")?.max(0) as u64,
                    was_skipped: row.try_get("was_skipped")?,
                })
            })
            .collect()
    }

    /// Last write wins, except that an automatic reaction never replaces an
    /// explicit one. Returns whether the stored reaction changed.
    pub async fn upsert_reaction(&self, reaction: &Reaction, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let sql = if reaction.is_auto {
            r#"
            INSERT INTO reactions (playlist_id, shared_track_id, user_id, reaction, is_auto, reacted_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(playlist_id, shared_track_id, user_id) DO UPDATE SET
                reaction = excluded.reaction,
                is_auto = excluded.is_auto,
                reacted_at = excluded.reacted_at
            WHERE reactions.is_auto = 1 AND reactions.reaction <> excluded.reaction
            "#
        } else {
            r#"
            INSERT INTO reactions (playlist_id, shared_track_id, user_id, reaction, is_auto, reacted_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(playlist_id, shared_track_id, user_id) DO UPDATE SET
                reaction = excluded.reaction,
                is_auto = excluded.is_auto,
                reacted_at = excluded.reacted_at
            "#
        };

        let result = sqlx::query(sql)
            .bind(&reaction.playlist_id)
            .bind(reaction.shared_track_id)
            .bind(&reaction.user_id)
            .bind(reaction.kind.as_str())
            .bind(reaction.is_auto)
            .bind(to_millis(at))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn reactions(&self, shared_track_id: i64) -> Result<Vec<Reaction>, StoreError> {
        let rows = sqlx::query(
            "SELECT playlist_id, shared_track_id, user_id, reaction, is_auto \
             FROM reactions WHERE shared_track_id = ? ORDER BY user_id",
        )
        .bind(shared_track_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("reaction")?;
                Ok(Reaction {
                    playlist_id: row.try_get("playlist_id")?,
                    shared_track_id: row.try_get("shared_track_id")?,
                    user_id: row.try_get("user_id")?,
                    kind: ReactionKind::parse(&kind),
                    is_auto: row.try_get("is_auto")?,
                })
            })
            .collect()
    }

    /// Users who listened to or reacted to the track.
    pub async fn engaged_users(&self, shared_track_id: i64) -> Result<Vec<String>, StoreError> {
        let users = sqlx::query_scalar(
            r#"
            SELECT user_id FROM listens WHERE shared_track_id = ?
            UNION
            SELECT user_id FROM reactions WHERE shared_track_id = ?
            "#,
        )
        .bind(shared_track_id)
        .bind(shared_track_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        access_token: row.try_get("access_token")?,
        token_valid: row.try_get("token_valid")?,
        auto_negative_reactions: row.try_get("auto_negative_reactions")?,
    })
}

fn playlist_from_row(row: &SqliteRow) -> Result<SharedPlaylist, StoreError> {
    let max_tracks: Option<i64> = row.try_get("max_tracks_per_user")?;
    let max_age: i64 = row.try_get("max_track_age_days")?;
    let delay: String = row.try_get("removal_delay")?;
    let threshold: String = row.try_get("archive_threshold")?;

    Ok(SharedPlaylist {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        owner_id: row.try_get("owner_id")?,
        spotify_playlist_id: row.try_get("spotify_playlist_id")?,
        archive_spotify_playlist_id: row.try_get("archive_spotify_playlist_id")?,
        policy: RemovalPolicy {
            max_tracks_per_user: max_tracks.map(|n| n.clamp(0, i64::from(u32::MAX)) as u32),
            max_track_age_days: max_age.clamp(0, i64::from(u32::MAX)) as u32,
            removal_delay: RemovalDelay::parse_or_default(&delay),
            archive_threshold: ArchiveThreshold::parse_or_default(&threshold),
        },
    })
}

fn track_from_row(row: &SqliteRow) -> Result<SharedTrack, StoreError> {
    let status: String = row.try_get("status")?;
    let status_at: Option<i64> = row.try_get("status_at")?;
    let at = from_millis(status_at.unwrap_or_default());
    let status = match status.as_str() {
        "pending_removal" => TrackStatus::PendingRemoval(at),
        "removed" => TrackStatus::Removed(at),
        "archived" => TrackStatus::Archived(at),
        _ => TrackStatus::Active,
    };
    let completed_at: Option<i64> = row.try_get("completed_at")?;

    Ok(SharedTrack {
        id: row.try_get("id")?,
        playlist_id: row.try_get("playlist_id")?,
        track_id: row.try_get("track_id")?,
        track_uri: row.try_get("track_uri")?,
        added_by: row.try_get("added_by")?,
        added_at: from_millis(row.try_get("added_at")?),
        completed_at: completed_at.map(from_millis),
        status,
        remote_pending: row.try_get("remote_pending")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrackedSnapshot;
    use crate::testing::{seed_playlist, snapshot, uri};
    use chrono::Duration;

    async fn setup() -> Store {
        let store = Store::in_memory().await.unwrap();
        seed_playlist(&store, "owner", &["owner", "ana", "ben"], RemovalPolicy::default()).await;
        store
    }

    #[tokio::test]
    async fn test_one_live_row_per_uri() {
        let store = setup().await;
        let now = Utc::now();

        let first = store.insert_track("pl", "a", &uri("a"), "ana", now).await.unwrap();
        assert!(first.is_some());
        let dup = store.insert_track("pl", "a", &uri("a"), "ben", now).await.unwrap();
        assert_eq!(dup, None);

        // Re-adding after removal creates a fresh live row.
        assert!(store.claim_removal(first.unwrap(), now, false, false).await.unwrap());
        let again = store.insert_track("pl", "a", &uri("a"), "ben", now).await.unwrap();
        assert!(again.is_some());
        assert_ne!(again, first);
        assert_eq!(store.live_tracks("pl").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_removal_is_won_once() {
        let store = setup().await;
        let now = Utc::now();
        let id = store.insert_track("pl", "a", &uri("a"), "ana", now).await.unwrap().unwrap();

        assert!(store.claim_removal(id, now, true, true).await.unwrap());
        assert!(!store.claim_removal(id, now, true, true).await.unwrap());

        let track = store.get_track(id).await.unwrap().unwrap();
        assert_eq!(track.status, TrackStatus::Removed(from_millis(to_millis(now))));
        assert!(track.remote_pending);
        assert!(track.completed_at.is_some());
        assert_eq!(store.remote_pending_tracks("pl").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_listen_insert_is_idempotent() {
        let store = setup().await;
        let now = Utc::now();
        let id = store.insert_track("pl", "a", &uri("a"), "ana", now).await.unwrap().unwrap();
        let listen = ListenRecord {
            playlist_id: "pl".to_string(),
            shared_track_id: id,
            user_id: "ben".to_string(),
            listened_at: now,
            listen_duration_ms: 180_000,
            was_skipped: false,
        };

        assert!(store.record_listen(&listen).await.unwrap());
        let skipped = ListenRecord {
            was_skipped: true,
            ..listen.clone()
        };
        assert!(!store.record_listen(&skipped).await.unwrap());

        let stored = store.listens(id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].was_skipped);
    }

    #[tokio::test]
    async fn test_auto_reaction_never_overrides_explicit() {
        let store = setup().await;
        let now = Utc::now();
        let id = store.insert_track("pl", "a", &uri("a"), "ana", now).await.unwrap().unwrap();
        let explicit = Reaction {
            playlist_id: "pl".to_string(),
            shared_track_id: id,
            user_id: "ben".to_string(),
            kind: ReactionKind::ThumbsUp,
            is_auto: false,
        };
        let auto = Reaction {
            kind: ReactionKind::ThumbsDown,
            is_auto: true,
            ..explicit.clone()
        };

        assert!(store.upsert_reaction(&explicit, now).await.unwrap());
        assert!(!store.upsert_reaction(&auto, now).await.unwrap());
        assert_eq!(store.reactions(id).await.unwrap()[0].kind, ReactionKind::ThumbsUp);

        // Explicit reactions always overwrite.
        let changed = Reaction {
            kind: ReactionKind::Emoji("🔥".to_string()),
            ..explicit
        };
        assert!(store.upsert_reaction(&changed, now).await.unwrap());
        let stored = store.reactions(id).await.unwrap();
        assert_eq!(stored[0].kind, ReactionKind::Emoji("🔥".to_string()));
        assert_eq!(store.engaged_users(id).await.unwrap(), vec!["ben".to_string()]);
    }

    #[tokio::test]
    async fn test_cursor_save_rejects_stale_version() {
        let store = setup().await;

        let mut cursor = store.load_cursor("ben").await.unwrap();
        assert_eq!(cursor, PlaybackCursor::default());

        let stale = cursor.clone();
        cursor.tracked = Some(TrackedSnapshot::start(snapshot("a", 1_000, 200_000)));
        cursor.poll_cursor = Some(Utc::now());
        assert!(store.save_cursor("ben", &cursor).await.unwrap());
        assert!(!store.save_cursor("ben", &stale).await.unwrap());

        let loaded = store.load_cursor("ben").await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.tracked.unwrap().snapshot.track_uri, uri("a"));
    }

    #[tokio::test]
    async fn test_due_tracks_cover_schedule_and_expiry() {
        let store = Store::in_memory().await.unwrap();
        let policy = RemovalPolicy {
            max_track_age_days: 1,
            ..RemovalPolicy::default()
        };
        seed_playlist(&store, "owner", &["owner", "ana"], policy).await;
        let now = Utc::now();

        let old = store
            .insert_track("pl", "old", &uri("old"), "ana", now - Duration::days(2))
            .await
            .unwrap()
            .unwrap();
        let fresh = store.insert_track("pl", "new", &uri("new"), "ana", now).await.unwrap().unwrap();
        let later = store.insert_track("pl", "later", &uri("later"), "ana", now).await.unwrap().unwrap();
        assert!(store
            .schedule_removal(fresh, now, now - Duration::minutes(1))
            .await
            .unwrap());
        assert!(store
            .schedule_removal(later, now, now + Duration::hours(1))
            .await
            .unwrap());

        assert_eq!(store.due_track_ids(now).await.unwrap(), vec![old, fresh]);
    }

    #[tokio::test]
    async fn test_evaluation_request_makes_track_due_until_cleared() {
        let store = setup().await;
        let now = Utc::now();
        let id = store.insert_track("pl", "a", &uri("a"), "ana", now).await.unwrap().unwrap();
        assert!(store.due_track_ids(now).await.unwrap().is_empty());

        store.request_evaluation(id).await.unwrap();
        assert_eq!(store.due_track_ids(now).await.unwrap(), vec![id]);

        store.clear_evaluation(id).await.unwrap();
        assert!(store.due_track_ids(now).await.unwrap().is_empty());

        // Rows that already left the playlist are never flagged.
        assert!(store.claim_removal(id, now, true, false).await.unwrap());
        store.request_evaluation(id).await.unwrap();
        assert!(store.due_track_ids(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_playlist_needs_a_known_owner() {
        let store = Store::in_memory().await.unwrap();
        let orphan = SharedPlaylist {
            id: "orphan".to_string(),
            name: "Nobody's".to_string(),
            owner_id: "ghost".to_string(),
            spotify_playlist_id: "sp-orphan".to_string(),
            archive_spotify_playlist_id: None,
            policy: RemovalPolicy::default(),
        };
        assert!(matches!(
            store.upsert_playlist(&orphan).await,
            Err(StoreError::Database(_))
        ));

        seed_playlist(&store, "owner", &["ana"], RemovalPolicy::default()).await;
        assert!(store.get_user("owner").await.unwrap().is_some());
        assert_eq!(store.members("pl").await.unwrap(), vec!["ana".to_string()]);
    }

    #[tokio::test]
    async fn test_eligible_users_need_token_and_membership() {
        let store = setup().await;
        crate::testing::seed_user(&store, "loner", false).await;

        let ids: Vec<String> = store
            .eligible_users()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(ids, vec!["ana", "ben", "owner"]);

        store.mark_token_invalid("ben").await.unwrap();
        let ids: Vec<String> = store
            .eligible_users()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(ids, vec!["ana", "owner"]);
    }
}
