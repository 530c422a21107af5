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

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A linked Spotify account taking part in one or more shared playlists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub display_name: String,
    /// Opaque OAuth access token. Refreshing it is not our job.
    pub access_token: Option<String>,
    pub token_valid: bool,
    /// Infer a thumbs down when this user skips a shared track.
    pub auto_negative_reactions: bool,
}

/// Normalized view of what a user is (or was) playing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub track_id: String,
    pub track_uri: String,
    pub progress_ms: u64,
    pub duration_ms: u64,
    pub is_playing: bool,
    pub observed_at: DateTime<Utc>,
}

impl PlaybackSnapshot {
    /// Fraction of the track played, clamped to `0.0..=1.0`.
    pub fn progress_ratio(&self) -> f64 {
        ratio(self.progress_ms, self.duration_ms)
    }
}

pub(crate) fn ratio(progress_ms: u64, duration_ms: u64) -> f64 {
    if duration_ms == 0 {
        return 0.0;
    }
    (progress_ms as f64 / duration_ms as f64).clamp(0.0, 1.0)
}

/// Last known playback position for a user, plus what the detector needs to
/// judge the play once the track changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedSnapshot {
    pub snapshot: PlaybackSnapshot,
    /// Highest progress seen during the current play of this track.
    pub max_progress_ms: u64,
    /// A completion has already been emitted for the current play.
    pub completion_emitted: bool,
}

impl TrackedSnapshot {
    pub fn start(snapshot: PlaybackSnapshot) -> Self {
        Self {
            max_progress_ms: snapshot.progress_ms,
            snapshot,
            completion_emitted: false,
        }
    }

    pub fn max_ratio(&self) -> f64 {
        ratio(self.max_progress_ms, self.snapshot.duration_ms)
    }
}

/// Per-user poll state. Read and written only through
/// `Store::load_cursor` / `Store::save_cursor`; `version` guards the write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackCursor {
    pub tracked: Option<TrackedSnapshot>,
    /// Recently-played history is only read after this instant.
    pub poll_cursor: Option<DateTime<Utc>>,
    pub version: i64,
}

/// How long a completed track lingers before it is removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalDelay {
    #[default]
    Immediate,
    OneHour,
    TwelveHours,
    OneDay,
    ThreeDays,
    OneWeek,
    OneMonth,
}

impl RemovalDelay {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalDelay::Immediate => "immediate",
            RemovalDelay::OneHour => "1h",
            RemovalDelay::TwelveHours => "12h",
            RemovalDelay::OneDay => "24h",
            RemovalDelay::ThreeDays => "3d",
            RemovalDelay::OneWeek => "1w",
            RemovalDelay::OneMonth => "1m",
        }
    }

    /// `None` means remove as soon as the track completes.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            RemovalDelay::Immediate => None,
            RemovalDelay::OneHour => Some(Duration::hours(1)),
            RemovalDelay::TwelveHours => Some(Duration::hours(12)),
            RemovalDelay::OneDay => Some(Duration::hours(24)),
            RemovalDelay::ThreeDays => Some(Duration::days(3)),
            RemovalDelay::OneWeek => Some(Duration::weeks(1)),
            RemovalDelay::OneMonth => Some(Duration::days(30)),
        }
    }

    /// Lenient decoding for stored values: anything unknown is `Immediate`.
    pub fn parse_or_default(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl FromStr for RemovalDelay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(RemovalDelay::Immediate),
            "1h" => Ok(RemovalDelay::OneHour),
            "12h" => Ok(RemovalDelay::TwelveHours),
            "24h" => Ok(RemovalDelay::OneDay),
            "3d" => Ok(RemovalDelay::ThreeDays),
            "1w" => Ok(RemovalDelay::OneWeek),
            "1m" => Ok(RemovalDelay::OneMonth),
            other => Err(format!("unknown removal delay '{}'", other)),
        }
    }
}

/// Which completed tracks are copied to the archive playlist before removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveThreshold {
    #[default]
    None,
    NoDislikes,
    AtLeastOneLike,
    UniversallyLiked,
}

impl ArchiveThreshold {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveThreshold::None => "none",
            ArchiveThreshold::NoDislikes => "no_dislikes",
            ArchiveThreshold::AtLeastOneLike => "at_least_one_like",
            ArchiveThreshold::UniversallyLiked => "universally_liked",
        }
    }

    pub fn parse_or_default(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }

    /// Decides whether a track with these reactions earns an archive copy.
    pub fn admits<'a>(&self, reactions: impl IntoIterator<Item = &'a ReactionKind>) -> bool {
        let mut likes = 0usize;
        let mut dislikes = 0usize;
        let mut others = 0usize;
        for reaction in reactions {
            match reaction {
                ReactionKind::ThumbsUp => likes += 1,
                ReactionKind::ThumbsDown => dislikes += 1,
                ReactionKind::Emoji(_) => others += 1,
            }
        }

        match self {
            ArchiveThreshold::None => false,
            ArchiveThreshold::NoDislikes => dislikes == 0,
            ArchiveThreshold::AtLeastOneLike => likes > 0,
            ArchiveThreshold::UniversallyLiked => likes > 0 && dislikes == 0 && others == 0,
        }
    }
}

impl FromStr for ArchiveThreshold {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ArchiveThreshold::None),
            "no_dislikes" => Ok(ArchiveThreshold::NoDislikes),
            "at_least_one_like" => Ok(ArchiveThreshold::AtLeastOneLike),
            "universally_liked" => Ok(ArchiveThreshold::UniversallyLiked),
            other => Err(format!("unknown archive threshold '{}'", other)),
        }
    }
}

/// Removal rules of a shared playlist. Every field always has a value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalPolicy {
    pub max_tracks_per_user: Option<u32>,
    /// Hard TTL in days, 0 disables it.
    pub max_track_age_days: u32,
    pub removal_delay: RemovalDelay,
    pub archive_threshold: ArchiveThreshold,
}

impl RemovalPolicy {
    /// The instant after which a track added at `added_at` is expired.
    pub fn expires_at(&self, added_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.max_track_age_days == 0 {
            return None;
        }
        Some(added_at + Duration::days(i64::from(self.max_track_age_days)))
    }
}

/// A Swaplist: one Spotify playlist written to by its owner's credential only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedPlaylist {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub spotify_playlist_id: String,
    /// Created on first archive.
    pub archive_spotify_playlist_id: Option<String>,
    pub policy: RemovalPolicy,
}

/// Lifecycle of one track-add event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    Active,
    PendingRemoval(DateTime<Utc>),
    Removed(DateTime<Utc>),
    Archived(DateTime<Utc>),
}

impl TrackStatus {
    /// Live tracks are still in the playlist (possibly awaiting removal).
    pub fn is_live(&self) -> bool {
        matches!(self, TrackStatus::Active | TrackStatus::PendingRemoval(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            TrackStatus::Active => "active",
            TrackStatus::PendingRemoval(_) => "pending_removal",
            TrackStatus::Removed(_) => "removed",
            TrackStatus::Archived(_) => "archived",
        }
    }

    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            TrackStatus::Active => None,
            TrackStatus::PendingRemoval(at) | TrackStatus::Removed(at) | TrackStatus::Archived(at) => {
                Some(*at)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedTrack {
    pub id: i64,
    pub playlist_id: String,
    pub track_id: String,
    pub track_uri: String,
    pub added_by: String,
    pub added_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TrackStatus,
    /// Removed locally but not yet confirmed removed on Spotify.
    pub remote_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenRecord {
    pub playlist_id: String,
    pub shared_track_id: i64,
    pub user_id: String,
    pub listened_at: DateTime<Utc>,
    pub listen_duration_ms: u64,
    pub was_skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReactionKind {
    ThumbsUp,
    ThumbsDown,
    Emoji(String),
}

impl ReactionKind {
    pub fn as_str(&self) -> &str {
        match self {
            ReactionKind::ThumbsUp => "thumbs_up",
            ReactionKind::ThumbsDown => "thumbs_down",
            ReactionKind::Emoji(emoji) => emoji,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "thumbs_up" => ReactionKind::ThumbsUp,
            "thumbs_down" => ReactionKind::ThumbsDown,
            other => ReactionKind::Emoji(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub playlist_id: String,
    pub shared_track_id: i64,
    pub user_id: String,
    pub kind: ReactionKind,
    /// Inferred from behaviour rather than chosen by the user.
    pub is_auto: bool,
}

/// One entry of a live Spotify playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub uri: String,
    pub track_id: String,
    pub name: String,
    pub artists: String,
    pub album: String,
    pub duration_ms: u64,
}

/// One page of a playlist listing. `next_offset` is `None` on the last page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaylistPage {
    pub items: Vec<PlaylistItem>,
    pub next_offset: Option<u32>,
}

/// Message handed to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub url: Option<String>,
}

/// Counters for one reconciliation cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub users_polled: u32,
    pub listens_recorded: u32,
    pub skips_detected: u32,
    pub tracks_removed: u32,
    pub tracks_archived: u32,
    pub tracks_scheduled: u32,
    pub reactions_inferred: u32,
    pub tokens_invalidated: u32,
    pub drift_inserted: u32,
    pub drift_removed: u32,
    pub remote_retries: u32,
    pub user_failures: u32,
    pub track_failures: u32,
    pub remote_failures: u32,
    /// The cycle stopped issuing new Spotify calls (rate limit or budget).
    pub aborted: bool,
    /// Remote playlist sync ran in this cycle.
    pub synced: bool,
}

impl CycleReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> u32 {
        self.user_failures + self.track_failures + self.remote_failures
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "users={} listens={} skips={} removed={} archived={} scheduled={} failures={}",
            self.users_polled,
            self.listens_recorded,
            self.skips_detected,
            self.tracks_removed,
            self.tracks_archived,
            self.tracks_scheduled,
            self.failures()
        )?;
        if self.synced {
            write!(
                f,
                " | drift +{} -{} retried={}",
                self.drift_inserted, self.drift_removed, self.remote_retries
            )?;
        }
        if self.aborted {
            write!(f, " [ABORTED]")?;
        }
        Ok(())
    }
}

/// Outcome of reconciling one playlist against Spotify.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub inserted: u32,
    pub removed: u32,
    pub retried: u32,
    pub remote_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_threshold_universally_liked() {
        let split = [ReactionKind::ThumbsUp, ReactionKind::ThumbsDown];
        let unanimous = [ReactionKind::ThumbsUp, ReactionKind::ThumbsUp];

        assert!(!ArchiveThreshold::UniversallyLiked.admits(&split));
        assert!(ArchiveThreshold::UniversallyLiked.admits(&unanimous));
        assert!(!ArchiveThreshold::UniversallyLiked.admits(&[]));
    }

    #[test]
    fn test_archive_threshold_other_modes() {
        let fire = [ReactionKind::Emoji("🔥".to_string())];
        let split = [ReactionKind::ThumbsUp, ReactionKind::ThumbsDown];

        assert!(!ArchiveThreshold::None.admits(&[ReactionKind::ThumbsUp]));
        assert!(ArchiveThreshold::NoDislikes.admits(&fire));
        assert!(ArchiveThreshold::NoDislikes.admits(&[]));
        assert!(!ArchiveThreshold::NoDislikes.admits(&split));
        assert!(ArchiveThreshold::AtLeastOneLike.admits(&split));
        assert!(!ArchiveThreshold::AtLeastOneLike.admits(&fire));
    }

    #[test]
    fn test_policy_values_default_when_unknown() {
        assert_eq!(RemovalDelay::parse_or_default("3d"), RemovalDelay::ThreeDays);
        assert_eq!(RemovalDelay::parse_or_default("fortnight"), RemovalDelay::Immediate);
        assert_eq!(
            ArchiveThreshold::parse_or_default("at_least_one_like"),
            ArchiveThreshold::AtLeastOneLike
        );
        assert_eq!(ArchiveThreshold::parse_or_default(""), ArchiveThreshold::None);
        assert_eq!(RemovalDelay::OneMonth.duration(), Some(Duration::days(30)));
    }

    #[test]
    fn test_policy_expiry_disabled_at_zero() {
        let added = Utc::now();
        let mut policy = RemovalPolicy::default();
        assert_eq!(policy.expires_at(added), None);

        policy.max_track_age_days = 2;
        assert_eq!(policy.expires_at(added), Some(added + Duration::days(2)));
    }

    #[test]
    fn test_reaction_kind_parse() {
        assert_eq!(ReactionKind::parse("thumbs_up"), ReactionKind::ThumbsUp);
        assert_eq!(ReactionKind::parse("🎉"), ReactionKind::Emoji("🎉".to_string()));
        assert_eq!(ReactionKind::ThumbsDown.as_str(), "thumbs_down");
    }

    #[test]
    fn test_cycle_report_display() {
        let mut report = CycleReport::new();
        report.users_polled = 3;
        report.listens_recorded = 2;
        report.remote_failures = 1;

        let display = format!("{}", report);
        assert!(display.contains("users=3"));
        assert!(display.contains("failures=1"));
        assert!(!display.contains("drift"));

        report.synced = true;
        report.aborted = true;
        let display = format!("{}", report);
        assert!(display.contains("drift +0 -0"));
        assert!(display.contains("[ABORTED]"));
    }

    #[test]
    fn test_snapshot_ratio_handles_zero_duration() {
        let snapshot = PlaybackSnapshot {
            track_id: "t".to_string(),
            track_uri: "spotify:track:t".to_string(),
            progress_ms: 500,
            duration_ms: 0,
            is_playing: true,
            observed_at: Utc::now(),
        };
        assert_eq!(snapshot.progress_ratio(), 0.0);
    }
}
