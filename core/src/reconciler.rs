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

//! Track lifecycle: completion, removal delay, hard expiry and archiving.
//!
//! A removal is claimed locally before Spotify is touched. The claim is a
//! conditional update, so when two reconcilers race on the same track only one
//! of them ever issues the remote call. Until Spotify confirms, the row keeps
//! `remote_pending` set and the remote sync retries it.

use crate::models::{ArchiveThreshold, Notification, RemovalPolicy, SharedPlaylist, SharedTrack, TrackStatus};
use crate::notify::NotificationQueue;
use crate::spotify::{ApiError, GatedSpotify};
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("Owner {0} of the playlist has no usable token")]
    MissingOwnerToken(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Every required member heard or reacted to it.
    Completed,
    /// The removal delay after completion elapsed.
    Scheduled,
    /// Older than the playlist's hard TTL.
    Expired,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::Completed => write!(f, "everyone has heard it"),
            RemovalReason::Scheduled => write!(f, "its removal delay elapsed"),
            RemovalReason::Expired => write!(f, "it reached the playlist's age limit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Schedule(DateTime<Utc>),
    Remove(RemovalReason),
}

/// What should happen to `track` right now.
///
/// A due scheduled removal comes first, then hard expiry (which does not care
/// about completion), then the completion rules.
pub fn decide(track: &SharedTrack, policy: &RemovalPolicy, complete: bool, now: DateTime<Utc>) -> Decision {
    match track.status {
        TrackStatus::PendingRemoval(at) if at <= now => return Decision::Remove(RemovalReason::Scheduled),
        TrackStatus::Active | TrackStatus::PendingRemoval(_) => {}
        TrackStatus::Removed(_) | TrackStatus::Archived(_) => return Decision::Keep,
    }

    if policy.expires_at(track.added_at).is_some_and(|expiry| expiry < now) {
        return Decision::Remove(RemovalReason::Expired);
    }

    if !complete || track.status != TrackStatus::Active {
        return Decision::Keep;
    }

    match policy.removal_delay.duration() {
        None => Decision::Remove(RemovalReason::Completed),
        Some(delay) => {
            let at = track.completed_at.unwrap_or(now) + delay;
            if at <= now {
                Decision::Remove(RemovalReason::Scheduled)
            } else {
                Decision::Schedule(at)
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed: u32,
    pub archived: u32,
    pub scheduled: u32,
    /// Archive copies waiting for a cycle that may call Spotify.
    pub deferred: u32,
    pub failures: u32,
    pub remote_failures: u32,
}

enum Outcome {
    Kept,
    Scheduled,
    Deferred,
    Removed { archived: bool, remote_failed: bool },
}

#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    api: GatedSpotify,
    notifications: NotificationQueue,
}

impl Reconciler {
    pub fn new(store: Store, api: GatedSpotify, notifications: NotificationQueue) -> Self {
        Self {
            store,
            api,
            notifications,
        }
    }

    /// Applies the lifecycle rules to every listed track.
    ///
    /// While `abort` is raised no Spotify call is made: removals that need no
    /// archive copy are still claimed (and left `remote_pending`), the others
    /// are flagged so the next cycle picks them up. A rate limit hit here
    /// raises `abort` for the rest of the cycle.
    pub async fn reconcile(&self, track_ids: &[i64], now: DateTime<Utc>, abort: &AtomicBool) -> ReconcileReport {
        let mut ids = track_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut report = ReconcileReport::default();
        for id in ids {
            match self.reconcile_track(id, now, abort).await {
                Ok(Outcome::Kept) => {}
                Ok(Outcome::Scheduled) => report.scheduled += 1,
                Ok(Outcome::Deferred) => report.deferred += 1,
                Ok(Outcome::Removed {
                    archived,
                    remote_failed,
                }) => {
                    report.removed += 1;
                    if archived {
                        report.archived += 1;
                    }
                    if remote_failed {
                        report.remote_failures += 1;
                    }
                }
                Err(e) => {
                    warn!("Failed to reconcile track {}: {}", id, e);
                    report.failures += 1;
                }
            }
        }
        report
    }

    /// Every member except the adder has a listen or a reaction on record.
    /// A playlist with nobody but the adder never completes anything.
    pub async fn is_complete(&self, track: &SharedTrack) -> Result<bool, StoreError> {
        let required: Vec<String> = self
            .store
            .members(&track.playlist_id)
            .await?
            .into_iter()
            .filter(|member| *member != track.added_by)
            .collect();
        if required.is_empty() {
            return Ok(false);
        }

        let engaged: HashSet<String> = self.store.engaged_users(track.id).await?.into_iter().collect();
        Ok(required.iter().all(|member| engaged.contains(member)))
    }

    async fn reconcile_track(&self, id: i64, now: DateTime<Utc>, abort: &AtomicBool) -> Result<Outcome, ReconcileError> {
        let Some(track) = self.store.get_track(id).await? else {
            return Ok(Outcome::Kept);
        };
        if !track.status.is_live() {
            return Ok(Outcome::Kept);
        }
        // Cleared before reading engagement so a reaction landing meanwhile flags it again.
        self.store.clear_evaluation(id).await?;
        let Some(playlist) = self.store.get_playlist(&track.playlist_id).await? else {
            warn!("Track {} belongs to unknown playlist {}", id, track.playlist_id);
            return Ok(Outcome::Kept);
        };

        let complete = track.status == TrackStatus::Active && self.is_complete(&track).await?;

        match decide(&track, &playlist.policy, complete, now) {
            Decision::Keep => Ok(Outcome::Kept),
            Decision::Schedule(at) => {
                if self.store.schedule_removal(id, now, at).await? {
                    info!("{} in '{}' scheduled for removal at {}", track.track_uri, playlist.name, at);
                    Ok(Outcome::Scheduled)
                } else {
                    Ok(Outcome::Kept)
                }
            }
            Decision::Remove(reason) => self.remove(&playlist, &track, reason, now, abort).await,
        }
    }

    async fn remove(
        &self,
        playlist: &SharedPlaylist,
        track: &SharedTrack,
        reason: RemovalReason,
        now: DateTime<Utc>,
        abort: &AtomicBool,
    ) -> Result<Outcome, ReconcileError> {
        let archive = self.earns_archive(playlist.policy.archive_threshold, track).await?;
        if archive && abort.load(Ordering::SeqCst) {
            debug!("Deferring archived removal of {} until Spotify is reachable", track.track_uri);
            self.store.request_evaluation(track.id).await?;
            return Ok(Outcome::Deferred);
        }

        let completed = reason != RemovalReason::Expired;
        if !self.store.claim_removal(track.id, now, completed, true).await? {
            debug!("Track {} was already removed by someone else", track.id);
            return Ok(Outcome::Kept);
        }
        info!("Removed {} from '{}': {}", track.track_uri, playlist.name, reason);

        let mut archived = false;
        let remote_failed = if abort.load(Ordering::SeqCst) {
            true
        } else {
            match self.push_removal(playlist, track, archive, now).await {
                Ok(done) => {
                    archived = done;
                    false
                }
                Err(e) => {
                    self.note_remote_failure(&e, abort);
                    warn!("Spotify removal of {} from '{}' pending: {}", track.track_uri, playlist.name, e);
                    true
                }
            }
        };

        let notification = if archived {
            Notification {
                title: "Track archived".to_string(),
                body: format!(
                    "A track you added to {} moved to its archive because {}.",
                    playlist.name, reason
                ),
                url: Some(track.track_uri.clone()),
            }
        } else {
            Notification {
                title: "Track removed".to_string(),
                body: format!("A track you added to {} was removed because {}.", playlist.name, reason),
                url: Some(track.track_uri.clone()),
            }
        };
        self.notifications.dispatch(vec![track.added_by.clone()], notification);

        Ok(Outcome::Removed {
            archived,
            remote_failed,
        })
    }

    /// Copies to the archive if asked, then removes from the shared playlist.
    /// Returns whether the archive copy was made.
    async fn push_removal(
        &self,
        playlist: &SharedPlaylist,
        track: &SharedTrack,
        archive: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, ReconcileError> {
        let token = self.owner_token(playlist).await?;
        let uris = vec![track.track_uri.clone()];

        if archive {
            let archive_id = self.ensure_archive_playlist(playlist, &token).await?;
            self.api.add_items(&token, &archive_id, &uris).await?;
            self.store.mark_archived(track.id, now).await?;
        }

        self.api
            .remove_items(&token, &playlist.spotify_playlist_id, &uris)
            .await?;
        self.store.set_remote_pending(track.id, false).await?;
        Ok(archive)
    }

    /// The playlist's archive on Spotify, created on first use.
    pub async fn ensure_archive_playlist(&self, playlist: &SharedPlaylist, token: &str) -> Result<String, ReconcileError> {
        if let Some(id) = &playlist.archive_spotify_playlist_id {
            return Ok(id.clone());
        }
        // Another track of the same playlist may have created it this cycle.
        if let Some(id) = self
            .store
            .get_playlist(&playlist.id)
            .await?
            .and_then(|fresh| fresh.archive_spotify_playlist_id)
        {
            return Ok(id);
        }

        let name = format!("{} Archive", playlist.name);
        let description = format!("Tracks that earned a place after leaving {}", playlist.name);
        let created = self.api.create_playlist(token, &name, &description).await?;
        if self.store.set_archive_playlist(&playlist.id, &created).await? {
            info!("Created archive playlist '{}' ({})", name, created);
            return Ok(created);
        }

        let winner = self
            .store
            .get_playlist(&playlist.id)
            .await?
            .and_then(|fresh| fresh.archive_spotify_playlist_id)
            .unwrap_or(created.clone());
        warn!("Archive for '{}' was created concurrently, {} is unused", playlist.name, created);
        Ok(winner)
    }

    async fn earns_archive(&self, threshold: ArchiveThreshold, track: &SharedTrack) -> Result<bool, StoreError> {
        if threshold == ArchiveThreshold::None {
            return Ok(false);
        }
        let reactions = self.store.reactions(track.id).await?;
        Ok(threshold.admits(reactions.iter().map(|r| &r.kind)))
    }

    async fn owner_token(&self, playlist: &SharedPlaylist) -> Result<String, ReconcileError> {
        self.store
            .get_user(&playlist.owner_id)
            .await?
            .filter(|owner| owner.token_valid)
            .and_then(|owner| owner.access_token)
            .ok_or_else(|| ReconcileError::MissingOwnerToken(playlist.owner_id.clone()))
    }

    fn note_remote_failure(&self, err: &ReconcileError, abort: &AtomicBool) {
        if let ReconcileError::Api(api) = err {
            if api.aborts_cycle() && !abort.swap(true, Ordering::SeqCst) {
                warn!("Spotify budget exhausted during reconciliation, pausing remote calls");
            }
        }
    }
}
