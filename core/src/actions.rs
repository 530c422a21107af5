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

//! Member-driven writes: adding a track and reacting to one.

use crate::models::{Notification, Reaction, ReactionKind};
use crate::notify::NotificationQueue;
use crate::spotify::GatedSpotify;
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use log::{info, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Unknown playlist: {0}")]
    UnknownPlaylist(String),
    #[error("Unknown track {0} in this playlist")]
    UnknownTrack(i64),
    #[error("{user} is not a member of {playlist}")]
    NotMember { user: String, playlist: String },
    #[error("{0} is already in the playlist")]
    AlreadyActive(String),
    #[error("Track limit reached ({cap} per member)")]
    UserCapReached { cap: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub shared_track_id: i64,
    /// `false` when Spotify refused; the next remote sync will notice.
    pub remote_added: bool,
}

/// Adds a track on behalf of a member.
///
/// The local row is written first, then the track is added to Spotify with
/// the owner's credential. Other members are told about it.
#[allow(clippy::too_many_arguments)]
pub async fn add_track(
    store: &Store,
    api: &GatedSpotify,
    notifications: &NotificationQueue,
    playlist_id: &str,
    user_id: &str,
    track_id: &str,
    track_uri: &str,
    now: DateTime<Utc>,
) -> Result<Admitted, AdmissionError> {
    let playlist = store
        .get_playlist(playlist_id)
        .await?
        .ok_or_else(|| AdmissionError::UnknownPlaylist(playlist_id.to_string()))?;
    require_member(store, playlist_id, user_id).await?;

    if let Some(cap) = playlist.policy.max_tracks_per_user {
        if store.count_live_tracks_by(playlist_id, user_id).await? >= cap {
            return Err(AdmissionError::UserCapReached { cap });
        }
    }

    let shared_track_id = store
        .insert_track(playlist_id, track_id, track_uri, user_id, now)
        .await?
        .ok_or_else(|| AdmissionError::AlreadyActive(track_uri.to_string()))?;

    let owner_token = store
        .get_user(&playlist.owner_id)
        .await?
        .filter(|owner| owner.token_valid)
        .and_then(|owner| owner.access_token);
    let remote_added = match owner_token {
        Some(token) => match api
            .add_items(&token, &playlist.spotify_playlist_id, &[track_uri.to_string()])
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Adding {} to '{}' on Spotify failed: {}", track_uri, playlist.name, e);
                false
            }
        },
        None => {
            warn!("Owner of '{}' has no usable token, {} stays local", playlist.name, track_uri);
            false
        }
    };

    let adder = store
        .get_user(user_id)
        .await?
        .map(|u| u.display_name)
        .unwrap_or_else(|| user_id.to_string());
    let others: Vec<String> = store
        .members(playlist_id)
        .await?
        .into_iter()
        .filter(|member| member != user_id)
        .collect();
    notifications.dispatch(
        others,
        Notification {
            title: format!("New track in {}", playlist.name),
            body: format!("{} added a track. Give it a listen.", adder),
            url: Some(track_uri.to_string()),
        },
    );

    info!("{} added {} to '{}'", user_id, track_uri, playlist.name);
    Ok(Admitted {
        shared_track_id,
        remote_added,
    })
}

/// Stores an explicit reaction and queues the track for the next cycle.
/// Returns whether anything changed.
pub async fn react(
    store: &Store,
    playlist_id: &str,
    shared_track_id: i64,
    user_id: &str,
    kind: ReactionKind,
    now: DateTime<Utc>,
) -> Result<bool, AdmissionError> {
    require_member(store, playlist_id, user_id).await?;
    let track = store
        .get_track(shared_track_id)
        .await?
        .filter(|t| t.playlist_id == playlist_id)
        .ok_or(AdmissionError::UnknownTrack(shared_track_id))?;

    let changed = store
        .upsert_reaction(
            &Reaction {
                playlist_id: playlist_id.to_string(),
                shared_track_id: track.id,
                user_id: user_id.to_string(),
                kind,
                is_auto: false,
            },
            now,
        )
        .await?;
    if changed {
        // A reaction can complete the track; have the next cycle look at it.
        store.request_evaluation(track.id).await?;
    }
    Ok(changed)
}

async fn require_member(store: &Store, playlist_id: &str, user_id: &str) -> Result<(), AdmissionError> {
    if store.is_member(playlist_id, user_id).await? {
        Ok(())
    } else {
        Err(AdmissionError::NotMember {
            user: user_id.to_string(),
            playlist: playlist_id.to_string(),
        })
    }
}
