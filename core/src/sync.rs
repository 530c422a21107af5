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

//! Two-way drift repair between a shared playlist and its Spotify copy.
//!
//! Spotify is the truth for membership of the playlist: anything added in the
//! Spotify app is adopted locally, anything deleted there is retired locally.
//! The one exception is a local removal Spotify has not seen yet
//! (`remote_pending`), which is pushed again instead of being re-adopted.

use crate::models::{SharedPlaylist, SyncReport};
use crate::spotify::{ApiError, GatedSpotify};
use crate::store::{Store, StoreError};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Local rows younger than this may still be on their way to Spotify.
const IN_FLIGHT_GRACE_SECS: i64 = 120;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Owner {0} has no usable token")]
    MissingOwnerToken(String),
}

impl SyncError {
    pub fn aborts_cycle(&self) -> bool {
        matches!(self, SyncError::Api(e) if e.aborts_cycle())
    }
}

/// Converges one playlist. Each delta is a single local write; running it
/// twice in a row changes nothing the second time.
pub async fn sync_playlist(
    store: &Store,
    api: &GatedSpotify,
    playlist: &SharedPlaylist,
    now: DateTime<Utc>,
) -> Result<SyncReport, SyncError> {
    let token = store
        .get_user(&playlist.owner_id)
        .await?
        .filter(|owner| owner.token_valid)
        .and_then(|owner| owner.access_token)
        .ok_or_else(|| SyncError::MissingOwnerToken(playlist.owner_id.clone()))?;

    let remote: HashMap<String, String> = api
        .playlist_items(&token, &playlist.spotify_playlist_id)
        .await?
        .into_iter()
        .map(|item| (item.uri, item.track_id))
        .collect();
    let local = store.live_tracks(&playlist.id).await?;
    let local_uris: HashSet<&str> = local.iter().map(|t| t.track_uri.as_str()).collect();

    let mut report = SyncReport::default();

    // Removals Spotify has not confirmed yet.
    let mut retried: HashSet<String> = HashSet::new();
    for track in store.remote_pending_tracks(&playlist.id).await? {
        if !remote.contains_key(&track.track_uri) || local_uris.contains(track.track_uri.as_str()) {
            // Gone already, or the URI was re-added since and is live again.
            store.set_remote_pending(track.id, false).await?;
            continue;
        }
        retried.insert(track.track_uri.clone());
        match api
            .remove_items(&token, &playlist.spotify_playlist_id, &[track.track_uri.clone()])
            .await
        {
            Ok(()) => {
                store.set_remote_pending(track.id, false).await?;
                report.retried += 1;
            }
            Err(e) if e.aborts_cycle() => return Err(e.into()),
            Err(e) => {
                warn!("Retrying removal of {} from '{}' failed: {}", track.track_uri, playlist.name, e);
                report.remote_failures += 1;
            }
        }
    }

    // On Spotify, unknown locally: adopt, attributed to the owner.
    for (uri, track_id) in &remote {
        if local_uris.contains(uri.as_str()) || retried.contains(uri) {
            continue;
        }
        if store
            .insert_track(&playlist.id, track_id, uri, &playlist.owner_id, now)
            .await?
            .is_some()
        {
            debug!("Adopted {} into '{}'", uri, playlist.name);
            report.inserted += 1;
        }
    }

    // Local, gone from Spotify: retire without a remote call.
    let in_flight_since = now - Duration::seconds(IN_FLIGHT_GRACE_SECS);
    for track in &local {
        if remote.contains_key(&track.track_uri) {
            continue;
        }
        if track.added_at > in_flight_since {
            debug!("{} is newer than the fetch, leaving it", track.track_uri);
            continue;
        }
        if store.claim_removal(track.id, now, false, false).await? {
            debug!("Retired {} from '{}', deleted on Spotify", track.track_uri, playlist.name);
            report.removed += 1;
        }
    }

    if report.inserted + report.removed + report.retried > 0 {
        info!(
            "Synced '{}': +{} -{} retried {}",
            playlist.name, report.inserted, report.removed, report.retried
        );
    }
    Ok(report)
}
