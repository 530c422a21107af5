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

use crate::auth::client_for_token;
use crate::budget::{BudgetExceeded, RateBudget};
use crate::models::{PlaybackSnapshot, PlaylistItem, PlaylistPage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use rspotify::{
    http::HttpError,
    model::{FullTrack, PlayableId, PlayableItem, PlaylistId, TimeLimits, TrackId},
    prelude::*,
    ClientError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Spotify caps playlist mutations at 100 items per request.
const MUTATION_CHUNK: usize = 100;
const RECENTLY_PLAYED_LIMIT: u32 = 50;
/// Largest page Spotify serves for playlist items.
const PLAYLIST_PAGE: u32 = 100;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Spotify rejected the access token")]
    TokenInvalid,
    #[error("Spotify rate limit hit (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },
    #[error(transparent)]
    Budget(#[from] BudgetExceeded),
    #[error("Invalid Spotify id: {0}")]
    InvalidId(String),
    #[error("Spotify API error: {0}")]
    Other(String),
}

impl ApiError {
    /// Errors after which no further Spotify calls should be made this cycle.
    pub fn aborts_cycle(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. } | ApiError::Budget(_))
    }
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        if let ClientError::Http(http) = &err {
            if let HttpError::StatusCode(response) = http.as_ref() {
                match response.status().as_u16() {
                    401 => return ApiError::TokenInvalid,
                    429 => {
                        let retry_after = response
                            .headers()
                            .get("retry-after")
                            .and_then(|value| value.to_str().ok())
                            .and_then(|value| value.parse().ok());
                        return ApiError::RateLimited { retry_after };
                    }
                    _ => {}
                }
            }
        }
        ApiError::Other(err.to_string())
    }
}

/// The slice of the Spotify Web API the engine depends on. Every call acts on
/// behalf of the user owning `token`.
#[async_trait]
pub trait SpotifyApi: Send + Sync {
    /// What the user is playing right now, if anything shareable.
    async fn current_playback(&self, token: &str) -> Result<Option<PlaybackSnapshot>, ApiError>;

    /// Tracks finished after `after`, oldest first, as completed snapshots.
    async fn recently_played(
        &self,
        token: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<PlaybackSnapshot>, ApiError>;

    /// One page of the playlist starting at `offset`.
    async fn playlist_page(&self, token: &str, playlist_id: &str, offset: u32) -> Result<PlaylistPage, ApiError>;

    async fn add_items(&self, token: &str, playlist_id: &str, uris: &[String]) -> Result<(), ApiError>;

    async fn remove_items(&self, token: &str, playlist_id: &str, uris: &[String]) -> Result<(), ApiError>;

    async fn reorder_items(
        &self,
        token: &str,
        playlist_id: &str,
        range_start: u32,
        insert_before: u32,
    ) -> Result<(), ApiError>;

    /// Creates a private playlist for the token's user and returns its id.
    async fn create_playlist(&self, token: &str, name: &str, description: &str) -> Result<String, ApiError>;
}

/// [`SpotifyApi`] backed by rspotify.
#[derive(Debug, Default, Clone, Copy)]
pub struct RspotifyGateway;

impl RspotifyGateway {
    pub fn new() -> Self {
        Self
    }
}

fn parse_playlist_id(playlist_id: &str) -> Result<PlaylistId<'_>, ApiError> {
    PlaylistId::from_id_or_uri(playlist_id).map_err(|_| ApiError::InvalidId(playlist_id.to_string()))
}

fn parse_track_uris(uris: &[String]) -> Result<Vec<PlayableId<'_>>, ApiError> {
    uris.iter()
        .map(|uri| {
            TrackId::from_id_or_uri(uri.as_str())
                .map(PlayableId::Track)
                .map_err(|_| ApiError::InvalidId(uri.clone()))
        })
        .collect()
}

fn snapshot_from_track(
    track: &FullTrack,
    progress_ms: u64,
    is_playing: bool,
    observed_at: DateTime<Utc>,
) -> Option<PlaybackSnapshot> {
    // Local files have no id and can't be part of a Swaplist.
    let id = track.id.as_ref()?;
    Some(PlaybackSnapshot {
        track_id: id.id().to_string(),
        track_uri: id.uri(),
        progress_ms,
        duration_ms: track.duration.num_milliseconds().max(0) as u64,
        is_playing,
        observed_at,
    })
}

#[async_trait]
impl SpotifyApi for RspotifyGateway {
    async fn current_playback(&self, token: &str) -> Result<Option<PlaybackSnapshot>, ApiError> {
        let spotify = client_for_token(token);
        let Some(context) = spotify.current_playback(None, None::<Vec<_>>).await? else {
            return Ok(None);
        };

        let progress_ms = context
            .progress
            .map(|p| p.num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        Ok(match &context.item {
            Some(PlayableItem::Track(track)) => {
                snapshot_from_track(track, progress_ms, context.is_playing, Utc::now())
            }
            // Podcasts are never shared.
            Some(PlayableItem::Episode(_)) | None => None,
        })
    }

    async fn recently_played(
        &self,
        token: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<PlaybackSnapshot>, ApiError> {
        let spotify = client_for_token(token);
        let page = spotify
            .current_user_recently_played(Some(RECENTLY_PLAYED_LIMIT), after.map(TimeLimits::After))
            .await?;

        let mut played: Vec<PlaybackSnapshot> = page
            .items
            .iter()
            .filter_map(|history| {
                let duration_ms = history.track.duration.num_milliseconds().max(0) as u64;
                snapshot_from_track(&history.track, duration_ms, false, history.played_at)
            })
            .collect();
        played.sort_by_key(|snapshot| snapshot.observed_at);

        Ok(played)
    }

    async fn playlist_page(&self, token: &str, playlist_id: &str, offset: u32) -> Result<PlaylistPage, ApiError> {
        let spotify = client_for_token(token);
        let page = spotify
            .playlist_items_manual(
                parse_playlist_id(playlist_id)?,
                None,
                None,
                Some(PLAYLIST_PAGE),
                Some(offset),
            )
            .await?;

        let items = page
            .items
            .iter()
            .filter_map(|item| match &item.track {
                Some(PlayableItem::Track(track)) => {
                    let track_id = track.id.as_ref()?;
                    Some(PlaylistItem {
                        uri: track_id.uri(),
                        track_id: track_id.id().to_string(),
                        name: track.name.clone(),
                        artists: track
                            .artists
                            .iter()
                            .map(|a| a.name.as_str())
                            .collect::<Vec<&str>>()
                            .join(", "),
                        album: track.album.name.clone(),
                        duration_ms: track.duration.num_milliseconds().max(0) as u64,
                    })
                }
                _ => None,
            })
            .collect();

        // Offsets count local files and episodes too, so advance by the raw page.
        let next_offset = page.next.as_ref().map(|_| page.offset + page.items.len() as u32);
        Ok(PlaylistPage { items, next_offset })
    }

    async fn add_items(&self, token: &str, playlist_id: &str, uris: &[String]) -> Result<(), ApiError> {
        let spotify = client_for_token(token);
        for chunk in uris.chunks(MUTATION_CHUNK) {
            let items = parse_track_uris(chunk)?;
            spotify
                .playlist_add_items(parse_playlist_id(playlist_id)?, items, None)
                .await?;
        }
        Ok(())
    }

    async fn remove_items(&self, token: &str, playlist_id: &str, uris: &[String]) -> Result<(), ApiError> {
        let spotify = client_for_token(token);
        for chunk in uris.chunks(MUTATION_CHUNK) {
            let items = parse_track_uris(chunk)?;
            spotify
                .playlist_remove_all_occurrences_of_items(parse_playlist_id(playlist_id)?, items, None)
                .await?;
        }
        Ok(())
    }

    async fn reorder_items(
        &self,
        token: &str,
        playlist_id: &str,
        range_start: u32,
        insert_before: u32,
    ) -> Result<(), ApiError> {
        let spotify = client_for_token(token);
        spotify
            .playlist_reorder_items(
                parse_playlist_id(playlist_id)?,
                Some(range_start as i32),
                Some(insert_before as i32),
                None,
                None,
            )
            .await?;
        Ok(())
    }

    async fn create_playlist(&self, token: &str, name: &str, description: &str) -> Result<String, ApiError> {
        let spotify = client_for_token(token);
        let me = spotify.current_user().await?;
        let playlist = spotify
            .user_playlist_create(me.id, name, Some(false), Some(false), Some(description))
            .await?;
        Ok(playlist.id.id().to_string())
    }
}

/// Every Spotify call made by the engine goes through here so that it is
/// admitted by the shared [`RateBudget`] first.
#[derive(Clone)]
pub struct GatedSpotify {
    api: Arc<dyn SpotifyApi>,
    budget: Arc<RateBudget>,
    max_wait: Duration,
}

impl GatedSpotify {
    pub fn new(api: Arc<dyn SpotifyApi>, budget: Arc<RateBudget>, max_wait: Duration) -> Self {
        Self { api, budget, max_wait }
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        &self.budget
    }

    async fn gate(&self, cost: usize) -> Result<(), ApiError> {
        self.budget.wait_for_budget(cost, self.max_wait).await?;
        Ok(())
    }

    pub async fn current_playback(&self, token: &str) -> Result<Option<PlaybackSnapshot>, ApiError> {
        self.gate(1).await?;
        self.api.current_playback(token).await
    }

    pub async fn recently_played(
        &self,
        token: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<PlaybackSnapshot>, ApiError> {
        self.gate(1).await?;
        self.api.recently_played(token, after).await
    }

    /// The whole playlist, admitting each page separately.
    pub async fn playlist_items(&self, token: &str, playlist_id: &str) -> Result<Vec<PlaylistItem>, ApiError> {
        let mut items = Vec::new();
        let mut offset = 0;
        loop {
            self.gate(1).await?;
            let page = self.api.playlist_page(token, playlist_id, offset).await?;
            items.extend(page.items);
            match page.next_offset {
                Some(next) if next > offset => offset = next,
                _ => break,
            }
        }
        debug!("Fetched {} items from playlist {}", items.len(), playlist_id);
        Ok(items)
    }

    pub async fn add_items(&self, token: &str, playlist_id: &str, uris: &[String]) -> Result<(), ApiError> {
        if uris.is_empty() {
            return Ok(());
        }
        self.gate(uris.len().div_ceil(MUTATION_CHUNK)).await?;
        self.api.add_items(token, playlist_id, uris).await
    }

    pub async fn remove_items(&self, token: &str, playlist_id: &str, uris: &[String]) -> Result<(), ApiError> {
        if uris.is_empty() {
            return Ok(());
        }
        self.gate(uris.len().div_ceil(MUTATION_CHUNK)).await?;
        self.api.remove_items(token, playlist_id, uris).await
    }

    pub async fn reorder_items(
        &self,
        token: &str,
        playlist_id: &str,
        range_start: u32,
        insert_before: u32,
    ) -> Result<(), ApiError> {
        self.gate(1).await?;
        self.api
            .reorder_items(token, playlist_id, range_start, insert_before)
            .await
    }

    /// Two calls: resolving the current user, then creating the playlist.
    pub async fn create_playlist(&self, token: &str, name: &str, description: &str) -> Result<String, ApiError> {
        self.gate(2).await?;
        self.api.create_playlist(token, name, description).await
    }
}
