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

//! In-process Spotify double and store fixtures shared by the unit tests.

use crate::models::{
    Notification, PlaybackSnapshot, PlaylistItem, PlaylistPage, RemovalPolicy, SharedPlaylist, User,
};
use crate::notify::{Notifier, NotifyError};
use crate::spotify::{ApiError, SpotifyApi};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct FakeState {
    playback: HashMap<String, PlaybackSnapshot>,
    recent: HashMap<String, Vec<PlaybackSnapshot>>,
    playlists: HashMap<String, Vec<String>>,
    invalid_tokens: HashSet<String>,
    rate_limited: bool,
    fail_mutations: bool,
    playback_delay: Option<Duration>,
    page_size: Option<usize>,
    created: u32,
    calls: Vec<(&'static str, String)>,
}

/// Spotify stand-in keyed by access token; records every call it receives.
#[derive(Default)]
pub struct FakeSpotify {
    state: Mutex<FakeState>,
}

impl FakeSpotify {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_playback(&self, token: &str, snapshot: Option<PlaybackSnapshot>) {
        let mut state = self.state();
        match snapshot {
            Some(snapshot) => state.playback.insert(token.to_string(), snapshot),
            None => state.playback.remove(token),
        };
    }

    pub fn set_recent(&self, token: &str, played: Vec<PlaybackSnapshot>) {
        self.state().recent.insert(token.to_string(), played);
    }

    pub fn set_playlist(&self, playlist_id: &str, uris: &[&str]) {
        self.state().playlists.insert(
            playlist_id.to_string(),
            uris.iter().map(|u| u.to_string()).collect(),
        );
    }

    pub fn playlist(&self, playlist_id: &str) -> Vec<String> {
        self.state()
            .playlists
            .get(playlist_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn invalidate_token(&self, token: &str) {
        self.state().invalid_tokens.insert(token.to_string());
    }

    pub fn set_rate_limited(&self, limited: bool) {
        self.state().rate_limited = limited;
    }

    pub fn fail_mutations(&self, fail: bool) {
        self.state().fail_mutations = fail;
    }

    pub fn delay_playback(&self, delay: Duration) {
        self.state().playback_delay = Some(delay);
    }

    /// Items per playlist page; 100 unless set.
    pub fn set_page_size(&self, size: usize) {
        self.state().page_size = Some(size.max(1));
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state().calls.iter().filter(|(m, _)| *m == method).count()
    }

    fn enter(&self, method: &'static str, token: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        state.calls.push((method, token.to_string()));
        if state.rate_limited {
            return Err(ApiError::RateLimited { retry_after: Some(1) });
        }
        if state.invalid_tokens.contains(token) {
            return Err(ApiError::TokenInvalid);
        }
        Ok(())
    }

    fn mutation_guard(&self) -> Result<(), ApiError> {
        if self.state().fail_mutations {
            return Err(ApiError::Other("HTTP 502".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SpotifyApi for FakeSpotify {
    async fn current_playback(&self, token: &str) -> Result<Option<PlaybackSnapshot>, ApiError> {
        self.enter("current_playback", token)?;
        let delay = self.state().playback_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state().playback.get(token).cloned())
    }

    async fn recently_played(
        &self,
        token: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<PlaybackSnapshot>, ApiError> {
        self.enter("recently_played", token)?;
        let recent = self.state().recent.get(token).cloned().unwrap_or_default();
        Ok(recent
            .into_iter()
            .filter(|s| after.map_or(true, |after| s.observed_at > after))
            .collect())
    }

    async fn playlist_page(&self, token: &str, playlist_id: &str, offset: u32) -> Result<PlaylistPage, ApiError> {
        self.enter("playlist_page", token)?;
        let page_size = self.state().page_size.unwrap_or(100);
        let uris = self.playlist(playlist_id);
        let start = (offset as usize).min(uris.len());
        let end = (start + page_size).min(uris.len());

        let items = uris[start..end]
            .iter()
            .map(|uri| PlaylistItem {
                track_id: uri.trim_start_matches("spotify:track:").to_string(),
                uri: uri.clone(),
                name: "Song".to_string(),
                artists: "Artist".to_string(),
                album: "Album".to_string(),
                duration_ms: 200_000,
            })
            .collect();
        Ok(PlaylistPage {
            items,
            next_offset: (end < uris.len()).then_some(end as u32),
        })
    }

    async fn add_items(&self, token: &str, playlist_id: &str, uris: &[String]) -> Result<(), ApiError> {
        self.enter("add_items", token)?;
        self.mutation_guard()?;
        self.state()
            .playlists
            .entry(playlist_id.to_string())
            .or_default()
            .extend(uris.iter().cloned());
        Ok(())
    }

    async fn remove_items(&self, token: &str, playlist_id: &str, uris: &[String]) -> Result<(), ApiError> {
        self.enter("remove_items", token)?;
        self.mutation_guard()?;
        if let Some(items) = self.state().playlists.get_mut(playlist_id) {
            items.retain(|uri| !uris.contains(uri));
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
        self.enter("reorder_items", token)?;
        self.mutation_guard()?;
        if let Some(items) = self.state().playlists.get_mut(playlist_id) {
            let from = range_start as usize;
            let to = insert_before as usize;
            if from < items.len() && to <= items.len() {
                let item = items.remove(from);
                let to = if to > from { to - 1 } else { to };
                items.insert(to, item);
            }
        }
        Ok(())
    }

    async fn create_playlist(&self, token: &str, _name: &str, _description: &str) -> Result<String, ApiError> {
        self.enter("create_playlist", token)?;
        self.mutation_guard()?;
        let mut state = self.state();
        state.created += 1;
        let id = format!("archive-{}", state.created);
        state.playlists.insert(id.clone(), Vec::new());
        Ok(id)
    }
}

/// Collects every notification it is asked to deliver.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(Vec<String>, Notification)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_ids: &[String], notification: &Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((user_ids.to_vec(), notification.clone()));
        Ok(())
    }
}

pub fn uri(id: &str) -> String {
    format!("spotify:track:{}", id)
}

pub fn snapshot(id: &str, progress_ms: u64, duration_ms: u64) -> PlaybackSnapshot {
    PlaybackSnapshot {
        track_id: id.to_string(),
        track_uri: uri(id),
        progress_ms,
        duration_ms,
        is_playing: true,
        observed_at: Utc::now(),
    }
}

pub fn token_for(user_id: &str) -> String {
    format!("tok-{}", user_id)
}

pub async fn seed_user(store: &Store, id: &str, auto_negative: bool) {
    store
        .upsert_user(&User {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            access_token: Some(token_for(id)),
            token_valid: true,
            auto_negative_reactions: auto_negative,
        })
        .await
        .unwrap();
}

/// Playlist `pl` owned by `owner`, Spotify id `sp-pl`, with every listed user
/// seeded and joined as a member. Users already in the store are left alone.
pub async fn seed_playlist(store: &Store, owner: &str, members: &[&str], policy: RemovalPolicy) -> SharedPlaylist {
    // Playlists reference their owner, members reference users.
    for user in std::iter::once(&owner).chain(members) {
        if store.get_user(user).await.unwrap().is_none() {
            seed_user(store, user, false).await;
        }
    }

    let playlist = SharedPlaylist {
        id: "pl".to_string(),
        name: "Friday Swap".to_string(),
        owner_id: owner.to_string(),
        spotify_playlist_id: "sp-pl".to_string(),
        archive_spotify_playlist_id: None,
        policy,
    };
    store.upsert_playlist(&playlist).await.unwrap();
    for member in members {
        store.add_member(&playlist.id, member).await.unwrap();
    }
    playlist
}
