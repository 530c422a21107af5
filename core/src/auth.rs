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

use chrono::{Duration, Utc};
use rspotify::{scopes, AuthCodeSpotify, Token};
use std::collections::HashSet;

/// Scopes a linked account must have granted for the sync engine to work.
/// - user-read-playback-state / user-read-currently-playing: snapshots.
/// - user-read-recently-played: listens finished between polls.
/// - playlist-modify-public / playlist-modify-private: removals, archives, drift repair.
/// - playlist-read-private / playlist-read-collaborative: reading Swaplists.
pub fn required_scopes() -> HashSet<String> {
    scopes!(
        "user-read-playback-state",
        "user-read-currently-playing",
        "user-read-recently-played",
        "playlist-modify-public",
        "playlist-modify-private",
        "playlist-read-private",
        "playlist-read-collaborative"
    )
}

/// Builds a client that speaks for one user using an access token the web app
/// already obtained.
///
/// The token is declared fresh for the lifetime of the request so rspotify
/// never attempts a refresh on its own. Refreshing is the web app's job; when
/// Spotify rejects the token we report `TokenInvalid` and the user is flagged
/// for re-auth instead.
pub fn client_for_token(access_token: &str) -> AuthCodeSpotify {
    let token = Token {
        access_token: access_token.to_string(),
        expires_in: Duration::hours(1),
        expires_at: Some(Utc::now() + Duration::hours(1)),
        refresh_token: None,
        scopes: required_scopes(),
        ..Default::default()
    };

    AuthCodeSpotify::from_token(token)
}
