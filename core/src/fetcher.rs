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

use crate::models::PlaybackSnapshot;
use crate::spotify::{ApiError, GatedSpotify};
use chrono::{DateTime, Utc};
use log::debug;

/// Everything learned about one user's playback in one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedPlayback {
    pub current: Option<PlaybackSnapshot>,
    /// Plays finished since the previous cursor, oldest first.
    pub finished: Vec<PlaybackSnapshot>,
    /// Where the next recently-played lookup should start.
    pub next_poll_cursor: Option<DateTime<Utc>>,
}

/// Asks Spotify what the user is playing. Only when nothing is playing does it
/// look at recently-played history since `cursor`, which covers listens that
/// started and finished between two polls.
///
/// While something is playing the cursor moves to the observation time: plays
/// before it were already seen through snapshots.
pub async fn fetch_playback(
    api: &GatedSpotify,
    token: &str,
    cursor: Option<DateTime<Utc>>,
) -> Result<FetchedPlayback, ApiError> {
    if let Some(current) = api.current_playback(token).await? {
        let next_poll_cursor = Some(cursor.map_or(current.observed_at, |c| c.max(current.observed_at)));
        return Ok(FetchedPlayback {
            current: Some(current),
            finished: Vec::new(),
            next_poll_cursor,
        });
    }

    let mut finished: Vec<PlaybackSnapshot> = api
        .recently_played(token, cursor)
        .await?
        .into_iter()
        .filter(|played| cursor.map_or(true, |c| played.observed_at > c))
        .collect();
    finished.sort_by_key(|played| played.observed_at);

    let next_poll_cursor = finished.last().map(|played| played.observed_at).or(cursor);
    debug!("Nothing playing, {} plays since {:?}", finished.len(), cursor);

    Ok(FetchedPlayback {
        current: None,
        finished,
        next_poll_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetConfig, RateBudget};
    use crate::testing::{snapshot, FakeSpotify};
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use std::time::Duration;

    fn gated(fake: &Arc<FakeSpotify>) -> GatedSpotify {
        GatedSpotify::new(
            fake.clone(),
            Arc::new(RateBudget::new(BudgetConfig::standard())),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_current_playback_skips_history() {
        let fake = Arc::new(FakeSpotify::new());
        fake.set_playback("tok", Some(snapshot("a", 10_000, 200_000)));

        let fetched = fetch_playback(&gated(&fake), "tok", None).await.unwrap();
        assert_eq!(fetched.current.as_ref().unwrap().track_id, "a");
        assert!(fetched.finished.is_empty());
        assert!(fetched.next_poll_cursor.is_some());
        assert_eq!(fake.call_count("recently_played"), 0);
    }

    #[tokio::test]
    async fn test_history_since_cursor_when_idle() {
        let fake = Arc::new(FakeSpotify::new());
        let now = Utc::now();
        let mut old = snapshot("old", 200_000, 200_000);
        old.observed_at = now - ChronoDuration::hours(2);
        let mut newer = snapshot("b", 200_000, 200_000);
        newer.observed_at = now - ChronoDuration::minutes(5);
        let mut newest = snapshot("c", 200_000, 200_000);
        newest.observed_at = now - ChronoDuration::minutes(1);
        fake.set_recent("tok", vec![newest.clone(), old, newer]);

        let cursor = Some(now - ChronoDuration::hours(1));
        let fetched = fetch_playback(&gated(&fake), "tok", cursor).await.unwrap();

        let ids: Vec<&str> = fetched.finished.iter().map(|s| s.track_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(fetched.next_poll_cursor, Some(newest.observed_at));
    }

    #[tokio::test]
    async fn test_errors_are_passed_through() {
        let fake = Arc::new(FakeSpotify::new());
        fake.invalidate_token("tok");
        let err = fetch_playback(&gated(&fake), "tok", None).await.unwrap_err();
        assert!(matches!(err, ApiError::TokenInvalid));

        fake.set_rate_limited(true);
        let err = fetch_playback(&gated(&fake), "other", None).await.unwrap_err();
        assert!(err.aborts_cycle());
    }
}
