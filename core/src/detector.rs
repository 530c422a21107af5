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

//! Listen / skip detection.
//!
//! A play is judged on the highest progress observed while the same track
//! stayed on, not on the last snapshot:
//!
//! - reaching `complete_ratio` (default 90 %) is a listen, emitted as soon as
//!   it is observed;
//! - changing track below `skip_ratio` (default 30 %) is a skip;
//! - changing track in between is inconclusive and records nothing.
//!
//! Progress going backwards on the same URI is ambiguous. If the play had
//! already reached the completion threshold it is treated as a loop restart
//! and counts as a listen. Otherwise nothing is emitted and the play keeps
//! being tracked, so a skip is only ever decided on a later observation.

use crate::models::{
    ListenRecord, PlaybackSnapshot, Reaction, ReactionKind, TrackedSnapshot, User,
};
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use log::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub complete_ratio: f64,
    pub skip_ratio: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            complete_ratio: 0.9,
            skip_ratio: 0.3,
        }
    }
}

/// A finished judgement about one play of one track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub track_uri: String,
    pub listened_ms: u64,
    pub observed_at: DateTime<Utc>,
    pub skipped: bool,
}

impl Observation {
    fn completed(tracked: &TrackedSnapshot, observed_at: DateTime<Utc>) -> Self {
        Self {
            track_uri: tracked.snapshot.track_uri.clone(),
            listened_ms: tracked.max_progress_ms,
            observed_at,
            skipped: false,
        }
    }

    fn skipped(tracked: &TrackedSnapshot, observed_at: DateTime<Utc>) -> Self {
        Self {
            skipped: true,
            ..Self::completed(tracked, observed_at)
        }
    }

    /// A recently-played entry: Spotify only lists finished plays.
    pub fn finished(snapshot: &PlaybackSnapshot) -> Self {
        Self {
            track_uri: snapshot.track_uri.clone(),
            listened_ms: snapshot.duration_ms,
            observed_at: snapshot.observed_at,
            skipped: false,
        }
    }
}

/// Folds the next snapshot into the tracked state.
///
/// Returns the state to persist and the plays that were decided by this step.
pub fn advance(
    previous: Option<&TrackedSnapshot>,
    next: Option<&PlaybackSnapshot>,
    thresholds: Thresholds,
) -> (Option<TrackedSnapshot>, Vec<Observation>) {
    let mut observations = Vec::new();

    let Some(next) = next else {
        // Playback stopped. Only a completion can be concluded from that;
        // a stop is not a skip.
        if let Some(prev) = previous {
            if !prev.completion_emitted && prev.max_ratio() >= thresholds.complete_ratio {
                observations.push(Observation::completed(prev, prev.snapshot.observed_at));
            }
        }
        return (None, observations);
    };

    let mut tracked = match previous {
        Some(prev) if prev.snapshot.track_uri == next.track_uri => {
            if next.progress_ms < prev.snapshot.progress_ms {
                if prev.max_ratio() >= thresholds.complete_ratio {
                    trace!("Loop restart on {}", next.track_uri);
                    if !prev.completion_emitted {
                        observations.push(Observation::completed(prev, next.observed_at));
                    }
                    TrackedSnapshot::start(next.clone())
                } else {
                    trace!("Progress regressed on {}, waiting", next.track_uri);
                    TrackedSnapshot {
                        snapshot: next.clone(),
                        max_progress_ms: prev.max_progress_ms,
                        completion_emitted: prev.completion_emitted,
                    }
                }
            } else {
                TrackedSnapshot {
                    snapshot: next.clone(),
                    max_progress_ms: prev.max_progress_ms.max(next.progress_ms),
                    completion_emitted: prev.completion_emitted,
                }
            }
        }
        Some(prev) => {
            if !prev.completion_emitted {
                let ratio = prev.max_ratio();
                if ratio >= thresholds.complete_ratio {
                    observations.push(Observation::completed(prev, next.observed_at));
                } else if ratio < thresholds.skip_ratio {
                    observations.push(Observation::skipped(prev, next.observed_at));
                } else {
                    trace!(
                        "Inconclusive play of {} ({:.0}%)",
                        prev.snapshot.track_uri,
                        ratio * 100.0
                    );
                }
            }
            TrackedSnapshot::start(next.clone())
        }
        None => TrackedSnapshot::start(next.clone()),
    };

    if !tracked.completion_emitted && tracked.max_ratio() >= thresholds.complete_ratio {
        observations.push(Observation::completed(&tracked, next.observed_at));
        tracked.completion_emitted = true;
    }

    (Some(tracked), observations)
}

/// What recording a user's observations changed in the store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub listens: u32,
    pub skips: u32,
    pub reactions: u32,
    /// Shared tracks that gained a listen or reaction.
    pub touched: Vec<i64>,
}

/// Turns observations into listen records (and automatic reactions) for every
/// live shared track the user can hear them on.
///
/// Observations of tracks that are not shared with the user, or that predate
/// the track being added, are ignored. The user's own additions are skipped.
pub async fn record(store: &Store, user: &User, observations: &[Observation]) -> Result<Recorded, StoreError> {
    let mut recorded = Recorded::default();

    for observation in observations {
        let tracks = store
            .live_tracks_for_member(&user.id, &observation.track_uri)
            .await?;
        if tracks.is_empty() {
            trace!("{} played unshared {}", user.id, observation.track_uri);
            continue;
        }

        for track in tracks {
            if track.added_by == user.id || observation.observed_at < track.added_at {
                continue;
            }

            let inserted = store
                .record_listen(&ListenRecord {
                    playlist_id: track.playlist_id.clone(),
                    shared_track_id: track.id,
                    user_id: user.id.clone(),
                    listened_at: observation.observed_at,
                    listen_duration_ms: observation.listened_ms,
                    was_skipped: observation.skipped,
                })
                .await?;
            if !inserted {
                continue;
            }

            recorded.touched.push(track.id);
            if !observation.skipped {
                debug!("{} listened to {} in {}", user.id, track.track_uri, track.playlist_id);
                recorded.listens += 1;
                continue;
            }

            debug!("{} skipped {} in {}", user.id, track.track_uri, track.playlist_id);
            recorded.skips += 1;
            if user.auto_negative_reactions {
                let changed = store
                    .upsert_reaction(
                        &Reaction {
                            playlist_id: track.playlist_id.clone(),
                            shared_track_id: track.id,
                            user_id: user.id.clone(),
                            kind: ReactionKind::ThumbsDown,
                            is_auto: true,
                        },
                        observation.observed_at,
                    )
                    .await?;
                if changed {
                    recorded.reactions += 1;
                }
            }
        }
    }

    Ok(recorded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RemovalPolicy;
    use crate::testing::{seed_playlist, snapshot, uri};

    const DURATION: u64 = 200_000;

    fn run(steps: &[Option<PlaybackSnapshot>]) -> (Option<TrackedSnapshot>, Vec<Observation>) {
        let mut state = None;
        let mut all = Vec::new();
        for step in steps {
            let (next, mut observations) = advance(state.as_ref(), step.as_ref(), Thresholds::default());
            state = next;
            all.append(&mut observations);
        }
        (state, all)
    }

    #[test]
    fn test_reaching_ninety_five_percent_is_a_listen() {
        let (_, observations) = run(&[
            Some(snapshot("a", 40_000, DURATION)),
            Some(snapshot("a", 190_000, DURATION)),
            Some(snapshot("b", 1_000, DURATION)),
        ]);

        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].track_uri, uri("a"));
        assert!(!observations[0].skipped);
        assert_eq!(observations[0].listened_ms, 190_000);
    }

    #[test]
    fn test_changing_track_at_twenty_percent_is_a_skip() {
        let (_, observations) = run(&[
            Some(snapshot("a", 10_000, DURATION)),
            Some(snapshot("a", 40_000, DURATION)),
            Some(snapshot("b", 2_000, DURATION)),
        ]);

        assert_eq!(observations.len(), 1);
        assert!(observations[0].skipped);
        assert_eq!(observations[0].track_uri, uri("a"));
    }

    #[test]
    fn test_middle_band_is_inconclusive() {
        let (_, observations) = run(&[
            Some(snapshot("a", 100_000, DURATION)),
            Some(snapshot("b", 2_000, DURATION)),
        ]);
        assert!(observations.is_empty());
    }

    #[test]
    fn test_completion_emitted_once_per_play() {
        let (state, observations) = run(&[
            Some(snapshot("a", 185_000, DURATION)),
            Some(snapshot("a", 195_000, DURATION)),
            Some(snapshot("a", 199_000, DURATION)),
            Some(snapshot("b", 1_000, DURATION)),
        ]);

        assert_eq!(observations.len(), 1);
        assert_eq!(state.unwrap().snapshot.track_uri, uri("b"));
    }

    #[test]
    fn test_loop_restart_counts_as_listen_not_skip() {
        // 92% then back to 2% on the same track.
        let mut high = snapshot("a", 185_000, DURATION);
        let (state, first) = advance(None, Some(&high), Thresholds::default());
        assert_eq!(first.len(), 1);

        high.progress_ms = 4_000;
        let (state, second) = advance(state.as_ref(), Some(&high), Thresholds::default());
        assert!(second.is_empty(), "completion was already emitted");
        let state = state.unwrap();
        assert_eq!(state.max_progress_ms, 4_000);
        assert!(!state.completion_emitted);

        // A restart whose peak was seen only by the tracker, not emitted yet.
        let tracked = TrackedSnapshot {
            snapshot: snapshot("a", 180_000, DURATION),
            max_progress_ms: 180_000,
            completion_emitted: false,
        };
        let (_, observations) = advance(
            Some(&tracked),
            Some(&snapshot("a", 3_000, DURATION)),
            Thresholds::default(),
        );
        assert_eq!(observations.len(), 1);
        assert!(!observations[0].skipped);
    }

    #[test]
    fn test_low_regression_defers_the_skip() {
        let (state, observations) = run(&[
            Some(snapshot("a", 30_000, DURATION)),
            Some(snapshot("a", 5_000, DURATION)),
        ]);
        assert!(observations.is_empty());
        assert_eq!(state.unwrap().max_progress_ms, 30_000);

        let (_, observations) = run(&[
            Some(snapshot("a", 30_000, DURATION)),
            Some(snapshot("a", 5_000, DURATION)),
            Some(snapshot("b", 1_000, DURATION)),
        ]);
        assert_eq!(observations.len(), 1);
        assert!(observations[0].skipped);
    }

    #[test]
    fn test_stopping_is_never_a_skip() {
        let (state, observations) = run(&[Some(snapshot("a", 10_000, DURATION)), None]);
        assert!(state.is_none());
        assert!(observations.is_empty());
    }

    #[tokio::test]
    async fn test_record_creates_listens_and_auto_reactions() {
        let store = Store::in_memory().await.unwrap();
        seed_playlist(&store, "owner", &["owner", "ana"], RemovalPolicy::default()).await;
        crate::testing::seed_user(&store, "ben", true).await;
        store.add_member("pl", "ben").await.unwrap();

        let added = Utc::now() - chrono::Duration::minutes(5);
        let shared = store.insert_track("pl", "a", &uri("a"), "ana", added).await.unwrap().unwrap();
        let ben = store.get_user("ben").await.unwrap().unwrap();

        let skip = Observation {
            track_uri: uri("a"),
            listened_ms: 20_000,
            observed_at: Utc::now(),
            skipped: true,
        };
        let unshared = Observation {
            track_uri: uri("zzz"),
            ..skip.clone()
        };

        let recorded = record(&store, &ben, &[skip.clone(), unshared]).await.unwrap();
        assert_eq!(recorded.skips, 1);
        assert_eq!(recorded.reactions, 1);
        assert_eq!(recorded.touched, vec![shared]);
        assert_eq!(store.reactions(shared).await.unwrap()[0].kind, ReactionKind::ThumbsDown);

        // Replaying the same observation changes nothing.
        let again = record(&store, &ben, &[skip]).await.unwrap();
        assert_eq!(again, Recorded::default());

        // The adder's own plays never count.
        let ana = store.get_user("ana").await.unwrap().unwrap();
        let own = Observation {
            track_uri: uri("a"),
            listened_ms: 200_000,
            observed_at: Utc::now(),
            skipped: false,
        };
        assert_eq!(record(&store, &ana, &[own]).await.unwrap().listens, 0);
    }
}
