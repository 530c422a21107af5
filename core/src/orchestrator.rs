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

//! The polling cycle.
//!
//! One cycle polls every eligible user (a few at a time), records what they
//! heard, reconciles the tracks that changed or fell due, and every few
//! cycles repairs drift against Spotify. Only one cycle runs at a time; a
//! trigger that arrives during a cycle is answered with "busy".

use crate::config::EngineConfig;
use crate::detector::{self, Observation, Recorded};
use crate::fetcher::fetch_playback;
use crate::models::{CycleReport, SyncReport, User};
use crate::notify::NotificationQueue;
use crate::reconciler::Reconciler;
use crate::spotify::{ApiError, GatedSpotify};
use crate::store::{Store, StoreError};
use crate::sync::{sync_playlist, SyncError};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

#[derive(Error, Debug)]
enum PollError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum UserOutcome {
    Polled(Recorded),
    Skipped,
    TokenInvalid,
    Aborted,
    Failed,
}

pub struct Engine {
    store: Store,
    api: GatedSpotify,
    notifications: NotificationQueue,
    config: EngineConfig,
    cycle_lock: Mutex<()>,
    cycles_run: AtomicU64,
}

impl Engine {
    pub fn new(store: Store, api: GatedSpotify, notifications: NotificationQueue, config: EngineConfig) -> Self {
        Self {
            store,
            api,
            notifications,
            config,
            cycle_lock: Mutex::new(()),
            cycles_run: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn api(&self) -> &GatedSpotify {
        &self.api
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles_run.load(Ordering::SeqCst)
    }

    /// Runs one cycle now. `None` when another cycle is already running.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Same as [`Engine::run_cycle`] with an explicit clock for removal
    /// deadlines.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Option<CycleReport> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            info!("Cycle already running, ignoring trigger");
            return None;
        };
        Some(self.cycle(now).await)
    }

    /// Remote sync on demand, for one playlist or all of them. Shares the
    /// cycle guard.
    pub async fn run_sync(&self, only: Option<&str>) -> Option<SyncReport> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            info!("Cycle already running, ignoring sync request");
            return None;
        };
        let abort = AtomicBool::new(false);
        Some(self.sync_all(only, Utc::now(), &abort).await)
    }

    /// Cycles on a fixed interval until `shutdown` resolves. A panicking
    /// cycle is logged and the loop carries on.
    pub async fn run_forever<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Scheduler started, polling every {:?}", self.config.poll_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let engine = Arc::clone(&self);
                    match tokio::spawn(async move { engine.run_cycle().await }).await {
                        Ok(Some(_)) => {}
                        Ok(None) => debug!("Tick skipped, previous cycle still running"),
                        Err(e) => error!("Cycle crashed: {}", e),
                    }
                }
            }
        }
    }

    async fn cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let cycle_no = self.cycles_run.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = CycleReport::new();
        let abort = AtomicBool::new(false);

        let users = match self.store.eligible_users().await {
            Ok(users) => users,
            Err(e) => {
                error!("Cycle {}: cannot list users: {}", cycle_no, e);
                report.user_failures += 1;
                return report;
            }
        };
        debug!("Cycle {}: polling {} users", cycle_no, users.len());

        let outcomes: Vec<UserOutcome> = stream::iter(users)
            .map(|user| self.poll_user(user, &abort))
            .buffer_unordered(self.config.user_concurrency.max(1))
            .collect()
            .await;

        let mut touched = BTreeSet::new();
        for outcome in outcomes {
            match outcome {
                UserOutcome::Polled(recorded) => {
                    report.users_polled += 1;
                    report.listens_recorded += recorded.listens;
                    report.skips_detected += recorded.skips;
                    report.reactions_inferred += recorded.reactions;
                    touched.extend(recorded.touched);
                }
                UserOutcome::TokenInvalid => report.tokens_invalidated += 1,
                UserOutcome::Failed => report.user_failures += 1,
                UserOutcome::Skipped | UserOutcome::Aborted => {}
            }
        }

        match self.store.due_track_ids(now).await {
            Ok(due) => touched.extend(due),
            Err(e) => {
                warn!("Cycle {}: cannot list due tracks: {}", cycle_no, e);
                report.track_failures += 1;
            }
        }

        if !touched.is_empty() {
            let ids: Vec<i64> = touched.into_iter().collect();
            let reconciled = Reconciler::new(self.store.clone(), self.api.clone(), self.notifications.clone())
                .reconcile(&ids, now, &abort)
                .await;
            report.tracks_removed += reconciled.removed;
            report.tracks_archived += reconciled.archived;
            report.tracks_scheduled += reconciled.scheduled;
            report.track_failures += reconciled.failures;
            report.remote_failures += reconciled.remote_failures;
        }

        if cycle_no % self.config.sync_every_cycles.max(1) == 0 && !abort.load(Ordering::SeqCst) {
            let synced = self.sync_all(None, now, &abort).await;
            report.synced = true;
            report.drift_inserted += synced.inserted;
            report.drift_removed += synced.removed;
            report.remote_retries += synced.retried;
            report.remote_failures += synced.remote_failures;
        }

        report.aborted = abort.load(Ordering::SeqCst);
        info!("Cycle {}: {} (budget {} in window)", cycle_no, report, self.api.budget().in_window());
        report
    }

    async fn poll_user(&self, user: User, abort: &AtomicBool) -> UserOutcome {
        if abort.load(Ordering::SeqCst) {
            return UserOutcome::Skipped;
        }
        let Some(token) = user.access_token.clone() else {
            return UserOutcome::Skipped;
        };

        match self.poll_user_inner(&user, &token).await {
            Ok(recorded) => UserOutcome::Polled(recorded),
            Err(PollError::Api(ApiError::TokenInvalid)) => {
                warn!("Token of {} rejected, flagging for re-authentication", user.id);
                if let Err(e) = self.store.mark_token_invalid(&user.id).await {
                    warn!("Could not flag token of {}: {}", user.id, e);
                }
                UserOutcome::TokenInvalid
            }
            Err(PollError::Api(e)) if e.aborts_cycle() => {
                if !abort.swap(true, Ordering::SeqCst) {
                    warn!("Stopping Spotify calls for this cycle: {}", e);
                }
                UserOutcome::Aborted
            }
            Err(e) => {
                warn!("Polling {} failed: {}", user.id, e);
                UserOutcome::Failed
            }
        }
    }

    async fn poll_user_inner(&self, user: &User, token: &str) -> Result<Recorded, PollError> {
        let mut cursor = self.store.load_cursor(&user.id).await?;
        let fetched = fetch_playback(&self.api, token, cursor.poll_cursor).await?;

        let mut observations: Vec<Observation> = fetched.finished.iter().map(Observation::finished).collect();
        let (tracked, mut live) = detector::advance(
            cursor.tracked.as_ref(),
            fetched.current.as_ref(),
            self.config.thresholds,
        );
        observations.append(&mut live);

        let recorded = detector::record(&self.store, user, &observations).await?;

        cursor.tracked = tracked;
        cursor.poll_cursor = fetched.next_poll_cursor;
        if !self.store.save_cursor(&user.id, &cursor).await? {
            warn!("Playback cursor of {} changed underneath this cycle, keeping theirs", user.id);
        }
        Ok(recorded)
    }

    async fn sync_all(&self, only: Option<&str>, now: DateTime<Utc>, abort: &AtomicBool) -> SyncReport {
        let mut total = SyncReport::default();
        let playlists = match self.store.playlists().await {
            Ok(playlists) => playlists,
            Err(e) => {
                warn!("Remote sync skipped, cannot list playlists: {}", e);
                total.remote_failures += 1;
                return total;
            }
        };

        for playlist in playlists.iter().filter(|p| only.map_or(true, |id| p.id == id)) {
            if abort.load(Ordering::SeqCst) {
                break;
            }
            match sync_playlist(&self.store, &self.api, playlist, now).await {
                Ok(report) => {
                    total.inserted += report.inserted;
                    total.removed += report.removed;
                    total.retried += report.retried;
                    total.remote_failures += report.remote_failures;
                }
                Err(e) => {
                    if e.aborts_cycle() {
                        abort.store(true, Ordering::SeqCst);
                    }
                    if let SyncError::MissingOwnerToken(_) = e {
                        debug!("Skipping sync of '{}': {}", playlist.name, e);
                    } else {
                        warn!("Sync of '{}' failed: {}", playlist.name, e);
                        total.remote_failures += 1;
                    }
                }
            }
        }
        total
    }
}
