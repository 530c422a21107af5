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

//! Process-wide admission control for Spotify API calls.
//!
//! Spotify enforces its limits per application, so every caller shares one
//! [`RateBudget`] regardless of which user or endpoint it is working for.

use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("API call budget exhausted (waited {waited_ms} ms)")]
pub struct BudgetExceeded {
    pub waited_ms: u64,
}

/// Ceiling of `max_calls` per rolling `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetConfig {
    pub max_calls: usize,
    pub window: Duration,
}

impl BudgetConfig {
    pub const fn standard() -> Self {
        Self {
            max_calls: 300,
            window: Duration::from_secs(30),
        }
    }

    /// For apps still in Spotify's development mode.
    pub const fn constrained() -> Self {
        Self {
            max_calls: 50,
            window: Duration::from_secs(30),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self::standard()
    }
}

pub struct RateBudget {
    config: BudgetConfig,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            calls: Mutex::new(VecDeque::with_capacity(config.max_calls)),
        }
    }

    pub fn config(&self) -> BudgetConfig {
        self.config
    }

    /// Admits `cost` calls right now if the window has room for them.
    pub fn try_consume(&self, cost: usize) -> bool {
        let now = Instant::now();
        let mut calls = self.lock();
        Self::prune(&mut calls, now, self.config.window);

        if calls.len() + cost > self.config.max_calls {
            return false;
        }
        calls.extend(std::iter::repeat(now).take(cost));
        true
    }

    /// Waits until `cost` calls fit in the window.
    ///
    /// Slots only free up as time passes, so when the next release lies beyond
    /// `max_wait` this gives up immediately instead of sleeping for nothing.
    pub async fn wait_for_budget(&self, cost: usize, max_wait: Duration) -> Result<(), BudgetExceeded> {
        let started = Instant::now();

        if cost > self.config.max_calls {
            return Err(BudgetExceeded { waited_ms: 0 });
        }

        loop {
            if self.try_consume(cost) {
                return Ok(());
            }

            let waited = started.elapsed();
            let release_in = self.release_in(cost);
            if waited + release_in > max_wait {
                debug!(
                    "Budget wait would exceed {:?} ({} calls in window)",
                    max_wait,
                    self.in_window()
                );
                return Err(BudgetExceeded {
                    waited_ms: waited.as_millis() as u64,
                });
            }

            trace!("Budget full, sleeping {:?}", release_in);
            tokio::time::sleep(release_in).await;
        }
    }

    /// Drops timestamps that left the window and returns how many went.
    pub fn sweep(&self) -> usize {
        let mut calls = self.lock();
        let before = calls.len();
        Self::prune(&mut calls, Instant::now(), self.config.window);
        before - calls.len()
    }

    pub fn in_window(&self) -> usize {
        let mut calls = self.lock();
        Self::prune(&mut calls, Instant::now(), self.config.window);
        calls.len()
    }

    /// Periodically sweeps the window until the budget itself is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let budget: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(budget) = budget.upgrade() else {
                    break;
                };
                let swept = budget.sweep();
                if swept > 0 {
                    trace!("Swept {} expired budget entries", swept);
                }
            }
        })
    }

    /// Time until enough of the oldest entries expire to admit `cost` calls.
    fn release_in(&self, cost: usize) -> Duration {
        let now = Instant::now();
        let calls = self.lock();
        let must_expire = (calls.len() + cost).saturating_sub(self.config.max_calls);
        match must_expire.checked_sub(1).and_then(|idx| calls.get(idx)) {
            Some(&stamp) => (stamp + self.config.window)
                .saturating_duration_since(now)
                .max(Duration::from_millis(1)),
            None => Duration::from_millis(1),
        }
    }

    fn prune(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&oldest) = calls.front() {
            if now.duration_since(oldest) >= window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        // The deque stays consistent even if a holder panicked.
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
