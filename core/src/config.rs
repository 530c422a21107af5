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

use crate::budget::BudgetConfig;
use crate::detector::Thresholds;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Engine tuning knobs. Per-playlist policies and per-user opt-ins live in
/// the store, not here.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub budget: BudgetConfig,
    /// How long a single call may wait for budget before the cycle aborts.
    pub budget_max_wait: Duration,
    pub user_concurrency: usize,
    /// Remote sync runs on every Nth cycle.
    pub sync_every_cycles: u64,
    pub thresholds: Thresholds,
    pub notification_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            budget: BudgetConfig::standard(),
            budget_max_wait: Duration::from_secs(10),
            user_concurrency: 4,
            sync_every_cycles: 10,
            thresholds: Thresholds::default(),
            notification_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `SWAPIFY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(constrained) = parse::<bool, _>(&lookup, "SWAPIFY_CONSTRAINED_BUDGET")? {
            if constrained {
                config.budget = BudgetConfig::constrained();
            }
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SWAPIFY_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(calls) = parse(&lookup, "SWAPIFY_BUDGET_MAX_CALLS")? {
            config.budget.max_calls = calls;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SWAPIFY_BUDGET_WINDOW_MS")? {
            config.budget.window = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SWAPIFY_BUDGET_MAX_WAIT_MS")? {
            config.budget_max_wait = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "SWAPIFY_USER_CONCURRENCY")? {
            config.user_concurrency = n;
        }
        if let Some(n) = parse(&lookup, "SWAPIFY_SYNC_EVERY_CYCLES")? {
            config.sync_every_cycles = n;
        }
        if let Some(ratio) = parse(&lookup, "SWAPIFY_COMPLETE_RATIO")? {
            config.thresholds.complete_ratio = ratio;
        }
        if let Some(ratio) = parse(&lookup, "SWAPIFY_SKIP_RATIO")? {
            config.thresholds.skip_ratio = ratio;
        }
        if let Some(n) = parse(&lookup, "SWAPIFY_NOTIFICATION_CAPACITY")? {
            config.notification_capacity = n;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Inconsistent("poll interval must be positive".into()));
        }
        if self.budget.max_calls == 0 || self.budget.window.is_zero() {
            return Err(ConfigError::Inconsistent("rate budget must admit at least one call".into()));
        }
        if self.user_concurrency == 0 {
            return Err(ConfigError::Inconsistent("user concurrency must be at least 1".into()));
        }
        if self.sync_every_cycles == 0 {
            return Err(ConfigError::Inconsistent("sync cadence must be at least 1".into()));
        }
        let Thresholds {
            complete_ratio,
            skip_ratio,
        } = self.thresholds;
        if !(0.0 < skip_ratio && skip_ratio < complete_ratio && complete_ratio <= 1.0) {
            return Err(ConfigError::Inconsistent(format!(
                "thresholds must satisfy 0 < skip ({}) < complete ({}) <= 1",
                skip_ratio, complete_ratio
            )));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}
