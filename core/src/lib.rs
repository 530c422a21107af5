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

pub mod actions;
pub mod auth;
pub mod budget;
pub mod config;
pub mod detector;
pub mod fetcher;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod reconciler;
pub mod spotify;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

// Re-export key items for convenience
pub use actions::{add_track, react, AdmissionError};
pub use budget::{BudgetConfig, BudgetExceeded, RateBudget};
pub use config::{ConfigError, EngineConfig};
pub use models::{CycleReport, SharedPlaylist, SharedTrack, SyncReport, User};
pub use notify::{LogNotifier, NotificationQueue, Notifier};
pub use orchestrator::Engine;
pub use spotify::{ApiError, GatedSpotify, RspotifyGateway, SpotifyApi};
pub use store::{Store, StoreError};
