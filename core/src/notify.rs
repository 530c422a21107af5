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

use crate::models::Notification;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
#[error("Notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Push/email delivery lives outside this crate.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_ids: &[String], notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log. Used when no delivery backend is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_ids: &[String], notification: &Notification) -> Result<(), NotifyError> {
        info!(
            "[notify] {} -> {}: {}",
            notification.title,
            user_ids.join(","),
            notification.body
        );
        Ok(())
    }
}

struct Outbound {
    user_ids: Vec<String>,
    notification: Notification,
}

/// Bounded fire-and-forget queue in front of a [`Notifier`].
///
/// `dispatch` never waits: when the queue is full the message is dropped and
/// logged, so a slow delivery backend cannot stall reconciliation.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<Outbound>,
}

impl NotificationQueue {
    pub fn spawn(notifier: Arc<dyn Notifier>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Outbound>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = notifier.notify(&job.user_ids, &job.notification).await {
                    warn!("Dropping notification '{}': {}", job.notification.title, e);
                }
            }
            debug!("Notification queue closed");
        });

        (Self { tx }, worker)
    }

    /// A queue that discards everything.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    pub fn dispatch(&self, user_ids: Vec<String>, notification: Notification) {
        if user_ids.is_empty() {
            return;
        }
        match self.tx.try_send(Outbound {
            user_ids,
            notification,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!("Notification queue full, dropping '{}'", job.notification.title);
            }
            Err(TrySendError::Closed(job)) => {
                debug!("Notifications disabled, skipping '{}'", job.notification.title);
            }
        }
    }
}
