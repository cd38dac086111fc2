use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::{sync::broadcast, task::JoinHandle, time};
use uuid::Uuid;

use crate::ports::{Clock, NotificationAction, NotificationId, NotificationScheduler};
use crate::session::AlarmTime;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// A notification whose time has come.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: NotificationId,
    pub title: String,
}

struct Pending {
    title: String,
    handle: JoinHandle<()>,
}

/// In-process stand-in for the OS notification center: each notification is
/// a one-shot tokio task that announces itself at the next occurrence of its
/// time of day. The user's response is fed back with
/// [`trigger_action`](Self::trigger_action).
pub struct LocalNotificationScheduler {
    clock: Arc<dyn Clock>,
    pending: Arc<Mutex<HashMap<NotificationId, Pending>>>,
    actions_tx: broadcast::Sender<NotificationAction>,
    deliveries_tx: broadcast::Sender<Delivery>,
}

impl LocalNotificationScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            pending: Arc::new(Mutex::new(HashMap::new())),
            actions_tx: broadcast::channel(16).0,
            deliveries_tx: broadcast::channel(16).0,
        }
    }

    pub fn deliveries(&self) -> broadcast::Receiver<Delivery> {
        self.deliveries_tx.subscribe()
    }

    /// Notifications scheduled and not yet cancelled, delivered ones included
    /// until acted on.
    pub fn pending_ids(&self) -> Vec<NotificationId> {
        self.pending
            .lock()
            .map(|pending| pending.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver the user's default action for `id`. Returns false when no such
    /// notification is pending.
    pub fn trigger_action(&self, id: &NotificationId) -> bool {
        let removed = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(id));
        let Some(opened) = removed else {
            log_warn!("No pending notification {}", id.0);
            return false;
        };
        opened.handle.abort();
        log_info!("Notification {} opened", id.0);
        let _ = self.actions_tx.send(NotificationAction { id: id.clone() });
        true
    }
}

#[async_trait]
impl NotificationScheduler for LocalNotificationScheduler {
    async fn request_permission(&self) -> bool {
        true
    }

    async fn schedule_notification(&self, title: &str, at: AlarmTime) -> Result<NotificationId> {
        let id = NotificationId(Uuid::new_v4().to_string());
        let delay = at.delay_from(self.clock.now());

        let deliveries = self.deliveries_tx.clone();
        let delivery = Delivery {
            id: id.clone(),
            title: title.to_string(),
        };
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            log_info!("Delivering notification '{}'", delivery.title);
            let _ = deliveries.send(delivery);
        });

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| anyhow!("notification registry poisoned"))?;
        pending.insert(
            id.clone(),
            Pending {
                title: title.to_string(),
                handle,
            },
        );
        log_info!("Scheduled '{title}' for {at} ({}s from now)", delay.as_secs());
        Ok(id)
    }

    fn cancel_notification(&self, id: &NotificationId) {
        let removed = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(id));
        if let Some(pending) = removed {
            pending.handle.abort();
            log_info!("Cancelled notification '{}'", pending.title);
        }
    }

    fn actions(&self) -> broadcast::Receiver<NotificationAction> {
        self.actions_tx.subscribe()
    }
}

impl Drop for LocalNotificationScheduler {
    fn drop(&mut self) {
        if let Ok(pending) = self.pending.lock() {
            for entry in pending.values() {
                entry.handle.abort();
            }
        }
    }
}
