//! Transient, dismissible user notifications.
//!
//! Every failure path in the workflows ends here so nothing is swallowed.

use crate::error::EscrowError;
use crate::types::CallFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub level: NotificationLevel,
    /// Error name for failures, short headline otherwise.
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Active notifications kept before the oldest is dropped.
pub const DEFAULT_CAPACITY: usize = 20;

/// Notification center shared by the view-models of one client session.
pub struct NotificationCenter {
    active: Mutex<VecDeque<Notification>>,
    capacity: usize,
    sender: broadcast::Sender<Notification>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Keep at most `capacity` active notifications (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(64);
        Self {
            active: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            sender,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(
        &self,
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Uuid {
        let notification = Notification {
            id: Uuid::new_v4(),
            level,
            title: title.into(),
            message: message.into(),
            created_at: Utc::now(),
        };
        let id = notification.id;

        {
            let mut active = self.lock();
            while active.len() >= self.capacity {
                active.pop_front();
            }
            active.push_back(notification.clone());
        }
        // No subscribers is fine; the notification stays in the active list.
        let _ = self.sender.send(notification);
        id
    }

    pub fn error(&self, err: &EscrowError) -> Uuid {
        self.failure(&CallFailure::from(err))
    }

    pub fn failure(&self, failure: &CallFailure) -> Uuid {
        self.push(
            NotificationLevel::Error,
            failure.name.clone(),
            failure.message.clone(),
        )
    }

    pub fn success(&self, title: impl Into<String>, message: impl Into<String>) -> Uuid {
        self.push(NotificationLevel::Success, title, message)
    }

    /// Returns `false` if the notification was already dismissed.
    pub fn dismiss(&self, id: Uuid) -> bool {
        let mut active = self.lock();
        let before = active.len();
        active.retain(|n| n.id != id);
        active.len() != before
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Active notifications, oldest first.
    pub fn active(&self) -> Vec<Notification> {
        self.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<Notification> {
        self.lock().back().cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Notification>> {
        // A poisoned list is still a valid list of notifications.
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallErrorKind;

    #[test]
    fn push_and_dismiss() {
        let center = NotificationCenter::new();
        let first = center.success("Created", "escrow deployed");
        let second = center.error(&EscrowError::Connection("no wallet".into()));

        assert_eq!(center.active().len(), 2);
        assert!(center.dismiss(first));
        assert!(!center.dismiss(first));

        let remaining = center.active();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second);
        assert_eq!(remaining[0].title, "ConnectionError");
        assert_eq!(remaining[0].message, "no wallet");
    }

    #[test]
    fn call_errors_are_titled_by_kind() {
        let center = NotificationCenter::new();
        center.error(&EscrowError::call(CallErrorKind::Reverted, "not judge"));
        let latest = center.latest().unwrap();
        assert_eq!(latest.level, NotificationLevel::Error);
        assert_eq!(latest.title, "ContractRevertError");
    }

    #[test]
    fn oldest_notifications_are_dropped_at_capacity() {
        let center = NotificationCenter::with_capacity(3);
        for attempt in 0..10 {
            center.error(&EscrowError::Connection(format!("attempt {}", attempt)));
        }

        let messages: Vec<_> = center.active().into_iter().map(|n| n.message).collect();
        assert_eq!(messages, vec!["attempt 7", "attempt 8", "attempt 9"]);
        assert_eq!(NotificationCenter::new().capacity(), DEFAULT_CAPACITY);
    }

    #[tokio::test]
    async fn subscribers_receive_notifications() {
        let center = NotificationCenter::new();
        let mut receiver = center.subscribe();
        let id = center.push(NotificationLevel::Info, "Uploading", "asset.pdf");

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.id, id);
    }
}
