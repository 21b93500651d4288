//! Notification drafts emitted by the workflows, and the dispatcher that
//! persists them once the business change is committed.
//!
//! Delivery is best effort: [`NotificationFanout::dispatch`] logs and drops
//! failures so that a broken notification store never undoes or fails a
//! committed transition.
use chrono::Utc;

use crate::error::CoreResult;
use crate::store::Store;
use crate::types::TimeStamp;
use crate::utils::{self, prefix};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum NotificationKind {
    #[n(0)]
    RequestCreated,
    #[n(1)]
    RequestAccepted,
    #[n(2)]
    RequestStarted,
    #[n(3)]
    RequestCancelled,
    #[n(4)]
    RequestCompleted,
    #[n(5)]
    StatusUpdatePosted,
    #[n(6)]
    StatusUpdateApproved,
    #[n(7)]
    StatusUpdateRejected,
    #[n(8)]
    ServiceAdded,
    #[n(9)]
    ServiceFinished,
    #[n(10)]
    ServiceRemoved,
    #[n(11)]
    PaymentRecorded,
    #[n(12)]
    ServiceReopened,
}

impl NotificationKind {
    pub fn title(self) -> &'static str {
        match self {
            NotificationKind::RequestCreated => "New service request",
            NotificationKind::RequestAccepted => "Request accepted",
            NotificationKind::RequestStarted => "Work started",
            NotificationKind::RequestCancelled => "Request cancelled",
            NotificationKind::RequestCompleted => "Request completed",
            NotificationKind::StatusUpdatePosted => "New status update",
            NotificationKind::StatusUpdateApproved => "Status update approved",
            NotificationKind::StatusUpdateRejected => "Status update rejected",
            NotificationKind::ServiceAdded => "Service added",
            NotificationKind::ServiceFinished => "Service finished",
            NotificationKind::ServiceRemoved => "Service removed",
            NotificationKind::PaymentRecorded => "Payment updated",
            NotificationKind::ServiceReopened => "Service reopened",
        }
    }
}

/// A notification that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub sender_id: String,
    pub receiver_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn new(
        sender_id: &str,
        receiver_id: &str,
        kind: NotificationKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            kind,
            title: kind.title().to_string(),
            message: message.into(),
        }
    }
}

/// Result of a workflow step together with the notices it emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub value: T,
    pub notices: Vec<Notice>,
}

impl<T> Outcome<T> {
    pub fn new(value: T, notices: Vec<Notice>) -> Self {
        Self { value, notices }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Notification {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub sender_id: String,
    #[n(2)]
    pub receiver_id: String,
    #[n(3)]
    pub kind: NotificationKind,
    #[n(4)]
    pub title: String,
    #[n(5)]
    pub message: String,
    #[n(6)]
    pub read: bool,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
}

/// Which of a receiver's notifications a bulk operation touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Ids(Vec<String>),
    All,
}

impl Selection {
    fn contains(&self, id: &str) -> bool {
        match self {
            Selection::Ids(ids) => ids.iter().any(|i| i == id),
            Selection::All => true,
        }
    }
}

#[derive(Clone)]
pub struct NotificationFanout {
    store: Store,
}

impl NotificationFanout {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Persists a single notification.
    pub fn notify(&self, notice: Notice) -> CoreResult<Notification> {
        let notification = Notification {
            id: utils::new_id(prefix::NOTIFICATION)?,
            sender_id: notice.sender_id,
            receiver_id: notice.receiver_id,
            kind: notice.kind,
            title: notice.title,
            message: notice.message,
            read: false,
            created_at: TimeStamp::new(),
        };
        self.store.put_notification(&notification)?;
        Ok(notification)
    }

    /// Persists every notice, swallowing failures. Returns how many were stored.
    pub fn dispatch(&self, notices: Vec<Notice>) -> usize {
        let mut stored = 0;
        for notice in notices {
            let receiver = notice.receiver_id.clone();
            match self.notify(notice) {
                Ok(_) => stored += 1,
                Err(e) => log::warn!("dropped notification for {receiver}: {e}"),
            }
        }
        stored
    }

    /// A receiver's notifications, oldest first.
    pub fn list(&self, receiver_id: &str) -> CoreResult<Vec<Notification>> {
        self.store.notifications_of(receiver_id)
    }

    pub fn unread_count(&self, receiver_id: &str) -> CoreResult<usize> {
        Ok(self.list(receiver_id)?.iter().filter(|n| !n.read).count())
    }

    fn selected(&self, receiver_id: &str, selection: &Selection) -> CoreResult<Vec<String>> {
        Ok(self
            .list(receiver_id)?
            .into_iter()
            .filter(|n| selection.contains(&n.id))
            .map(|n| n.id)
            .collect())
    }

    /// Marks the selected notifications of `receiver_id` as read. Ids that
    /// belong to someone else are ignored.
    pub fn mark_read(&self, receiver_id: &str, selection: &Selection) -> CoreResult<usize> {
        let ids = self.selected(receiver_id, selection)?;
        self.store.mark_notifications_read(receiver_id, &ids)
    }

    /// Deletes the selected notifications of `receiver_id`.
    pub fn delete(&self, receiver_id: &str, selection: &Selection) -> CoreResult<usize> {
        let ids = self.selected(receiver_id, selection)?;
        self.store.delete_notifications(receiver_id, &ids)
    }
}
