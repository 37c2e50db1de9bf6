//! Notification inbox.
//!
//! Holds notifications pushed by the notification hub or listed over REST,
//! deduplicated by id, and the unread badge count.
//!
//! # Invariants
//!
//! - An id appears at most once
//! - Status moves `NEW → READ` only
//! - `unread_count()` equals the number of `NEW` entries

use std::collections::BTreeMap;

use evsync_proto::{Notification, NotificationId, NotificationStatus};

/// Notifications in arrival order plus the unread count.
#[derive(Debug, Clone, Default)]
pub struct NotificationInbox {
    entries: Vec<Notification>,
    index: BTreeMap<NotificationId, usize>,
    unread: usize,
}

impl NotificationInbox {
    /// Create an empty inbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pushed notification.
    ///
    /// Returns false for an id already present.
    pub fn on_notification(&mut self, notification: Notification) -> bool {
        if self.index.contains_key(&notification.id) {
            return false;
        }

        if notification.status == NotificationStatus::New {
            self.unread += 1;
        }
        self.index.insert(notification.id.clone(), self.entries.len());
        self.entries.push(notification);
        true
    }

    /// Mark one notification read.
    ///
    /// Returns true if it was `NEW`. Unknown ids and repeated calls change
    /// nothing.
    pub fn mark_read(&mut self, id: &NotificationId) -> bool {
        let Some(entry) = self.index.get(id).and_then(|&position| self.entries.get_mut(position))
        else {
            return false;
        };
        if entry.status == NotificationStatus::Read {
            return false;
        }

        entry.status = NotificationStatus::Read;
        self.unread -= 1;
        true
    }

    /// Mark everything read. Returns the ids that changed.
    pub fn mark_all_read(&mut self) -> Vec<NotificationId> {
        let changed: Vec<NotificationId> = self
            .entries
            .iter_mut()
            .filter(|entry| entry.status == NotificationStatus::New)
            .map(|entry| {
                entry.status = NotificationStatus::Read;
                entry.id.clone()
            })
            .collect();
        self.unread = 0;
        changed
    }

    /// Merge a REST listing.
    ///
    /// Unknown ids are added, known ids may move to `READ` but never back.
    /// Returns true if the unread count changed.
    pub fn reconcile(&mut self, listing: Vec<Notification>) -> bool {
        let before = self.unread;

        for incoming in listing {
            let existing = self.index.get(&incoming.id).copied();
            match existing.and_then(|position| self.entries.get_mut(position)) {
                Some(entry) => {
                    if incoming.status == NotificationStatus::Read {
                        entry.status = NotificationStatus::Read;
                    }
                },
                None => {
                    self.index.insert(incoming.id.clone(), self.entries.len());
                    self.entries.push(incoming);
                },
            }
        }

        self.unread =
            self.entries.iter().filter(|entry| entry.status == NotificationStatus::New).count();
        self.unread != before
    }

    /// Number of `NEW` notifications.
    pub fn unread_count(&self) -> usize {
        self.unread
    }

    /// Look up one notification.
    pub fn get(&self, id: &NotificationId) -> Option<&Notification> {
        self.index.get(id).and_then(|&position| self.entries.get(position))
    }

    /// All notifications in arrival order.
    pub fn notifications(&self) -> &[Notification] {
        &self.entries
    }
}
