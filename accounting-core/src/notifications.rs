//! Deposit notification service
//!
//! A deposit stages an "allocation granted" notification in the same store
//! transaction that creates the allocation. Root deposits produce none.
//! Delivery is someone else's problem; recipients poll and acknowledge.

use crate::storage::{Sequence, Storage, StoreTxn};
use crate::types::{Actor, ActorAndProject, Allocation, DepositNotification, NotificationId};
use crate::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Records and serves deposit notifications
#[derive(Debug, Clone)]
pub struct DepositNotificationService {
    storage: Arc<Storage>,
}

impl DepositNotificationService {
    /// Create new service
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Stage a notification for a freshly granted allocation
    pub fn stage(
        &self,
        txn: &mut StoreTxn<'_>,
        allocation: &Allocation,
        now: DateTime<Utc>,
    ) -> Result<NotificationId> {
        let id = NotificationId(txn.next_id(Sequence::Notification)?);
        txn.put_notification(DepositNotification {
            id,
            owner: allocation.owner.clone(),
            category: allocation.category.clone(),
            allocation_id: allocation.id,
            balance: allocation.initial_balance,
            created_at: now,
            read: false,
        });
        tracing::debug!(notification_id = %id, allocation_id = %allocation.id, "Staged deposit notification");
        Ok(id)
    }

    /// Unread notifications visible to the caller, oldest first.
    ///
    /// Served from the unread index, so acknowledged history is never read.
    pub fn retrieve_notifications(&self, actor: &ActorAndProject) -> Result<Vec<DepositNotification>> {
        let unread = match actor.acting_owner() {
            Some(owner) => self.storage.unread_notifications_of(&owner)?,
            None => self.storage.unread_notifications()?,
        };
        Ok(unread
            .into_iter()
            .filter(|n| !n.read && is_visible(actor, n))
            .collect())
    }

    /// Stage acknowledgements, one outcome per id.
    ///
    /// Unknown ids, ids not visible to the caller, and already-read ids
    /// yield `false`, so repeating the call is harmless.
    pub fn mark_as_read(
        &self,
        txn: &mut StoreTxn<'_>,
        actor: &ActorAndProject,
        ids: &[NotificationId],
    ) -> Result<Vec<bool>> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let changed = match txn.notification(*id)? {
                Some(mut notification) if !notification.read && is_visible(actor, &notification) => {
                    notification.read = true;
                    txn.put_notification(notification);
                    true
                }
                _ => false,
            };
            outcomes.push(changed);
        }
        tracing::debug!(
            requested = ids.len(),
            changed = outcomes.iter().filter(|c| **c).count(),
            "Staged notification acknowledgements"
        );
        Ok(outcomes)
    }
}

fn is_visible(actor: &ActorAndProject, notification: &DepositNotification) -> bool {
    match &actor.actor {
        Actor::System => true,
        Actor::Provider(provider) => notification.category.provider == *provider,
        Actor::User(_) => actor.acting_owner().as_ref() == Some(&notification.owner),
    }
}
