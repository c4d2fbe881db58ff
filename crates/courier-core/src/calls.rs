use crate::config::MAX_CALL_NOTIFICATION_GROUPS;
use courier_api::ids::{CallId, DialogId, NotificationGroupId, NotificationId};
use std::collections::{BTreeSet, HashMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveCallNotification {
    pub call_id: CallId,
    pub notification_id: NotificationId,
}

/// Outcome of reserving a call group for a dialog.
#[derive(Debug, PartialEq, Eq)]
pub enum CallGroupSlot {
    Existing(NotificationGroupId),
    Fresh(NotificationGroupId),
    /// The ring was full: the returned group was taken from the named dialog,
    /// whose notifications must be removed before the group is reused.
    Evicted {
        group_id: NotificationGroupId,
        from_dialog_id: DialogId,
    },
}

/// Fixed pool of group ids reserved for call notifications. Ids in the pool
/// never return to the general allocator, so a call group id can never clash
/// with a message group.
#[derive(Default)]
pub struct CallNotificationRing {
    available: BTreeSet<NotificationGroupId>,
    /// Assignment order, least recently used first.
    assignments: Vec<(DialogId, NotificationGroupId)>,
    active: HashMap<DialogId, Vec<ActiveCallNotification>>,
}

impl CallNotificationRing {
    /// True when reserving a slot for the dialog would grow the ring, so the
    /// caller must pass a freshly allocated id to `group_for`.
    pub fn would_allocate(&self, dialog_id: DialogId) -> bool {
        self.assignments.iter().all(|(d, _)| *d != dialog_id)
            && self.available.is_empty()
            && self.assignments.len() < MAX_CALL_NOTIFICATION_GROUPS
    }

    pub fn group_for(
        &mut self,
        dialog_id: DialogId,
        mut allocate: impl FnMut() -> NotificationGroupId,
    ) -> CallGroupSlot {
        if let Some(position) = self.assignments.iter().position(|(d, _)| *d == dialog_id) {
            let (_, group_id) = self.assignments.remove(position);
            self.assignments.push((dialog_id, group_id));
            return CallGroupSlot::Existing(group_id);
        }
        if let Some(&group_id) = self.available.iter().next() {
            self.available.remove(&group_id);
            self.assignments.push((dialog_id, group_id));
            return CallGroupSlot::Fresh(group_id);
        }
        if self.assignments.len() < MAX_CALL_NOTIFICATION_GROUPS {
            let group_id = allocate();
            self.assignments.push((dialog_id, group_id));
            return CallGroupSlot::Fresh(group_id);
        }
        let (from_dialog_id, group_id) = self.assignments.remove(0);
        self.active.remove(&from_dialog_id);
        self.assignments.push((dialog_id, group_id));
        CallGroupSlot::Evicted {
            group_id,
            from_dialog_id,
        }
    }

    pub fn group_of(&self, dialog_id: DialogId) -> Option<NotificationGroupId> {
        self.assignments
            .iter()
            .find(|(d, _)| *d == dialog_id)
            .map(|(_, group_id)| *group_id)
    }

    pub fn is_call_group(&self, group_id: NotificationGroupId) -> bool {
        self.available.contains(&group_id)
            || self.assignments.iter().any(|(_, g)| *g == group_id)
    }

    pub fn push_active(&mut self, dialog_id: DialogId, notification: ActiveCallNotification) {
        self.active.entry(dialog_id).or_default().push(notification);
    }

    pub fn active_count(&self, dialog_id: DialogId) -> usize {
        self.active.get(&dialog_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Oldest active call notification of the dialog, dropped to make room.
    pub fn pop_oldest_active(&mut self, dialog_id: DialogId) -> Option<ActiveCallNotification> {
        let list = self.active.get_mut(&dialog_id)?;
        if list.is_empty() {
            return None;
        }
        Some(list.remove(0))
    }

    pub fn remove_active(
        &mut self,
        dialog_id: DialogId,
        call_id: CallId,
    ) -> Option<ActiveCallNotification> {
        let list = self.active.get_mut(&dialog_id)?;
        let position = list.iter().position(|n| n.call_id == call_id)?;
        Some(list.remove(position))
    }

    /// Returns the dialog's group to the free set once its last notification
    /// is gone.
    pub fn release_if_idle(&mut self, dialog_id: DialogId) -> Option<NotificationGroupId> {
        if self.active_count(dialog_id) > 0 {
            return None;
        }
        self.active.remove(&dialog_id);
        let position = self.assignments.iter().position(|(d, _)| *d == dialog_id)?;
        let (_, group_id) = self.assignments.remove(position);
        self.available.insert(group_id);
        Some(group_id)
    }

    pub fn clear(&mut self) {
        for (_, group_id) in self.assignments.drain(..) {
            self.available.insert(group_id);
        }
        self.active.clear();
    }
}
