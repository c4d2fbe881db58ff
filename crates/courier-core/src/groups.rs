use courier_api::ids::{DialogId, MessageId, NotificationGroupId, NotificationId};
use courier_api::types::{Notification, NotificationGroupType, NotificationType};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

/// Ranking key of a group. Groups order by last-notification date descending,
/// ties broken by group id descending, so iterating the store front to back
/// walks the most recently updated groups first. The dialog id rides along
/// for update construction and never decides the order on its own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NotificationGroupKey {
    pub last_notification_date: i32,
    pub group_id: NotificationGroupId,
    pub dialog_id: DialogId,
}

impl Ord for NotificationGroupKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .last_notification_date
            .cmp(&self.last_notification_date)
            .then(other.group_id.cmp(&self.group_id))
            .then(other.dialog_id.cmp(&self.dialog_id))
    }
}

impl PartialOrd for NotificationGroupKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug)]
pub struct PendingNotification {
    pub date: i32,
    pub settings_dialog_id: DialogId,
    pub is_silent: bool,
    pub notification_id: NotificationId,
    pub kind: NotificationType,
}

#[derive(Clone, Debug)]
pub struct NotificationGroup {
    pub kind: NotificationGroupType,
    pub total_count: i32,
    pub notifications: Vec<Notification>,
    pub pending_notifications: Vec<PendingNotification>,
    pub pending_flush_at: Option<Instant>,
    pub loaded_from_store: bool,
    pub loading_from_store: bool,
}

impl NotificationGroup {
    pub fn new(kind: NotificationGroupType) -> Self {
        Self {
            kind,
            total_count: 0,
            notifications: Vec::new(),
            pending_notifications: Vec::new(),
            pending_flush_at: None,
            loaded_from_store: false,
            loading_from_store: false,
        }
    }

    pub fn last_notification_id(&self) -> NotificationId {
        self.notifications
            .last()
            .map(|n| n.id)
            .unwrap_or_default()
    }

    pub fn last_notification_date(&self) -> i32 {
        self.notifications.last().map(|n| n.date).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.total_count == 0
            && self.notifications.is_empty()
            && self.pending_notifications.is_empty()
    }

    /// The suffix shown to the observer when the group is active.
    pub fn visible(&self, max_size: usize) -> &[Notification] {
        let start = self.notifications.len().saturating_sub(max_size);
        &self.notifications[start..]
    }

    pub fn visible_ids(&self, max_size: usize) -> Vec<NotificationId> {
        self.visible(max_size).iter().map(|n| n.id).collect()
    }

    pub fn message_ids(&self) -> Vec<MessageId> {
        let flushed = self.notifications.iter().filter_map(|n| n.message_id());
        let pending = self
            .pending_notifications
            .iter()
            .filter_map(|p| p.kind.message_ref().map(|m| m.message_id));
        flushed.chain(pending).collect()
    }

    pub fn contains_message(&self, message_id: MessageId) -> bool {
        self.message_ids().contains(&message_id)
    }
}

/// Ordered group map with a secondary index from group id to current key.
#[derive(Default)]
pub struct GroupStore {
    groups: BTreeMap<NotificationGroupKey, NotificationGroup>,
    keys: HashMap<NotificationGroupId, NotificationGroupKey>,
}

impl GroupStore {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn contains(&self, group_id: NotificationGroupId) -> bool {
        self.keys.contains_key(&group_id)
    }

    pub fn key_of(&self, group_id: NotificationGroupId) -> Option<NotificationGroupKey> {
        self.keys.get(&group_id).copied()
    }

    pub fn insert(&mut self, key: NotificationGroupKey, group: NotificationGroup) {
        debug_assert!(!self.keys.contains_key(&key.group_id));
        self.keys.insert(key.group_id, key);
        self.groups.insert(key, group);
    }

    pub fn get(&self, group_id: NotificationGroupId) -> Option<&NotificationGroup> {
        let key = self.keys.get(&group_id)?;
        self.groups.get(key)
    }

    pub fn get_mut(&mut self, group_id: NotificationGroupId) -> Option<&mut NotificationGroup> {
        let key = self.keys.get(&group_id)?;
        self.groups.get_mut(key)
    }

    pub fn remove(
        &mut self,
        group_id: NotificationGroupId,
    ) -> Option<(NotificationGroupKey, NotificationGroup)> {
        let key = self.keys.remove(&group_id)?;
        let group = self.groups.remove(&key)?;
        Some((key, group))
    }

    /// Atomic remove and reinsert under a new last-notification date.
    pub fn rekey(&mut self, group_id: NotificationGroupId, last_notification_date: i32) {
        let Some(old_key) = self.keys.get(&group_id).copied() else {
            return;
        };
        if old_key.last_notification_date == last_notification_date {
            return;
        }
        let Some(group) = self.groups.remove(&old_key) else {
            return;
        };
        let new_key = NotificationGroupKey {
            last_notification_date,
            ..old_key
        };
        self.keys.insert(group_id, new_key);
        self.groups.insert(new_key, group);
    }

    /// Most recently updated groups first.
    pub fn iter(&self) -> impl Iterator<Item = (&NotificationGroupKey, &NotificationGroup)> {
        self.groups.iter()
    }

    pub fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (&NotificationGroupKey, &mut NotificationGroup)> {
        self.groups.iter_mut()
    }

    pub fn group_ids(&self) -> Vec<NotificationGroupId> {
        self.groups.keys().map(|key| key.group_id).collect()
    }

    /// Group ids of the top `count` entries, the active prefix.
    pub fn active_ids(&self, count: usize) -> Vec<NotificationGroupId> {
        self.groups
            .keys()
            .take(count)
            .map(|key| key.group_id)
            .collect()
    }

    /// The lowest key still inside the active prefix.
    pub fn active_boundary_key(&self, count: usize) -> Option<NotificationGroupKey> {
        if count == 0 {
            return None;
        }
        self.groups.keys().nth(count - 1).copied()
    }

    pub fn is_active(&self, group_id: NotificationGroupId, count: usize) -> bool {
        let Some(key) = self.keys.get(&group_id) else {
            return false;
        };
        self.groups.range(..=*key).count() <= count
    }
}
