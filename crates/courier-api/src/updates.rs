use crate::ids::{DialogId, NotificationGroupId, NotificationId};
use crate::types::{Notification, NotificationGroupType};
use serde::{Deserialize, Serialize};

/// One coalesced state transition of a single notification group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateNotificationGroup {
    pub group_id: NotificationGroupId,
    pub kind: NotificationGroupType,
    pub chat_id: DialogId,
    pub notification_settings_chat_id: DialogId,
    pub is_silent: bool,
    pub total_count: i32,
    pub added_notifications: Vec<Notification>,
    pub removed_notification_ids: Vec<NotificationId>,
}

/// An in-place edit of a notification already shown to the observer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateNotification {
    pub group_id: NotificationGroupId,
    pub notification: Notification,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActiveNotificationGroup {
    pub group_id: NotificationGroupId,
    pub kind: NotificationGroupType,
    pub chat_id: DialogId,
    pub total_count: i32,
    pub notifications: Vec<Notification>,
}

/// Resubscription snapshot: every active group with its visible notifications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateActiveNotifications {
    pub groups: Vec<ActiveNotificationGroup>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateHavePendingNotifications {
    pub have_delayed_notifications: bool,
    pub have_unreceived_notifications: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum Update {
    NotificationGroup(UpdateNotificationGroup),
    Notification(UpdateNotification),
    ActiveNotifications(UpdateActiveNotifications),
    HavePendingNotifications(UpdateHavePendingNotifications),
}

impl Update {
    pub fn group_id(&self) -> Option<NotificationGroupId> {
        match self {
            Update::NotificationGroup(u) => Some(u.group_id),
            Update::Notification(u) => Some(u.group_id),
            _ => None,
        }
    }
}
