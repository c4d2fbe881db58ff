use courier_api::ids::NotificationId;
use courier_api::types::Notification;
use courier_api::updates::{Update, UpdateNotification, UpdateNotificationGroup};

/// One update waiting in a group's outbound queue.
#[derive(Clone, Debug)]
pub enum PendingUpdate {
    Group(UpdateNotificationGroup),
    Edit(UpdateNotification),
}

/// Merges a group's queued updates into the minimal sequence the observer
/// needs. An add and a remove of the same id inside the window cancel each
/// other, an edit of a not-yet-delivered add collapses into the add, and
/// removes of already-delivered ids keep their relative order.
///
/// `delivered_total_count` is what the observer currently believes; a merged
/// group update that changes nothing against it is dropped.
pub fn coalesce(
    updates: Vec<PendingUpdate>,
    delivered_total_count: Option<i32>,
) -> Vec<Update> {
    let mut merged: Option<UpdateNotificationGroup> = None;
    let mut added: Vec<Notification> = Vec::new();
    let mut removed: Vec<NotificationId> = Vec::new();
    let mut edits: Vec<UpdateNotification> = Vec::new();

    for update in updates {
        match update {
            PendingUpdate::Group(group_update) => {
                for id in &group_update.removed_notification_ids {
                    if let Some(position) = added.iter().position(|n| n.id == *id) {
                        added.remove(position);
                    } else if !removed.contains(id) {
                        removed.push(*id);
                    }
                }
                for notification in group_update.added_notifications.iter() {
                    removed.retain(|id| *id != notification.id);
                    if let Some(existing) =
                        added.iter_mut().find(|n| n.id == notification.id)
                    {
                        *existing = notification.clone();
                    } else {
                        added.push(notification.clone());
                    }
                }
                merged = Some(group_update);
            }
            PendingUpdate::Edit(edit) => {
                if let Some(existing) =
                    added.iter_mut().find(|n| n.id == edit.notification.id)
                {
                    *existing = edit.notification;
                } else if let Some(existing) = edits
                    .iter_mut()
                    .find(|e| e.notification.id == edit.notification.id)
                {
                    *existing = edit;
                } else {
                    edits.push(edit);
                }
            }
        }
    }

    let mut result = Vec::new();
    if let Some(mut group_update) = merged {
        added.sort_by_key(|n| n.id);
        group_update.added_notifications = added;
        group_update.removed_notification_ids = removed;
        let unchanged = group_update.added_notifications.is_empty()
            && group_update.removed_notification_ids.is_empty()
            && delivered_total_count == Some(group_update.total_count);
        if !unchanged {
            result.push(Update::NotificationGroup(group_update));
        }
    }
    edits.sort_by_key(|e| e.notification.id);
    result.extend(edits.into_iter().map(Update::Notification));
    result
}
