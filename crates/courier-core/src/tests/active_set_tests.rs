use super::{fast_config, message_kind, new_manager, CaptureBridge};
use crate::NotificationManager;
use courier_api::ids::{DialogId, NotificationGroupId, NotificationId};
use courier_api::types::NotificationGroupType;
use courier_api::updates::Update;
use courier_storage::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

async fn add_and_flush(
    manager: &NotificationManager,
    dialog: i64,
    date: i32,
    message: i64,
) -> (NotificationGroupId, NotificationId) {
    let group = manager.get_next_notification_group_id().await;
    let id = manager.get_next_notification_id().await;
    manager
        .add_notification(
            group,
            NotificationGroupType::Messages,
            DialogId::new(dialog),
            date,
            DialogId::new(dialog),
            false,
            1,
            id,
            message_kind(dialog, message),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    (group, id)
}

#[tokio::test(start_paused = true)]
async fn lowest_key_is_evicted_when_a_newer_group_flushes() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(2, 10), bridge.clone(), store).await;
    let (group_a, id_a) = add_and_flush(&manager, 1, 100, 1).await;
    let (group_b, _) = add_and_flush(&manager, 2, 200, 2).await;
    bridge.take_updates();
    let (group_c, id_c) = add_and_flush(&manager, 3, 300, 3).await;
    let updates = bridge.take_group_updates();
    assert_eq!(updates.len(), 2, "one removal and one add");
    assert_eq!(updates[0].group_id, group_a);
    assert_eq!(updates[0].removed_notification_ids, vec![id_a]);
    assert_eq!(updates[0].total_count, 0);
    assert!(updates[0].added_notifications.is_empty());
    assert_eq!(updates[1].group_id, group_c);
    let added: Vec<NotificationId> =
        updates[1].added_notifications.iter().map(|n| n.id).collect();
    assert_eq!(added, vec![id_c]);
    assert!(updates.iter().all(|u| u.group_id != group_b));
}

#[tokio::test(start_paused = true)]
async fn snapshot_orders_groups_most_recent_first() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(3, 10), bridge.clone(), store).await;
    let (group_a, _) = add_and_flush(&manager, 1, 100, 1).await;
    let (group_b, _) = add_and_flush(&manager, 2, 300, 2).await;
    let (group_c, _) = add_and_flush(&manager, 3, 200, 3).await;
    let state = manager.get_current_state().await;
    let Some(Update::ActiveNotifications(snapshot)) = state.first() else {
        panic!("expected an active-notifications snapshot");
    };
    let order: Vec<NotificationGroupId> =
        snapshot.groups.iter().map(|g| g.group_id).collect();
    assert_eq!(order, vec![group_b, group_c, group_a]);
}

#[tokio::test(start_paused = true)]
async fn shrinking_group_count_max_deactivates_the_tail() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(3, 10), bridge.clone(), store).await;
    let (group_a, id_a) = add_and_flush(&manager, 1, 100, 1).await;
    let (_, _) = add_and_flush(&manager, 2, 200, 2).await;
    let (_, _) = add_and_flush(&manager, 3, 300, 3).await;
    bridge.take_updates();
    manager.on_notification_group_count_max_changed(2, true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let updates = bridge.take_group_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].group_id, group_a);
    assert_eq!(updates[0].removed_notification_ids, vec![id_a]);
}

#[tokio::test(start_paused = true)]
async fn growing_group_size_max_reveals_older_notifications() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(5, 2), bridge.clone(), store).await;
    let dialog = DialogId::new(8);
    let group = manager.get_next_notification_group_id().await;
    let mut ids = Vec::new();
    for message in 1..=4 {
        let id = manager.get_next_notification_id().await;
        ids.push(id);
        manager
            .add_notification(
                group,
                NotificationGroupType::Messages,
                dialog,
                100 + message,
                dialog,
                false,
                1,
                id,
                message_kind(8, message as i64),
            )
            .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    bridge.take_updates();
    manager.on_notification_group_size_max_changed(4).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let updates = bridge.take_group_updates();
    assert_eq!(updates.len(), 1);
    let added: Vec<NotificationId> =
        updates[0].added_notifications.iter().map(|n| n.id).collect();
    assert_eq!(added, vec![ids[0], ids[1]]);
    assert!(updates[0].removed_notification_ids.is_empty());
}

#[tokio::test(start_paused = true)]
async fn removal_slides_an_older_notification_into_the_window() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(5, 2), bridge.clone(), store).await;
    let dialog = DialogId::new(5);
    let group = manager.get_next_notification_group_id().await;
    let mut ids = Vec::new();
    for message in 1..=3 {
        let id = manager.get_next_notification_id().await;
        ids.push(id);
        manager
            .add_notification(
                group,
                NotificationGroupType::Messages,
                dialog,
                100 + message,
                dialog,
                false,
                1,
                id,
                message_kind(5, message as i64),
            )
            .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    bridge.take_updates();
    manager
        .remove_notification(group, ids[2], true, true)
        .await
        .expect("remove");
    let updates = bridge.take_group_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].removed_notification_ids, vec![ids[2]]);
    let added: Vec<NotificationId> =
        updates[0].added_notifications.iter().map(|n| n.id).collect();
    assert_eq!(added, vec![ids[0]]);
    assert_eq!(updates[0].total_count, 2);
}
