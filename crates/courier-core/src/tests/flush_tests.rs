use super::{fast_config, message_kind, new_manager, settle, test_config, CaptureBridge};
use courier_api::ids::{DialogId, NotificationId};
use courier_api::types::NotificationGroupType;
use courier_api::updates::Update;
use courier_storage::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn pending_notifications_coalesce_into_one_update() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(test_config(5, 10), bridge.clone(), store).await;
    let dialog = DialogId::new(7);
    let group = manager.get_next_notification_group_id().await;
    let first = manager.get_next_notification_id().await;
    manager
        .add_notification(
            group,
            NotificationGroupType::Messages,
            dialog,
            100,
            dialog,
            false,
            1_500,
            first,
            message_kind(7, 1),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let second = manager.get_next_notification_id().await;
    manager
        .add_notification(
            group,
            NotificationGroupType::Messages,
            dialog,
            101,
            dialog,
            false,
            1_500,
            second,
            message_kind(7, 2),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(
        bridge.take_group_updates().is_empty(),
        "flush window has not elapsed yet"
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    let updates = bridge.take_group_updates();
    assert_eq!(updates.len(), 1);
    let update = &updates[0];
    assert_eq!(update.group_id, group);
    assert_eq!(update.chat_id, dialog);
    assert_eq!(update.total_count, 2);
    let added: Vec<NotificationId> = update.added_notifications.iter().map(|n| n.id).collect();
    assert_eq!(added, vec![first, second]);
    assert!(update.removed_notification_ids.is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_add_never_postpones_the_flush() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(test_config(5, 10), bridge.clone(), store).await;
    let dialog = DialogId::new(3);
    let group = manager.get_next_notification_group_id().await;
    let first = manager.get_next_notification_id().await;
    manager
        .add_notification(
            group,
            NotificationGroupType::Messages,
            dialog,
            100,
            dialog,
            false,
            200,
            first,
            message_kind(3, 1),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = manager.get_next_notification_id().await;
    manager
        .add_notification(
            group,
            NotificationGroupType::Messages,
            dialog,
            101,
            dialog,
            false,
            60_000,
            second,
            message_kind(3, 2),
        )
        .await;
    // The earlier deadline wins: flush at 1500ms from the first add.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let updates = bridge.take_group_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].added_notifications.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn recently_online_chat_uses_the_cloud_delay() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let config = test_config(5, 10);
    let manager = new_manager(config, bridge.clone(), store).await;
    let dialog = DialogId::new(4);
    bridge.set_online(dialog, crate::time::now_ms());
    let group = manager.get_next_notification_group_id().await;
    let id = manager.get_next_notification_id().await;
    manager
        .add_notification(
            group,
            NotificationGroupType::Messages,
            dialog,
            100,
            dialog,
            false,
            1,
            id,
            message_kind(4, 1),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert!(
        bridge.take_group_updates().is_empty(),
        "cloud delay of 30s applies to recently online chats"
    );
    tokio::time::sleep(Duration::from_millis(26_000)).await;
    assert_eq!(bridge.take_group_updates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn have_pending_notifications_tracks_both_phases() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(5, 10), bridge.clone(), store).await;
    let dialog = DialogId::new(9);
    let group = manager.get_next_notification_group_id().await;
    let id = manager.get_next_notification_id().await;
    manager
        .add_notification(
            group,
            NotificationGroupType::Messages,
            dialog,
            100,
            dialog,
            false,
            1,
            id,
            message_kind(9, 1),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let transitions: Vec<(bool, bool)> = bridge
        .take_updates()
        .into_iter()
        .filter_map(|update| match update {
            Update::HavePendingNotifications(u) => Some((
                u.have_delayed_notifications,
                u.have_unreceived_notifications,
            )),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![(true, false), (false, true), (false, false)]
    );
}

#[tokio::test(start_paused = true)]
async fn destroy_drops_state_and_later_ingress() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(5, 10), bridge.clone(), store).await;
    let dialog = DialogId::new(2);
    let group = manager.get_next_notification_group_id().await;
    let id = manager.get_next_notification_id().await;
    manager
        .add_notification(
            group,
            NotificationGroupType::Messages,
            dialog,
            100,
            dialog,
            false,
            1,
            id,
            message_kind(2, 1),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    bridge.take_updates();
    manager.destroy_all_notifications().await;
    let updates = bridge.take_group_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].removed_notification_ids, vec![id]);
    assert_eq!(updates[0].total_count, 0);
    let late = manager.get_next_notification_id().await;
    assert!(!late.is_valid());
    manager
        .add_notification(
            group,
            NotificationGroupType::Messages,
            dialog,
            200,
            dialog,
            false,
            1,
            NotificationId::new(99),
            message_kind(2, 9),
        )
        .await;
    settle().await;
    assert!(bridge.take_updates().is_empty());
    assert!(manager.get_current_state().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn flush_all_promotes_pending_immediately() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(test_config(5, 10), bridge.clone(), store).await;
    let dialog = DialogId::new(6);
    let group = manager.get_next_notification_group_id().await;
    let id = manager.get_next_notification_id().await;
    manager
        .add_notification(
            group,
            NotificationGroupType::Messages,
            dialog,
            100,
            dialog,
            false,
            60_000,
            id,
            message_kind(6, 1),
        )
        .await;
    settle().await;
    manager.flush_all_notifications().await;
    let updates = bridge.take_group_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].added_notifications.len(), 1);
}
