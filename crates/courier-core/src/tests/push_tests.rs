use super::{fast_config, message_kind, new_manager, settle, CaptureBridge};
use crate::error::NotificationError;
use crate::push::encrypt_push;
use courier_api::ids::DialogId;
use courier_api::types::{NotificationGroupType, NotificationType};
use courier_storage::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

const KEY: &[u8] = &[5u8; 32];

fn message_push(chat_id: i64, msg_id: i64, random_id: i64) -> String {
    format!(
        r#"{{"loc_key":"message.text","loc_args":["alice","hello"],"custom":{{"chat_id":{},"from_id":11,"msg_id":{},"random_id":{}}}}}"#,
        chat_id, msg_id, random_id
    )
}

#[tokio::test(start_paused = true)]
async fn replayed_push_yields_one_update() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(5, 10), bridge.clone(), store).await;
    manager.register_push_encryption_key(42, KEY.to_vec()).await;
    let push = encrypt_push(42, KEY, &message_push(7, 100, 900)).expect("encrypt");
    manager
        .process_push_notification(push.clone())
        .await
        .expect("first push");
    manager
        .process_push_notification(push.clone())
        .await
        .expect("replayed push");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let updates = bridge.take_group_updates();
    assert_eq!(updates.len(), 1, "duplicates collapse before the flush");
    assert_eq!(updates[0].added_notifications.len(), 1);
    assert_eq!(updates[0].total_count, 1);
    // Replaying after the flush is equally idempotent.
    manager
        .process_push_notification(push)
        .await
        .expect("late replay");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(bridge.take_group_updates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn push_for_another_receiver_is_rejected() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(5, 10), bridge.clone(), store).await;
    manager.register_push_encryption_key(42, KEY.to_vec()).await;
    let push = encrypt_push(43, KEY, &message_push(7, 100, 900)).expect("encrypt");
    let err = manager.process_push_notification(push).await.unwrap_err();
    assert!(matches!(err, NotificationError::WrongReceiver));
    settle().await;
    assert!(bridge.take_group_updates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unknown_loc_key_is_tolerated() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(5, 10), bridge.clone(), store).await;
    manager
        .process_push_notification(r#"{"loc_key":"message.dance","loc_args":[]}"#.to_string())
        .await
        .expect("unknown loc key is a no-op");
    settle().await;
    assert!(bridge.take_updates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn read_history_push_clears_up_to_max_id() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(5, 10), bridge.clone(), store).await;
    let dialog = DialogId::new(7);
    let group = manager.get_next_notification_group_id().await;
    let mut ids = Vec::new();
    for message in 1..=3i64 {
        let id = manager.get_next_notification_id().await;
        ids.push(id);
        manager
            .add_notification(
                group,
                NotificationGroupType::Messages,
                dialog,
                100 + message as i32,
                dialog,
                false,
                1,
                id,
                message_kind(7, message),
            )
            .await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    bridge.take_updates();
    manager
        .process_push_notification(
            r#"{"loc_key":"history.read","custom":{"chat_id":7,"max_id":2}}"#.to_string(),
        )
        .await
        .expect("read history push");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let updates = bridge.take_group_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].removed_notification_ids, vec![ids[0], ids[1]]);
    assert_eq!(updates[0].total_count, 1);
}

#[tokio::test(start_paused = true)]
async fn deleted_messages_push_removes_matching_notifications() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(5, 10), bridge.clone(), store).await;
    manager.register_push_encryption_key(42, KEY.to_vec()).await;
    let push = encrypt_push(42, KEY, &message_push(9, 55, 0)).expect("encrypt");
    manager
        .process_push_notification(push)
        .await
        .expect("message push");
    tokio::time::sleep(Duration::from_millis(200)).await;
    bridge.take_updates();
    manager
        .process_push_notification(
            r#"{"loc_key":"messages.deleted","custom":{"chat_id":9,"messages":"55"}}"#.to_string(),
        )
        .await
        .expect("delete push");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let updates = bridge.take_group_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].removed_notification_ids.len(), 1);
    assert_eq!(updates[0].total_count, 0);
}

#[tokio::test(start_paused = true)]
async fn announcement_pushes_deduplicate_for_a_week() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(5, 10), bridge.clone(), store).await;
    let announcement = r#"{"loc_key":"message.announcement","loc_args":["courier","maintenance"],"custom":{"chat_id":777,"msg_id":1,"announcement_id":12}}"#;
    manager
        .process_push_notification(announcement.to_string())
        .await
        .expect("first announcement");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bridge.take_group_updates().len(), 1);
    let replay = r#"{"loc_key":"message.announcement","loc_args":["courier","maintenance"],"custom":{"chat_id":777,"msg_id":2,"announcement_id":12}}"#;
    manager
        .process_push_notification(replay.to_string())
        .await
        .expect("replayed announcement");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        bridge.take_group_updates().is_empty(),
        "same announcement id within the cache window is dropped"
    );
}

#[tokio::test(start_paused = true)]
async fn mention_pushes_route_to_the_mention_group() {
    let bridge = CaptureBridge::new();
    let store = Arc::new(MemoryStore::new());
    let manager = new_manager(fast_config(5, 10), bridge.clone(), store).await;
    let push = r#"{"loc_key":"message.text","loc_args":["bob","@you"],"custom":{"chat_id":3,"from_id":8,"msg_id":4,"mention":1}}"#;
    manager
        .process_push_notification(push.to_string())
        .await
        .expect("mention push");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let updates = bridge.take_group_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].kind, NotificationGroupType::Mentions);
    assert!(matches!(
        &updates[0].added_notifications[0].kind,
        NotificationType::NewPushMessage { sender_name, .. } if sender_name == "bob"
    ));
}
