pub mod active_set_tests;
pub mod flush_tests;
pub mod push_tests;

use crate::bridge::NotificationBridge;
use crate::config::NotificationConfig;
use crate::error::NotificationError;
use crate::NotificationManager;
use async_trait::async_trait;
use courier_api::ids::{DialogId, MessageId};
use courier_api::types::{MessageRef, NotificationType};
use courier_api::updates::{Update, UpdateNotificationGroup};
use courier_storage::MemoryStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct CaptureBridge {
    updates: Mutex<Vec<Update>>,
    online: Mutex<HashMap<DialogId, u64>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl CaptureBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            updates: Mutex::new(Vec::new()),
            online: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn take_updates(&self) -> Vec<Update> {
        std::mem::take(&mut *self.updates.lock().expect("updates"))
    }

    pub fn take_group_updates(&self) -> Vec<UpdateNotificationGroup> {
        self.take_updates()
            .into_iter()
            .filter_map(|update| match update {
                Update::NotificationGroup(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    pub fn set_online(&self, dialog_id: DialogId, last_online_ms: u64) {
        self.online
            .lock()
            .expect("online")
            .insert(dialog_id, last_online_ms);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationBridge for CaptureBridge {
    fn emit_update(&self, update: Update) {
        self.updates.lock().expect("updates").push(update);
    }

    fn dialog_last_online_ms(&self, dialog_id: DialogId) -> Option<u64> {
        self.online.lock().expect("online").get(&dialog_id).copied()
    }

    async fn write_contact_registered_preference(
        &self,
        _is_disabled: bool,
    ) -> Result<(), NotificationError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(NotificationError::Server("write failed".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn test_config(group_count_max: i32, group_size_max: i32) -> NotificationConfig {
    NotificationConfig {
        group_count_max,
        group_size_max,
        online_cloud_timeout_ms: 300_000,
        notification_cloud_delay_ms: 30_000,
        notification_default_delay_ms: 1_500,
    }
}

/// Same shape with a near-zero flush delay, for tests that are not about
/// the delay window itself.
pub fn fast_config(group_count_max: i32, group_size_max: i32) -> NotificationConfig {
    NotificationConfig {
        notification_default_delay_ms: 1,
        ..test_config(group_count_max, group_size_max)
    }
}

pub async fn new_manager(
    config: NotificationConfig,
    bridge: Arc<CaptureBridge>,
    store: Arc<MemoryStore>,
) -> NotificationManager {
    NotificationManager::init(config, bridge, store)
        .await
        .expect("manager init")
}

pub fn message_kind(dialog_id: i64, message_id: i64) -> NotificationType {
    NotificationType::NewMessage {
        message: MessageRef {
            dialog_id: DialogId::new(dialog_id),
            message_id: MessageId::new(message_id),
        },
    }
}

/// Lets spawned tasks and due timers run under the paused clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
