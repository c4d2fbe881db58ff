use crate::error::NotificationError;
use courier_api::ids::{DialogId, NotificationGroupId, NotificationId};
use courier_api::types::{Notification, NotificationGroupType};
use courier_storage::KeyValueStore;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const KEY_CURRENT_NOTIFICATION_ID: &str = "notifications:current_id";
const KEY_CURRENT_GROUP_ID: &str = "notifications:current_group_id";
const KEY_ANNOUNCEMENTS: &str = "notifications:announcements";
const KEY_CONTACT_REGISTERED_SYNCED: &str = "notifications:contact_registered_synced";

fn group_row_key(group_id: NotificationGroupId) -> String {
    format!("notifications:group:{}", group_id.value)
}

fn item_prefix(group_id: NotificationGroupId) -> String {
    format!("notifications:item:{}:", group_id.value)
}

/// Row key of one historical notification. Ids are zero padded so that an
/// ascending key scan walks them in id order.
pub fn item_row_key(group_id: NotificationGroupId, notification_id: NotificationId) -> String {
    format!(
        "notifications:item:{}:{:010}",
        group_id.value, notification_id.value
    )
}

/// Per-group summary written back when mutations settle. Individual
/// notification rows are owned by the message database, never written here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredGroup {
    pub kind: NotificationGroupType,
    pub dialog_id: DialogId,
    pub last_notification_date: i32,
    pub total_count: i32,
}

#[derive(Clone)]
pub struct PersistenceAdapter {
    store: Arc<dyn KeyValueStore>,
}

impl PersistenceAdapter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn load_group(
        &self,
        group_id: NotificationGroupId,
    ) -> Result<Option<StoredGroup>, NotificationError> {
        let Some(bytes) = self.store.get(&group_row_key(group_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes).map_err(|_| {
            NotificationError::StoreUnavailable
        })?))
    }

    pub async fn save_group(
        &self,
        group_id: NotificationGroupId,
        summary: &StoredGroup,
    ) -> Result<(), NotificationError> {
        let bytes = serde_json::to_vec(summary).map_err(|_| NotificationError::StoreUnavailable)?;
        self.store.put(&group_row_key(group_id), bytes).await?;
        Ok(())
    }

    pub async fn delete_group(
        &self,
        group_id: NotificationGroupId,
    ) -> Result<(), NotificationError> {
        self.store.delete(&group_row_key(group_id)).await?;
        Ok(())
    }

    pub async fn load_group_ids(&self) -> Result<Vec<NotificationGroupId>, NotificationError> {
        let rows = self.store.scan_prefix("notifications:group:").await?;
        let mut ids = Vec::with_capacity(rows.len());
        for (key, _) in rows {
            let Some(id) = key
                .rsplit(':')
                .next()
                .and_then(|raw| raw.parse::<i32>().ok())
            else {
                warn!("skipping malformed group row key {}", key);
                continue;
            };
            ids.push(NotificationGroupId::new(id));
        }
        Ok(ids)
    }

    /// Historical notifications of a group with id strictly below `before`,
    /// the newest `desired_size` of them, returned in ascending id order.
    pub async fn load_notifications(
        &self,
        group_id: NotificationGroupId,
        before: Option<NotificationId>,
        desired_size: usize,
    ) -> Result<Vec<Notification>, NotificationError> {
        let rows = self.store.scan_prefix(&item_prefix(group_id)).await?;
        let mut notifications: Vec<Notification> = Vec::new();
        for (key, bytes) in rows {
            match serde_json::from_slice::<Notification>(&bytes) {
                Ok(notification) => notifications.push(notification),
                Err(_) => warn!("skipping malformed notification row {}", key),
            }
        }
        if let Some(before) = before {
            notifications.retain(|n| n.id < before);
        }
        let start = notifications.len().saturating_sub(desired_size);
        Ok(notifications.split_off(start))
    }

    pub async fn load_counters(&self) -> Result<(i32, i32), NotificationError> {
        let notification_id = self.load_i32(KEY_CURRENT_NOTIFICATION_ID).await?;
        let group_id = self.load_i32(KEY_CURRENT_GROUP_ID).await?;
        Ok((notification_id, group_id))
    }

    pub async fn save_counters(
        &self,
        notification_id: i32,
        group_id: i32,
    ) -> Result<(), NotificationError> {
        self.save_i32(KEY_CURRENT_NOTIFICATION_ID, notification_id)
            .await?;
        self.save_i32(KEY_CURRENT_GROUP_ID, group_id).await
    }

    pub async fn load_announcements(&self) -> Result<HashMap<i32, i32>, NotificationError> {
        let Some(bytes) = self.store.get(KEY_ANNOUNCEMENTS).await? else {
            return Ok(HashMap::new());
        };
        serde_json::from_slice(&bytes).map_err(|_| NotificationError::StoreUnavailable)
    }

    pub async fn save_announcements(
        &self,
        announcements: &HashMap<i32, i32>,
    ) -> Result<(), NotificationError> {
        let bytes = serde_json::to_vec(announcements).map_err(|_| NotificationError::StoreUnavailable)?;
        self.store.put(KEY_ANNOUNCEMENTS, bytes).await?;
        Ok(())
    }

    /// The preference value last confirmed by the server, if any.
    pub async fn load_contact_registered_synced(
        &self,
    ) -> Result<Option<bool>, NotificationError> {
        let Some(bytes) = self.store.get(KEY_CONTACT_REGISTERED_SYNCED).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes).map_err(|_| NotificationError::StoreUnavailable)
    }

    pub async fn save_contact_registered_synced(
        &self,
        is_disabled: bool,
    ) -> Result<(), NotificationError> {
        let bytes = serde_json::to_vec(&is_disabled).map_err(|_| NotificationError::StoreUnavailable)?;
        self.store.put(KEY_CONTACT_REGISTERED_SYNCED, bytes).await?;
        Ok(())
    }

    async fn load_i32(&self, key: &str) -> Result<i32, NotificationError> {
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(0);
        };
        serde_json::from_slice(&bytes).map_err(|_| NotificationError::StoreUnavailable)
    }

    async fn save_i32(&self, key: &str, value: i32) -> Result<(), NotificationError> {
        let bytes = serde_json::to_vec(&value).map_err(|_| NotificationError::StoreUnavailable)?;
        self.store.put(key, bytes).await?;
        Ok(())
    }
}
