use serde::{Deserialize, Serialize};

pub const MIN_NOTIFICATION_GROUP_COUNT_MAX: i32 = 0;
pub const MAX_NOTIFICATION_GROUP_COUNT_MAX: i32 = 25;
pub const MIN_NOTIFICATION_GROUP_SIZE_MAX: i32 = 1;
pub const MAX_NOTIFICATION_GROUP_SIZE_MAX: i32 = 25;

/// Hidden notifications kept in memory beyond the visible window, so that
/// removals can slide older entries back in without a store read.
pub const EXTRA_GROUP_SIZE: usize = 10;

pub const MAX_CALL_NOTIFICATION_GROUPS: usize = 10;
pub const MAX_CALL_NOTIFICATIONS: usize = 10;

pub const MIN_NOTIFICATION_DELAY_MS: i64 = 1;
pub const MIN_UPDATE_DELAY_MS: i64 = 50;
pub const MAX_UPDATE_DELAY_MS: i64 = 60_000;

pub const ANNOUNCEMENT_ID_CACHE_TIME_SECS: i32 = 7 * 86_400;

pub const CONTACT_SYNC_RETRY_BASE_MS: u64 = 5_000;
pub const CONTACT_SYNC_RETRY_MAX_MS: u64 = 60_000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    /// Size of the active set. Zero disables delivery entirely.
    pub group_count_max: i32,
    /// Notifications per group shown to the observer.
    pub group_size_max: i32,
    /// Window within which a chat counts as recently online.
    pub online_cloud_timeout_ms: i64,
    /// Flush delay when the chat is recently online.
    pub notification_cloud_delay_ms: i64,
    /// Flush delay otherwise.
    pub notification_default_delay_ms: i64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            group_count_max: 0,
            group_size_max: 10,
            online_cloud_timeout_ms: 300_000,
            notification_cloud_delay_ms: 30_000,
            notification_default_delay_ms: 1_500,
        }
    }
}

impl NotificationConfig {
    pub fn clamped(mut self) -> Self {
        self.group_count_max = clamp_group_count_max(self.group_count_max);
        self.group_size_max = clamp_group_size_max(self.group_size_max);
        self.online_cloud_timeout_ms = self.online_cloud_timeout_ms.max(0);
        self.notification_cloud_delay_ms = self.notification_cloud_delay_ms.max(1);
        self.notification_default_delay_ms = self.notification_default_delay_ms.max(1);
        self
    }
}

pub fn clamp_group_count_max(value: i32) -> i32 {
    value.clamp(MIN_NOTIFICATION_GROUP_COUNT_MAX, MAX_NOTIFICATION_GROUP_COUNT_MAX)
}

pub fn clamp_group_size_max(value: i32) -> i32 {
    value.clamp(MIN_NOTIFICATION_GROUP_SIZE_MAX, MAX_NOTIFICATION_GROUP_SIZE_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_out_of_range_options() {
        let config = NotificationConfig {
            group_count_max: 99,
            group_size_max: 0,
            online_cloud_timeout_ms: -5,
            notification_cloud_delay_ms: 0,
            notification_default_delay_ms: -1,
        }
        .clamped();
        assert_eq!(config.group_count_max, MAX_NOTIFICATION_GROUP_COUNT_MAX);
        assert_eq!(config.group_size_max, MIN_NOTIFICATION_GROUP_SIZE_MAX);
        assert_eq!(config.online_cloud_timeout_ms, 0);
        assert_eq!(config.notification_cloud_delay_ms, 1);
        assert_eq!(config.notification_default_delay_ms, 1);
    }

    #[test]
    fn default_keeps_delivery_disabled() {
        let config = NotificationConfig::default().clamped();
        assert_eq!(config.group_count_max, 0);
        assert_eq!(config.group_size_max, 10);
    }
}
