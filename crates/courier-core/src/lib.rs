pub mod bridge;
pub mod calls;
pub mod config;
pub mod error;
pub mod groups;
pub mod persist;
pub mod push;
pub mod registered;
pub mod time;
pub mod timeout;
pub mod updates;

use calls::{ActiveCallNotification, CallGroupSlot, CallNotificationRing};
use config::{
    clamp_group_count_max, clamp_group_size_max, ANNOUNCEMENT_ID_CACHE_TIME_SECS,
    EXTRA_GROUP_SIZE, MAX_CALL_NOTIFICATIONS, MAX_UPDATE_DELAY_MS, MIN_NOTIFICATION_DELAY_MS,
    MIN_UPDATE_DELAY_MS,
};
use courier_api::ids::{CallId, DialogId, MessageId, NotificationGroupId, NotificationId, UserId};
use courier_api::types::{MessageRef, Notification, NotificationGroupType, NotificationType};
use courier_api::updates::{
    ActiveNotificationGroup, Update, UpdateActiveNotifications, UpdateHavePendingNotifications,
    UpdateNotification, UpdateNotificationGroup,
};
use courier_storage::KeyValueStore;
use groups::{GroupStore, NotificationGroup, NotificationGroupKey, PendingNotification};
use log::{debug, warn};
use persist::{PersistenceAdapter, StoredGroup};
use push::{convert_loc_key, PushPayload, PushSchema};
use registered::ContactRegisteredSync;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use time::{now_ms, now_unix};
use timeout::MultiTimeout;
use tokio::sync::Mutex;
use tokio::time::Instant;
use updates::{coalesce, PendingUpdate};

pub use bridge::NotificationBridge;
pub use config::NotificationConfig;
pub use error::NotificationError;
pub use push::{decrypt_push, encrypt_push, get_push_receiver_id};
pub use registered::SyncState;

/// In-process notification group manager. Ingests per-chat notifications,
/// coalesces them into a bounded active set of groups, and delivers batched
/// updates to the owner's observer through the bridge.
///
/// All state lives behind one lock and every mutation runs serially on it;
/// store reads, server writes and timer fires re-enter through the same
/// public surface.
#[derive(Clone)]
pub struct NotificationManager {
    inner: Arc<Mutex<Inner>>,
    timers: Arc<Timers>,
    bridge: Arc<dyn NotificationBridge>,
    persist: PersistenceAdapter,
}

struct Timers {
    flush_notifications: MultiTimeout,
    flush_updates: MultiTimeout,
}

struct Inner {
    group_count_max: usize,
    group_size_max: usize,
    keep_group_size: usize,
    online_cloud_timeout_ms: i64,
    notification_cloud_delay_ms: i64,
    notification_default_delay_ms: i64,

    current_notification_id: i32,
    current_group_id: i32,
    /// Highest group id ever referenced by a queued update. Ids at or below
    /// this are never recycled.
    emitted_group_id_watermark: i32,
    available_group_ids: BTreeSet<NotificationGroupId>,

    store: GroupStore,
    dialog_groups: HashMap<(DialogId, NotificationGroupType), NotificationGroupId>,

    pending_updates: HashMap<NotificationGroupId, Vec<PendingUpdate>>,
    delivered_total_counts: HashMap<NotificationGroupId, i32>,
    pending_update_count: i32,
    delayed_group_count: i32,
    have_delayed: bool,
    have_unreceived: bool,

    running_get_difference: bool,
    running_get_chat_difference: HashSet<NotificationGroupId>,

    calls: CallNotificationRing,
    push_keys: HashMap<i64, Vec<u8>>,
    announcements: HashMap<i32, i32>,

    contact_sync: ContactRegisteredSync,
    is_destroyed: bool,
}

#[derive(Clone)]
struct WeakHandle {
    inner: Weak<Mutex<Inner>>,
    timers: Weak<Timers>,
    bridge: Arc<dyn NotificationBridge>,
    persist: PersistenceAdapter,
}

impl WeakHandle {
    fn upgrade(&self) -> Option<NotificationManager> {
        Some(NotificationManager {
            inner: self.inner.upgrade()?,
            timers: self.timers.upgrade()?,
            bridge: self.bridge.clone(),
            persist: self.persist.clone(),
        })
    }
}

fn timer_key(group_id: NotificationGroupId) -> i64 {
    group_id.value as i64
}

impl NotificationManager {
    pub async fn init(
        config: NotificationConfig,
        bridge: Arc<dyn NotificationBridge>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, NotificationError> {
        let config = config.clamped();
        let persist = PersistenceAdapter::new(store);
        let (current_notification_id, current_group_id) = persist.load_counters().await?;
        let announcements = match persist.load_announcements().await {
            Ok(announcements) => announcements,
            Err(err) => {
                warn!("announcement table unavailable: {}", err);
                HashMap::new()
            }
        };
        let synced = persist.load_contact_registered_synced().await.unwrap_or(None);
        let group_size_max = config.group_size_max as usize;
        let inner = Arc::new(Mutex::new(Inner {
            group_count_max: config.group_count_max as usize,
            group_size_max,
            keep_group_size: group_size_max + EXTRA_GROUP_SIZE,
            online_cloud_timeout_ms: config.online_cloud_timeout_ms,
            notification_cloud_delay_ms: config.notification_cloud_delay_ms,
            notification_default_delay_ms: config.notification_default_delay_ms,
            current_notification_id,
            current_group_id,
            emitted_group_id_watermark: 0,
            available_group_ids: BTreeSet::new(),
            store: GroupStore::default(),
            dialog_groups: HashMap::new(),
            pending_updates: HashMap::new(),
            delivered_total_counts: HashMap::new(),
            pending_update_count: 0,
            delayed_group_count: 0,
            have_delayed: false,
            have_unreceived: false,
            running_get_difference: false,
            running_get_chat_difference: HashSet::new(),
            calls: CallNotificationRing::default(),
            push_keys: HashMap::new(),
            announcements,
            contact_sync: ContactRegisteredSync::restore(false, synced),
            is_destroyed: false,
        }));
        let flush_handle = WeakHandle {
            inner: Arc::downgrade(&inner),
            timers: Weak::new(),
            bridge: bridge.clone(),
            persist: persist.clone(),
        };
        let timers = Arc::new_cyclic(|weak_timers: &Weak<Timers>| {
            let notification_handle = WeakHandle {
                timers: weak_timers.clone(),
                ..flush_handle.clone()
            };
            let update_handle = notification_handle.clone();
            Timers {
                flush_notifications: MultiTimeout::new(Arc::new(move |key| {
                    if let Some(manager) = notification_handle.upgrade() {
                        tokio::spawn(async move {
                            manager
                                .flush_pending_notifications(NotificationGroupId::new(key as i32))
                                .await;
                        });
                    }
                })),
                flush_updates: MultiTimeout::new(Arc::new(move |key| {
                    if let Some(manager) = update_handle.upgrade() {
                        tokio::spawn(async move {
                            manager
                                .flush_pending_updates(NotificationGroupId::new(key as i32))
                                .await;
                        });
                    }
                })),
            }
        });
        Ok(Self {
            inner,
            timers,
            bridge,
            persist,
        })
    }

    fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            inner: Arc::downgrade(&self.inner),
            timers: Arc::downgrade(&self.timers),
            bridge: self.bridge.clone(),
            persist: self.persist.clone(),
        }
    }

    fn is_disabled(&self, inner: &Inner) -> bool {
        inner.is_destroyed || inner.group_count_max == 0
    }

    // --- identifier allocation ---

    pub async fn get_max_notification_id(&self) -> NotificationId {
        let inner = self.inner.lock().await;
        NotificationId::new(inner.current_notification_id)
    }

    pub async fn get_max_notification_group_size(&self) -> usize {
        self.inner.lock().await.group_size_max
    }

    pub async fn get_next_notification_id(&self) -> NotificationId {
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed {
            return NotificationId::default();
        }
        let id = next_notification_id(&mut inner);
        self.spawn_save_counters(&inner);
        id
    }

    pub async fn get_next_notification_group_id(&self) -> NotificationGroupId {
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed {
            return NotificationGroupId::default();
        }
        let id = next_group_id(&mut inner);
        self.spawn_save_counters(&inner);
        id
    }

    /// Returns a group id to the allocator, permitted only while no update
    /// has ever referenced it.
    pub async fn try_reuse_notification_group_id(&self, group_id: NotificationGroupId) {
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed || !group_id.is_valid() {
            return;
        }
        if group_id.value <= inner.emitted_group_id_watermark {
            return;
        }
        if inner.store.contains(group_id) || inner.calls.is_call_group(group_id) {
            return;
        }
        inner.available_group_ids.insert(group_id);
    }

    fn spawn_save_counters(&self, inner: &Inner) {
        let persist = self.persist.clone();
        let notification_id = inner.current_notification_id;
        let group_id = inner.current_group_id;
        tokio::spawn(async move {
            if let Err(err) = persist.save_counters(notification_id, group_id).await {
                warn!("failed to persist id counters: {}", err);
            }
        });
    }

    // --- ingress ---

    #[allow(clippy::too_many_arguments)]
    pub async fn add_notification(
        &self,
        group_id: NotificationGroupId,
        group_type: NotificationGroupType,
        dialog_id: DialogId,
        date: i32,
        settings_dialog_id: DialogId,
        is_silent: bool,
        min_delay_ms: i64,
        notification_id: NotificationId,
        kind: NotificationType,
    ) {
        let needs_load = {
            let mut inner = self.inner.lock().await;
            if self.is_disabled(&inner) {
                return;
            }
            if !group_id.is_valid()
                || !notification_id.is_valid()
                || !dialog_id.is_valid()
                || date <= 0
            {
                warn!("dropping invalid {} for {}", notification_id, group_id);
                return;
            }
            let delay_ms = self.notification_delay_ms(&inner, settings_dialog_id, min_delay_ms);
            let needs_load = !inner.store.contains(group_id);
            if needs_load {
                inner.store.insert(
                    NotificationGroupKey {
                        last_notification_date: 0,
                        group_id,
                        dialog_id,
                    },
                    NotificationGroup::new(group_type),
                );
                inner.dialog_groups.insert((dialog_id, group_type), group_id);
            }
            let gated = self.is_gated(&inner, group_id);
            let Some(group) = inner.store.get_mut(group_id) else {
                return;
            };
            let last_id = group
                .pending_notifications
                .last()
                .map(|p| p.notification_id)
                .unwrap_or_else(|| group.last_notification_id());
            if notification_id <= last_id {
                warn!("dropping non-monotonic {} for {}", notification_id, group_id);
                return;
            }
            let was_empty = group.pending_notifications.is_empty();
            group.pending_notifications.push(PendingNotification {
                date,
                settings_dialog_id,
                is_silent,
                notification_id,
                kind,
            });
            if gated {
                group.pending_flush_at = None;
            } else {
                let flush_at = Instant::now() + Duration::from_millis(delay_ms as u64);
                let flush_at = match group.pending_flush_at {
                    Some(current) if current <= flush_at => current,
                    _ => flush_at,
                };
                group.pending_flush_at = Some(flush_at);
                self.timers.flush_notifications.set(timer_key(group_id), flush_at);
            }
            if was_empty {
                inner.delayed_group_count += 1;
                self.sync_have_pending(&mut inner);
            }
            needs_load
        };
        if needs_load {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.ensure_group_loaded(group_id).await;
            });
        }
    }

    pub async fn edit_notification(
        &self,
        group_id: NotificationGroupId,
        notification_id: NotificationId,
        kind: NotificationType,
    ) {
        let mut inner = self.inner.lock().await;
        if self.is_disabled(&inner) || !group_id.is_valid() || !notification_id.is_valid() {
            return;
        }
        let group_count_max = inner.group_count_max;
        let group_size_max = inner.group_size_max;
        let Some(group) = inner.store.get_mut(group_id) else {
            return;
        };
        if let Some(pending) = group
            .pending_notifications
            .iter_mut()
            .find(|p| p.notification_id == notification_id)
        {
            pending.kind = kind;
            return;
        }
        let visible = group
            .visible(group_size_max)
            .iter()
            .any(|n| n.id == notification_id);
        let Some(notification) = group
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
        else {
            return;
        };
        notification.kind = kind;
        let snapshot = notification.clone();
        if visible && inner.store.is_active(group_id, group_count_max) {
            self.queue_update(
                &mut inner,
                group_id,
                PendingUpdate::Edit(UpdateNotification {
                    group_id,
                    notification: snapshot,
                }),
            );
        }
    }

    pub async fn remove_notification(
        &self,
        group_id: NotificationGroupId,
        notification_id: NotificationId,
        is_permanent: bool,
        force_update: bool,
    ) -> Result<(), NotificationError> {
        if !group_id.is_valid() || !notification_id.is_valid() {
            warn!("ignoring removal of invalid {} from {}", notification_id, group_id);
            return Ok(());
        }
        if !self.ensure_group_loaded(group_id).await {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed {
            return Ok(());
        }
        let group_count_max = inner.group_count_max;
        let group_size_max = inner.group_size_max;
        let active_before = inner.store.active_ids(group_count_max);
        let was_active = active_before.contains(&group_id);
        let Some(group) = inner.store.get_mut(group_id) else {
            return Ok(());
        };
        if let Some(position) = group
            .pending_notifications
            .iter()
            .position(|p| p.notification_id == notification_id)
        {
            group.pending_notifications.remove(position);
            let emptied = group.pending_notifications.is_empty();
            let now_empty = group.is_empty();
            if emptied {
                group.pending_flush_at = None;
                self.timers.flush_notifications.cancel(timer_key(group_id));
                inner.delayed_group_count -= 1;
                self.sync_have_pending(&mut inner);
            }
            if now_empty {
                self.delete_group(&mut inner, group_id);
            }
            return Ok(());
        }
        let window_before: Vec<NotificationId> = if was_active {
            group.visible_ids(group_size_max)
        } else {
            Vec::new()
        };
        let in_memory = group
            .notifications
            .iter()
            .position(|n| n.id == notification_id);
        match in_memory {
            Some(position) => {
                group.notifications.remove(position);
                if is_permanent {
                    group.total_count = (group.total_count - 1).max(0);
                }
            }
            None => {
                // Known only to the store; the summary count still shrinks.
                let floor =
                    (group.notifications.len() + group.pending_notifications.len()) as i32;
                if !is_permanent || group.total_count <= floor {
                    return Ok(());
                }
                group.total_count -= 1;
            }
        }
        self.finish_group_mutation(
            &mut inner,
            group_id,
            &active_before,
            window_before,
            None,
            force_update,
        );
        Ok(())
    }

    pub async fn remove_notification_group(
        &self,
        group_id: NotificationGroupId,
        max_notification_id: NotificationId,
        max_message_id: MessageId,
        new_total_count: i32,
        force_update: bool,
    ) -> Result<(), NotificationError> {
        if !group_id.is_valid() {
            return Ok(());
        }
        if !self.ensure_group_loaded(group_id).await {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed {
            return Ok(());
        }
        let group_count_max = inner.group_count_max;
        let group_size_max = inner.group_size_max;
        let active_before = inner.store.active_ids(group_count_max);
        let was_active = active_before.contains(&group_id);
        let removes = move |id: NotificationId, message_id: Option<MessageId>| {
            (max_notification_id.is_valid() && id <= max_notification_id)
                || (max_message_id.is_valid()
                    && message_id.map_or(false, |m| m <= max_message_id))
        };
        let Some(group) = inner.store.get_mut(group_id) else {
            return Ok(());
        };
        let had_pending = !group.pending_notifications.is_empty();
        group.pending_notifications.retain(|p| {
            !removes(
                p.notification_id,
                p.kind.message_ref().map(|m| m.message_id),
            )
        });
        if had_pending && group.pending_notifications.is_empty() {
            group.pending_flush_at = None;
            self.timers.flush_notifications.cancel(timer_key(group_id));
            inner.delayed_group_count -= 1;
            self.sync_have_pending(&mut inner);
        }
        let Some(group) = inner.store.get_mut(group_id) else {
            return Ok(());
        };
        let window_before: Vec<NotificationId> = if was_active {
            group.visible_ids(group_size_max)
        } else {
            Vec::new()
        };
        let before_len = group.notifications.len();
        group.notifications.retain(|n| !removes(n.id, n.message_id()));
        let removed_count = (before_len - group.notifications.len()) as i32;
        if new_total_count >= 0 {
            group.total_count = new_total_count;
        } else {
            group.total_count = (group.total_count - removed_count).max(0);
        }
        let floor = (group.notifications.len() + group.pending_notifications.len()) as i32;
        group.total_count = group.total_count.max(floor);
        self.finish_group_mutation(
            &mut inner,
            group_id,
            &active_before,
            window_before,
            None,
            force_update,
        );
        Ok(())
    }

    pub async fn set_notification_total_count(
        &self,
        group_id: NotificationGroupId,
        new_total_count: i32,
    ) {
        if !group_id.is_valid() {
            return;
        }
        if !self.ensure_group_loaded(group_id).await {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed {
            return;
        }
        let group_count_max = inner.group_count_max;
        let group_size_max = inner.group_size_max;
        let active_before = inner.store.active_ids(group_count_max);
        let was_active = active_before.contains(&group_id);
        let Some(group) = inner.store.get_mut(group_id) else {
            return;
        };
        let floor = (group.notifications.len() + group.pending_notifications.len()) as i32;
        group.total_count = new_total_count.max(floor);
        let window_before: Vec<NotificationId> = if was_active {
            group.visible_ids(group_size_max)
        } else {
            Vec::new()
        };
        self.finish_group_mutation(
            &mut inner,
            group_id,
            &active_before,
            window_before,
            None,
            false,
        );
    }

    pub async fn get_notification_group_message_ids(
        &self,
        group_id: NotificationGroupId,
    ) -> Vec<MessageId> {
        if !self.ensure_group_loaded(group_id).await {
            return Vec::new();
        }
        let inner = self.inner.lock().await;
        inner
            .store
            .get(group_id)
            .map(|group| group.message_ids())
            .unwrap_or_default()
    }

    /// Warms a group from the store before it is queried or mutated.
    pub async fn load_group_force(&self, group_id: NotificationGroupId) {
        if group_id.is_valid() {
            self.ensure_group_loaded(group_id).await;
        }
    }

    // --- call notifications ---

    pub async fn add_call_notification(&self, dialog_id: DialogId, call_id: CallId) {
        let (group_id, notification_id, dropped) = {
            let mut inner = self.inner.lock().await;
            if self.is_disabled(&inner) || !dialog_id.is_valid() {
                return;
            }
            let fresh = if inner.calls.would_allocate(dialog_id) {
                Some(next_group_id(&mut inner))
            } else {
                None
            };
            let slot = inner
                .calls
                .group_for(dialog_id, || fresh.unwrap_or_default());
            let group_id = match slot {
                CallGroupSlot::Existing(group_id) => group_id,
                CallGroupSlot::Fresh(group_id) => group_id,
                CallGroupSlot::Evicted {
                    group_id,
                    from_dialog_id,
                } => {
                    debug!("evicting call {} of {}", group_id, from_dialog_id);
                    self.drop_call_group(&mut inner, group_id);
                    group_id
                }
            };
            if !inner.store.contains(group_id) {
                let mut group = NotificationGroup::new(NotificationGroupType::Calls);
                group.loaded_from_store = true;
                inner.store.insert(
                    NotificationGroupKey {
                        last_notification_date: 0,
                        group_id,
                        dialog_id,
                    },
                    group,
                );
            }
            let notification_id = next_notification_id(&mut inner);
            inner.calls.push_active(
                dialog_id,
                ActiveCallNotification {
                    call_id,
                    notification_id,
                },
            );
            let dropped = if inner.calls.active_count(dialog_id) > MAX_CALL_NOTIFICATIONS {
                inner.calls.pop_oldest_active(dialog_id)
            } else {
                None
            };
            self.spawn_save_counters(&inner);
            (group_id, notification_id, dropped)
        };
        self.add_notification(
            group_id,
            NotificationGroupType::Calls,
            dialog_id,
            now_unix(),
            dialog_id,
            false,
            0,
            notification_id,
            NotificationType::NewCall { call_id },
        )
        .await;
        if let Some(oldest) = dropped {
            let _ = self
                .remove_notification(group_id, oldest.notification_id, true, false)
                .await;
        }
    }

    pub async fn remove_call_notification(&self, dialog_id: DialogId, call_id: CallId) {
        let removal = {
            let mut inner = self.inner.lock().await;
            if inner.is_destroyed {
                return;
            }
            let Some(group_id) = inner.calls.group_of(dialog_id) else {
                return;
            };
            inner
                .calls
                .remove_active(dialog_id, call_id)
                .map(|entry| (group_id, entry.notification_id))
        };
        let Some((group_id, notification_id)) = removal else {
            return;
        };
        let _ = self
            .remove_notification(group_id, notification_id, true, true)
            .await;
        let mut inner = self.inner.lock().await;
        inner.calls.release_if_idle(dialog_id);
    }

    /// Removes every notification of an evicted call group and frees its
    /// store entry, emitting the removal ahead of the group's next use.
    fn drop_call_group(&self, inner: &mut Inner, group_id: NotificationGroupId) {
        let group_size_max = inner.group_size_max;
        let group_count_max = inner.group_count_max;
        let active_before = inner.store.active_ids(group_count_max);
        let active = active_before.contains(&group_id);
        let Some((key, group)) = inner.store.remove(group_id) else {
            return;
        };
        if active && !group.notifications.is_empty() {
            let removed = group
                .visible(group_size_max)
                .iter()
                .map(|n| n.id)
                .collect();
            self.queue_update(
                inner,
                group_id,
                PendingUpdate::Group(UpdateNotificationGroup {
                    group_id,
                    kind: group.kind,
                    chat_id: key.dialog_id,
                    notification_settings_chat_id: key.dialog_id,
                    is_silent: true,
                    total_count: 0,
                    added_notifications: Vec::new(),
                    removed_notification_ids: removed,
                }),
            );
            self.force_flush_pending_updates(inner, group_id);
        }
        if !group.pending_notifications.is_empty() {
            inner.delayed_group_count -= 1;
            self.sync_have_pending(inner);
        }
        self.timers.flush_notifications.cancel(timer_key(group_id));
        // The freed slot may promote the highest inactive group.
        self.handle_activation_diff(inner, &active_before, Some(group_id));
    }

    // --- difference gating ---

    pub async fn before_get_difference(&self) {
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed {
            return;
        }
        inner.running_get_difference = true;
    }

    pub async fn after_get_difference(&self) {
        let deferred = {
            let mut inner = self.inner.lock().await;
            if inner.is_destroyed {
                return;
            }
            inner.running_get_difference = false;
            self.deferred_group_ids(&inner)
        };
        for group_id in deferred {
            self.flush_pending_notifications(group_id).await;
        }
        let mut inner = self.inner.lock().await;
        self.flush_all_pending_updates(&mut inner, false);
    }

    pub async fn before_get_chat_difference(&self, group_id: NotificationGroupId) {
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed || !group_id.is_valid() {
            return;
        }
        inner.running_get_chat_difference.insert(group_id);
    }

    pub async fn after_get_chat_difference(&self, group_id: NotificationGroupId) {
        let deferred = {
            let mut inner = self.inner.lock().await;
            if inner.is_destroyed || !group_id.is_valid() {
                return;
            }
            inner.running_get_chat_difference.remove(&group_id);
            self.remove_temporary_notifications(&mut inner, group_id);
            !inner.running_get_difference
                && inner
                    .store
                    .get(group_id)
                    .map(|group| {
                        !group.pending_notifications.is_empty()
                            && group.pending_flush_at.is_none()
                    })
                    .unwrap_or(false)
        };
        if deferred {
            self.flush_pending_notifications(group_id).await;
        }
        let mut inner = self.inner.lock().await;
        if !inner.running_get_difference {
            self.force_flush_pending_updates(&mut inner, group_id);
        }
    }

    fn deferred_group_ids(&self, inner: &Inner) -> Vec<NotificationGroupId> {
        inner
            .store
            .iter()
            .filter(|(key, group)| {
                !group.pending_notifications.is_empty()
                    && group.pending_flush_at.is_none()
                    && !inner.running_get_chat_difference.contains(&key.group_id)
            })
            .map(|(key, _)| key.group_id)
            .collect()
    }

    /// Push-derived provisional notifications are superseded by the
    /// authoritative batch the chat difference delivered.
    fn remove_temporary_notifications(&self, inner: &mut Inner, group_id: NotificationGroupId) {
        let group_count_max = inner.group_count_max;
        let group_size_max = inner.group_size_max;
        let active_before = inner.store.active_ids(group_count_max);
        let was_active = active_before.contains(&group_id);
        let Some(group) = inner.store.get_mut(group_id) else {
            return;
        };
        let pending_before = group.pending_notifications.len();
        group.pending_notifications.retain(|p| !p.kind.is_temporary());
        let pending_removed = pending_before - group.pending_notifications.len();
        let pending_emptied = pending_before > 0 && group.pending_notifications.is_empty();
        let window_before: Vec<NotificationId> = if was_active {
            group.visible_ids(group_size_max)
        } else {
            Vec::new()
        };
        let flushed_before = group.notifications.len();
        group.notifications.retain(|n| !n.kind.is_temporary());
        let temporary_count = (flushed_before - group.notifications.len()) as i32;
        if temporary_count == 0 && pending_removed == 0 {
            return;
        }
        group.total_count = (group.total_count - temporary_count).max(0);
        if pending_emptied {
            group.pending_flush_at = None;
            self.timers.flush_notifications.cancel(timer_key(group_id));
            inner.delayed_group_count -= 1;
            self.sync_have_pending(inner);
        }
        self.finish_group_mutation(
            inner,
            group_id,
            &active_before,
            window_before,
            None,
            false,
        );
    }

    // --- push processing ---

    pub async fn register_push_encryption_key(&self, key_id: i64, key: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed {
            return;
        }
        inner.push_keys.insert(key_id, key);
    }

    pub async fn process_push_notification(
        &self,
        payload: String,
    ) -> Result<(), NotificationError> {
        {
            let inner = self.inner.lock().await;
            if inner.is_destroyed {
                debug!("dropping push after destruction");
                return Ok(());
            }
        }
        let receiver_id = push::get_push_receiver_id(&payload)?;
        let inner_payload = if push::is_encrypted_payload(&payload)? {
            let key = {
                let inner = self.inner.lock().await;
                inner.push_keys.get(&receiver_id).cloned()
            };
            let Some(key) = key else {
                return Err(NotificationError::WrongReceiver);
            };
            push::decrypt_push(receiver_id, &key, &payload)?
        } else {
            payload
        };
        let parsed = PushPayload::parse(&inner_payload)?;
        let Some(schema) = convert_loc_key(&parsed.loc_key) else {
            // Tolerated: logged and dropped without touching any group.
            let err = NotificationError::UnknownLocKey(parsed.loc_key);
            warn!("ignoring push: {}", err);
            return Ok(());
        };
        match schema {
            PushSchema::Ignored => Ok(()),
            PushSchema::ReadHistory => self.process_read_history_push(parsed).await,
            PushSchema::MessagesDeleted => self.process_messages_deleted_push(parsed).await,
            PushSchema::ContactRegistered => {
                let disabled = {
                    let inner = self.inner.lock().await;
                    inner.contact_sync.is_disabled
                };
                if disabled {
                    return Ok(());
                }
                self.process_message_push("CONTACT_REGISTERED", parsed).await
            }
            PushSchema::Message { tag } => self.process_message_push(tag, parsed).await,
        }
    }

    async fn process_message_push(
        &self,
        tag: &str,
        payload: PushPayload,
    ) -> Result<(), NotificationError> {
        let Some(chat_id) = payload.custom.chat_id.or(payload.custom.from_id) else {
            return Err(NotificationError::InvalidPayload(
                "push names no chat".to_string(),
            ));
        };
        let dialog_id = DialogId::new(chat_id);
        let message_id = MessageId::new(payload.custom.msg_id.unwrap_or(0));
        let random_id = payload.custom.random_id.unwrap_or(0);
        let sender_user_id = UserId::new(payload.custom.from_id.unwrap_or(0));
        let sender_name = payload.loc_args.first().cloned().unwrap_or_default();
        let loc_args: Vec<String> = payload.loc_args.iter().skip(1).cloned().collect();
        let date = payload.date.unwrap_or_else(now_unix);
        let group_type = if payload.is_mention() {
            NotificationGroupType::Mentions
        } else {
            NotificationGroupType::Messages
        };
        if let Some(announcement_id) = payload.custom.announcement_id {
            if !self.record_announcement(announcement_id).await {
                return Ok(());
            }
        }
        let allocation = {
            let mut inner = self.inner.lock().await;
            if self.is_disabled(&inner) {
                return Ok(());
            }
            let existing = inner.dialog_groups.get(&(dialog_id, group_type)).copied();
            if let Some(group_id) = existing {
                if let Some(group) = inner.store.get(group_id) {
                    if is_duplicate_push(group, message_id, random_id) {
                        debug!("ignoring duplicate push for {}", dialog_id);
                        return Ok(());
                    }
                }
            }
            let group_id = existing.unwrap_or_else(|| next_group_id(&mut inner));
            let notification_id = next_notification_id(&mut inner);
            self.spawn_save_counters(&inner);
            (group_id, notification_id)
        };
        let (group_id, notification_id) = allocation;
        self.add_notification(
            group_id,
            group_type,
            dialog_id,
            date,
            dialog_id,
            payload.is_silent(),
            0,
            notification_id,
            NotificationType::NewPushMessage {
                message: MessageRef {
                    dialog_id,
                    message_id,
                },
                random_id,
                sender_user_id,
                sender_name,
                loc_key: tag.to_string(),
                loc_args,
            },
        )
        .await;
        Ok(())
    }

    /// True when the announcement is new; repeats within the cache window
    /// are dropped.
    async fn record_announcement(&self, announcement_id: i32) -> bool {
        let snapshot = {
            let mut inner = self.inner.lock().await;
            let now = now_unix();
            inner
                .announcements
                .retain(|_, first_seen| now - *first_seen < ANNOUNCEMENT_ID_CACHE_TIME_SECS);
            if inner.announcements.contains_key(&announcement_id) {
                return false;
            }
            inner.announcements.insert(announcement_id, now);
            inner.announcements.clone()
        };
        let persist = self.persist.clone();
        tokio::spawn(async move {
            if let Err(err) = persist.save_announcements(&snapshot).await {
                warn!("failed to persist announcement table: {}", err);
            }
        });
        true
    }

    async fn process_read_history_push(
        &self,
        payload: PushPayload,
    ) -> Result<(), NotificationError> {
        let Some(chat_id) = payload.custom.chat_id else {
            return Err(NotificationError::InvalidPayload(
                "push names no chat".to_string(),
            ));
        };
        let dialog_id = DialogId::new(chat_id);
        let max_message_id = MessageId::new(payload.custom.max_id.unwrap_or(0));
        for group_type in [NotificationGroupType::Messages, NotificationGroupType::Mentions] {
            let group_id = {
                let inner = self.inner.lock().await;
                inner.dialog_groups.get(&(dialog_id, group_type)).copied()
            };
            if let Some(group_id) = group_id {
                self.remove_notification_group(
                    group_id,
                    NotificationId::default(),
                    max_message_id,
                    -1,
                    false,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn process_messages_deleted_push(
        &self,
        payload: PushPayload,
    ) -> Result<(), NotificationError> {
        let Some(chat_id) = payload.custom.chat_id else {
            return Err(NotificationError::InvalidPayload(
                "push names no chat".to_string(),
            ));
        };
        let dialog_id = DialogId::new(chat_id);
        for message_id in payload.deleted_message_ids() {
            let message_id = MessageId::new(message_id);
            let targets = {
                let inner = self.inner.lock().await;
                let mut targets = Vec::new();
                for group_type in
                    [NotificationGroupType::Messages, NotificationGroupType::Mentions]
                {
                    let Some(group_id) =
                        inner.dialog_groups.get(&(dialog_id, group_type)).copied()
                    else {
                        continue;
                    };
                    let Some(group) = inner.store.get(group_id) else {
                        continue;
                    };
                    let flushed = group
                        .notifications
                        .iter()
                        .find(|n| n.message_id() == Some(message_id))
                        .map(|n| n.id);
                    let pending = group
                        .pending_notifications
                        .iter()
                        .find(|p| {
                            p.kind.message_ref().map(|m| m.message_id) == Some(message_id)
                        })
                        .map(|p| p.notification_id);
                    if let Some(notification_id) = flushed.or(pending) {
                        targets.push((group_id, notification_id));
                    }
                }
                targets
            };
            for (group_id, notification_id) in targets {
                self.remove_notification(group_id, notification_id, true, false)
                    .await?;
            }
        }
        Ok(())
    }

    // --- contact-registered sync ---

    pub async fn on_contact_registered_preference_changed(&self, is_disabled: bool) {
        let start = {
            let mut inner = self.inner.lock().await;
            if inner.is_destroyed {
                return;
            }
            if inner.contact_sync.is_disabled == is_disabled
                && inner.contact_sync.state == SyncState::Completed
            {
                return;
            }
            inner.contact_sync.is_disabled = is_disabled;
            if inner.contact_sync.state == SyncState::Pending {
                // The in-flight write notices the change when it completes.
                false
            } else {
                inner.contact_sync.begin_write();
                true
            }
        };
        if start {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.run_contact_registered_sync(is_disabled).await;
            });
        }
    }

    pub async fn contact_registered_sync_state(&self) -> SyncState {
        self.inner.lock().await.contact_sync.state
    }

    fn run_contact_registered_sync(
        &self,
        value: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match self
                .bridge
                .write_contact_registered_preference(value)
                .await
            {
                Ok(()) => {
                    let (confirmed, current) = {
                        let mut inner = self.inner.lock().await;
                        if inner.is_destroyed {
                            return;
                        }
                        let confirmed = inner.contact_sync.complete_write(value);
                        if !confirmed {
                            inner.contact_sync.begin_write();
                        }
                        (confirmed, inner.contact_sync.is_disabled)
                    };
                    if confirmed {
                        if let Err(err) = self.persist.save_contact_registered_synced(value).await
                        {
                            warn!("failed to persist contact-registered flag: {}", err);
                        }
                    } else {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            manager.run_contact_registered_sync(current).await;
                        });
                    }
                }
                Err(err) => {
                    let delay_ms = {
                        let mut inner = self.inner.lock().await;
                        if inner.is_destroyed {
                            return;
                        }
                        inner.contact_sync.fail_write();
                        inner.contact_sync.retry_delay_ms()
                    };
                    debug!(
                        "contact-registered write failed ({}), retrying in {}ms",
                        err, delay_ms
                    );
                    let handle = self.downgrade();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        let Some(manager) = handle.upgrade() else {
                            return;
                        };
                        let retry = {
                            let mut inner = manager.inner.lock().await;
                            if inner.is_destroyed
                                || inner.contact_sync.state != SyncState::NotSynced
                            {
                                None
                            } else {
                                inner.contact_sync.begin_write();
                                Some(inner.contact_sync.is_disabled)
                            }
                        };
                        if let Some(value) = retry {
                            manager.run_contact_registered_sync(value).await;
                        }
                    });
                }
            }
        })
    }

    // --- option changes ---

    pub async fn on_notification_group_count_max_changed(&self, value: i32, send_updates: bool) {
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed {
            return;
        }
        let new_count = clamp_group_count_max(value) as usize;
        if new_count == inner.group_count_max {
            return;
        }
        let active_before = inner.store.active_ids(inner.group_count_max);
        inner.group_count_max = new_count;
        if send_updates {
            self.handle_activation_diff(&mut inner, &active_before, None);
        }
    }

    pub async fn on_notification_group_size_max_changed(&self, value: i32) {
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed {
            return;
        }
        let new_size = clamp_group_size_max(value) as usize;
        let old_size = inner.group_size_max;
        if new_size == old_size {
            return;
        }
        let group_count_max = inner.group_count_max;
        let active: Vec<NotificationGroupId> = inner.store.active_ids(group_count_max);
        let mut queued = Vec::new();
        for group_id in active {
            let Some(group) = inner.store.get(group_id) else {
                continue;
            };
            let before: Vec<NotificationId> = group.visible_ids(old_size);
            let after = group.visible(new_size);
            let added: Vec<Notification> = after
                .iter()
                .filter(|n| !before.contains(&n.id))
                .cloned()
                .collect();
            let after_ids: Vec<NotificationId> = after.iter().map(|n| n.id).collect();
            let removed: Vec<NotificationId> = before
                .iter()
                .filter(|id| !after_ids.contains(id))
                .copied()
                .collect();
            if added.is_empty() && removed.is_empty() {
                continue;
            }
            let Some(key) = inner.store.key_of(group_id) else {
                continue;
            };
            queued.push(PendingUpdate::Group(UpdateNotificationGroup {
                group_id,
                kind: group.kind,
                chat_id: key.dialog_id,
                notification_settings_chat_id: key.dialog_id,
                is_silent: true,
                total_count: group.total_count,
                added_notifications: added,
                removed_notification_ids: removed,
            }));
        }
        inner.group_size_max = new_size;
        inner.keep_group_size = new_size + EXTRA_GROUP_SIZE;
        let keep = inner.keep_group_size;
        for (_, group) in inner.store.iter_mut() {
            let overflow = group.notifications.len().saturating_sub(keep);
            if overflow > 0 {
                group.notifications.drain(..overflow);
            }
        }
        for update in queued {
            let group_id = match &update {
                PendingUpdate::Group(u) => u.group_id,
                PendingUpdate::Edit(u) => u.group_id,
            };
            self.queue_update(&mut inner, group_id, update);
        }
    }

    pub async fn on_online_cloud_timeout_changed(&self, value: i64) {
        self.inner.lock().await.online_cloud_timeout_ms = value.max(0);
    }

    pub async fn on_notification_cloud_delay_changed(&self, value: i64) {
        self.inner.lock().await.notification_cloud_delay_ms = value.max(1);
    }

    pub async fn on_notification_default_delay_changed(&self, value: i64) {
        self.inner.lock().await.notification_default_delay_ms = value.max(1);
    }

    // --- lifecycle ---

    pub async fn flush_all_notifications(&self) {
        let pending = {
            let inner = self.inner.lock().await;
            if inner.is_destroyed {
                return;
            }
            inner
                .store
                .iter()
                .filter(|(_, group)| !group.pending_notifications.is_empty())
                .map(|(key, _)| key.group_id)
                .collect::<Vec<_>>()
        };
        for group_id in pending {
            self.flush_pending_notifications(group_id).await;
        }
        let mut inner = self.inner.lock().await;
        self.flush_all_pending_updates(&mut inner, true);
    }

    pub async fn destroy_all_notifications(&self) {
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed {
            return;
        }
        let group_count_max = inner.group_count_max;
        let group_size_max = inner.group_size_max;
        for group_id in inner.store.active_ids(group_count_max) {
            let Some(group) = inner.store.get(group_id) else {
                continue;
            };
            if group.notifications.is_empty() {
                continue;
            }
            let Some(key) = inner.store.key_of(group_id) else {
                continue;
            };
            let removed = group.visible_ids(group_size_max);
            let update = PendingUpdate::Group(UpdateNotificationGroup {
                group_id,
                kind: group.kind,
                chat_id: key.dialog_id,
                notification_settings_chat_id: key.dialog_id,
                is_silent: true,
                total_count: 0,
                added_notifications: Vec::new(),
                removed_notification_ids: removed,
            });
            self.queue_update(&mut inner, group_id, update);
        }
        self.flush_all_pending_updates(&mut inner, true);
        for group_id in inner.store.group_ids() {
            let persist = self.persist.clone();
            tokio::spawn(async move {
                let _ = persist.delete_group(group_id).await;
            });
        }
        inner.store = GroupStore::default();
        inner.dialog_groups.clear();
        inner.calls.clear();
        inner.pending_updates.clear();
        inner.pending_update_count = 0;
        inner.delayed_group_count = 0;
        self.sync_have_pending(&mut inner);
        inner.is_destroyed = true;
        self.timers.flush_notifications.cancel_all();
        self.timers.flush_updates.cancel_all();
    }

    /// Resubscription snapshot of the observable state.
    pub async fn get_current_state(&self) -> Vec<Update> {
        let inner = self.inner.lock().await;
        if self.is_disabled(&inner) {
            return Vec::new();
        }
        let mut updates = Vec::new();
        let groups: Vec<ActiveNotificationGroup> = inner
            .store
            .iter()
            .take(inner.group_count_max)
            .filter(|(_, group)| !group.notifications.is_empty())
            .map(|(key, group)| ActiveNotificationGroup {
                group_id: key.group_id,
                kind: group.kind,
                chat_id: key.dialog_id,
                total_count: group.total_count,
                notifications: group.visible(inner.group_size_max).to_vec(),
            })
            .collect();
        if !groups.is_empty() {
            updates.push(Update::ActiveNotifications(UpdateActiveNotifications {
                groups,
            }));
        }
        if inner.have_delayed || inner.have_unreceived {
            updates.push(Update::HavePendingNotifications(
                UpdateHavePendingNotifications {
                    have_delayed_notifications: inner.have_delayed,
                    have_unreceived_notifications: inner.have_unreceived,
                },
            ));
        }
        updates
    }

    // --- flush machinery ---

    async fn flush_pending_notifications(&self, group_id: NotificationGroupId) {
        let needs_load = {
            let mut inner = self.inner.lock().await;
            if inner.is_destroyed {
                return;
            }
            let gated = self.is_gated(&inner, group_id);
            let Some(group) = inner.store.get_mut(group_id) else {
                self.timers.flush_notifications.cancel(timer_key(group_id));
                return;
            };
            if group.pending_notifications.is_empty() {
                group.pending_flush_at = None;
                self.timers.flush_notifications.cancel(timer_key(group_id));
                return;
            }
            if gated {
                group.pending_flush_at = None;
                self.timers.flush_notifications.cancel(timer_key(group_id));
                debug!("deferring flush of {} until difference completes", group_id);
                return;
            }
            if !group.loaded_from_store {
                group.pending_flush_at = None;
                self.timers.flush_notifications.cancel(timer_key(group_id));
                !group.loading_from_store
            } else {
                self.do_flush_pending_notifications(&mut inner, group_id);
                false
            }
        };
        if needs_load {
            self.ensure_group_loaded(group_id).await;
        }
    }

    fn do_flush_pending_notifications(&self, inner: &mut Inner, group_id: NotificationGroupId) {
        let group_count_max = inner.group_count_max;
        let group_size_max = inner.group_size_max;
        let keep_group_size = inner.keep_group_size;
        let active_before = inner.store.active_ids(group_count_max);
        let was_active = active_before.contains(&group_id);
        let Some(group) = inner.store.get_mut(group_id) else {
            return;
        };
        if group.pending_notifications.is_empty() {
            return;
        }
        let window_before: Vec<NotificationId> = if was_active {
            group.visible_ids(group_size_max)
        } else {
            Vec::new()
        };
        let mut pending = std::mem::take(&mut group.pending_notifications);
        pending.sort_by_key(|p| (p.date, p.notification_id));
        let settings_dialog_id = pending[0].settings_dialog_id;
        let is_silent = pending[0].is_silent;
        let mut last_date = group.last_notification_date();
        for p in pending {
            let date = p.date.max(last_date);
            last_date = date;
            group.notifications.push(Notification {
                id: p.notification_id,
                date,
                disable_notification: p.is_silent,
                kind: p.kind,
            });
            group.total_count += 1;
        }
        let overflow = group.notifications.len().saturating_sub(keep_group_size);
        if overflow > 0 {
            group.notifications.drain(..overflow);
        }
        group.pending_flush_at = None;
        inner.delayed_group_count -= 1;
        self.timers.flush_notifications.cancel(timer_key(group_id));
        self.finish_group_mutation(
            inner,
            group_id,
            &active_before,
            window_before,
            Some((settings_dialog_id, is_silent)),
            false,
        );
        self.sync_have_pending(inner);
    }

    /// Common tail of every group mutation: rekey to the new last date,
    /// resolve active-set transitions, queue this group's own window diff and
    /// settle persistence.
    fn finish_group_mutation(
        &self,
        inner: &mut Inner,
        group_id: NotificationGroupId,
        active_before: &[NotificationGroupId],
        window_before: Vec<NotificationId>,
        flush_meta: Option<(DialogId, bool)>,
        force_update: bool,
    ) {
        let group_count_max = inner.group_count_max;
        let group_size_max = inner.group_size_max;
        let new_date = inner
            .store
            .get(group_id)
            .map(|group| group.last_notification_date())
            .unwrap_or(0);
        inner.store.rekey(group_id, new_date);
        self.handle_activation_diff(inner, active_before, Some(group_id));
        let was_active = active_before.contains(&group_id);
        let is_active = inner.store.is_active(group_id, group_count_max);
        enum Outcome {
            Queue(PendingUpdate),
            QueueAndFlush(PendingUpdate),
            Nothing,
        }
        let outcome = match (inner.store.get(group_id), inner.store.key_of(group_id)) {
            (Some(group), Some(key)) if is_active => {
                let window_after = group.visible(group_size_max);
                let added: Vec<Notification> = window_after
                    .iter()
                    .filter(|n| !window_before.contains(&n.id))
                    .cloned()
                    .collect();
                let after_ids: Vec<NotificationId> =
                    window_after.iter().map(|n| n.id).collect();
                let removed: Vec<NotificationId> = window_before
                    .iter()
                    .filter(|id| !after_ids.contains(id))
                    .copied()
                    .collect();
                let (settings_dialog_id, is_silent) =
                    flush_meta.unwrap_or((key.dialog_id, true));
                Outcome::Queue(PendingUpdate::Group(UpdateNotificationGroup {
                    group_id,
                    kind: group.kind,
                    chat_id: key.dialog_id,
                    notification_settings_chat_id: settings_dialog_id,
                    is_silent,
                    total_count: group.total_count,
                    added_notifications: added,
                    removed_notification_ids: removed,
                }))
            }
            (Some(group), Some(key)) if was_active && !window_before.is_empty() => {
                // Dropped out of the active set by its own mutation.
                Outcome::QueueAndFlush(PendingUpdate::Group(UpdateNotificationGroup {
                    group_id,
                    kind: group.kind,
                    chat_id: key.dialog_id,
                    notification_settings_chat_id: key.dialog_id,
                    is_silent: true,
                    total_count: 0,
                    added_notifications: Vec::new(),
                    removed_notification_ids: window_before,
                }))
            }
            _ => Outcome::Nothing,
        };
        match outcome {
            Outcome::Queue(update) => self.queue_update(inner, group_id, update),
            Outcome::QueueAndFlush(update) => {
                self.queue_update(inner, group_id, update);
                self.force_flush_pending_updates(inner, group_id);
            }
            Outcome::Nothing => {}
        }
        let empty = inner
            .store
            .get(group_id)
            .map(|group| group.is_empty())
            .unwrap_or(false);
        if empty {
            self.delete_group(inner, group_id);
        } else {
            self.persist_group_summary(inner, group_id);
        }
        if force_update {
            self.force_flush_pending_updates(inner, group_id);
        }
    }

    /// Applies active-set changes caused by a rekey: every group pushed out
    /// gets a synthetic remove-all delivered before any newcomer's add.
    fn handle_activation_diff(
        &self,
        inner: &mut Inner,
        active_before: &[NotificationGroupId],
        skip: Option<NotificationGroupId>,
    ) {
        let group_count_max = inner.group_count_max;
        let group_size_max = inner.group_size_max;
        let active_after = inner.store.active_ids(group_count_max);
        for group_id in active_before {
            if active_after.contains(group_id) || Some(*group_id) == skip {
                continue;
            }
            let Some(group) = inner.store.get(*group_id) else {
                continue;
            };
            let Some(key) = inner.store.key_of(*group_id) else {
                continue;
            };
            let removed = group.visible_ids(group_size_max);
            if removed.is_empty() {
                continue;
            }
            let update = PendingUpdate::Group(UpdateNotificationGroup {
                group_id: *group_id,
                kind: group.kind,
                chat_id: key.dialog_id,
                notification_settings_chat_id: key.dialog_id,
                is_silent: true,
                total_count: 0,
                added_notifications: Vec::new(),
                removed_notification_ids: removed,
            });
            self.queue_update(inner, *group_id, update);
            self.force_flush_pending_updates(inner, *group_id);
        }
        for group_id in active_after {
            if active_before.contains(&group_id) || Some(group_id) == skip {
                continue;
            }
            let Some(group) = inner.store.get(group_id) else {
                continue;
            };
            let Some(key) = inner.store.key_of(group_id) else {
                continue;
            };
            if group.notifications.is_empty() {
                continue;
            }
            let update = PendingUpdate::Group(UpdateNotificationGroup {
                group_id,
                kind: group.kind,
                chat_id: key.dialog_id,
                notification_settings_chat_id: key.dialog_id,
                is_silent: true,
                total_count: group.total_count,
                added_notifications: group.visible(group_size_max).to_vec(),
                removed_notification_ids: Vec::new(),
            });
            self.queue_update(inner, group_id, update);
        }
    }

    fn queue_update(
        &self,
        inner: &mut Inner,
        group_id: NotificationGroupId,
        update: PendingUpdate,
    ) {
        if inner.group_count_max == 0 {
            return;
        }
        inner.emitted_group_id_watermark =
            inner.emitted_group_id_watermark.max(group_id.value);
        inner.pending_updates.entry(group_id).or_default().push(update);
        inner.pending_update_count += 1;
        self.timers.flush_updates.set(
            timer_key(group_id),
            Instant::now() + Duration::from_millis(MIN_UPDATE_DELAY_MS as u64),
        );
        self.sync_have_pending(inner);
    }

    async fn flush_pending_updates(&self, group_id: NotificationGroupId) {
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed {
            return;
        }
        if inner.running_get_difference
            || inner.running_get_chat_difference.contains(&group_id)
        {
            // Resumed by the matching after_get_*.
            return;
        }
        self.force_flush_pending_updates(&mut inner, group_id);
    }

    fn force_flush_pending_updates(&self, inner: &mut Inner, group_id: NotificationGroupId) {
        self.timers.flush_updates.cancel(timer_key(group_id));
        let Some(queue) = inner.pending_updates.remove(&group_id) else {
            return;
        };
        inner.pending_update_count -= queue.len() as i32;
        let delivered = inner.delivered_total_counts.get(&group_id).copied();
        for update in coalesce(queue, delivered) {
            if let Update::NotificationGroup(u) = &update {
                inner.delivered_total_counts.insert(group_id, u.total_count);
            }
            self.bridge.emit_update(update);
        }
        self.sync_have_pending(inner);
    }

    fn flush_all_pending_updates(&self, inner: &mut Inner, include_delayed_chats: bool) {
        let group_ids: Vec<NotificationGroupId> = inner
            .pending_updates
            .keys()
            .copied()
            .filter(|group_id| {
                include_delayed_chats || !inner.running_get_chat_difference.contains(group_id)
            })
            .collect();
        for group_id in group_ids {
            self.force_flush_pending_updates(inner, group_id);
        }
    }

    fn sync_have_pending(&self, inner: &mut Inner) {
        let have_delayed = inner.delayed_group_count > 0;
        let have_unreceived = inner.pending_update_count > 0;
        if have_delayed == inner.have_delayed && have_unreceived == inner.have_unreceived {
            return;
        }
        inner.have_delayed = have_delayed;
        inner.have_unreceived = have_unreceived;
        if inner.group_count_max == 0 {
            return;
        }
        self.bridge.emit_update(Update::HavePendingNotifications(
            UpdateHavePendingNotifications {
                have_delayed_notifications: have_delayed,
                have_unreceived_notifications: have_unreceived,
            },
        ));
    }

    fn is_gated(&self, inner: &Inner, group_id: NotificationGroupId) -> bool {
        inner.running_get_difference
            || inner.running_get_chat_difference.contains(&group_id)
    }

    fn notification_delay_ms(
        &self,
        inner: &Inner,
        settings_dialog_id: DialogId,
        min_delay_ms: i64,
    ) -> i64 {
        let freshness = match self.bridge.dialog_last_online_ms(settings_dialog_id) {
            Some(last_online)
                if now_ms().saturating_sub(last_online)
                    <= inner.online_cloud_timeout_ms as u64 =>
            {
                inner.notification_cloud_delay_ms
            }
            _ => inner.notification_default_delay_ms,
        };
        min_delay_ms
            .max(freshness)
            .clamp(MIN_NOTIFICATION_DELAY_MS, MAX_UPDATE_DELAY_MS)
    }

    fn delete_group(&self, inner: &mut Inner, group_id: NotificationGroupId) {
        let Some((key, group)) = inner.store.remove(group_id) else {
            return;
        };
        inner.dialog_groups.remove(&(key.dialog_id, group.kind));
        inner.delivered_total_counts.remove(&group_id);
        self.timers.flush_notifications.cancel(timer_key(group_id));
        if !inner.calls.is_call_group(group_id)
            && group_id.value > inner.emitted_group_id_watermark
        {
            inner.available_group_ids.insert(group_id);
        }
        let persist = self.persist.clone();
        tokio::spawn(async move {
            if let Err(err) = persist.delete_group(group_id).await {
                warn!("failed to delete row of {}: {}", group_id, err);
            }
        });
    }

    fn persist_group_summary(&self, inner: &Inner, group_id: NotificationGroupId) {
        let Some(group) = inner.store.get(group_id) else {
            return;
        };
        if inner.calls.is_call_group(group_id) {
            // Call groups are ephemeral, never written back.
            return;
        }
        let Some(key) = inner.store.key_of(group_id) else {
            return;
        };
        let summary = StoredGroup {
            kind: group.kind,
            dialog_id: key.dialog_id,
            last_notification_date: key.last_notification_date,
            total_count: group.total_count,
        };
        let persist = self.persist.clone();
        tokio::spawn(async move {
            if let Err(err) = persist.save_group(group_id, &summary).await {
                warn!("failed to persist summary of {}: {}", group_id, err);
            }
        });
    }

    // --- store loading ---

    /// Materializes a group from persistence on first access. Returns false
    /// when the group exists neither in memory nor in the store.
    async fn ensure_group_loaded(&self, group_id: NotificationGroupId) -> bool {
        enum Action {
            Ready(bool),
            Wait,
            Backfill {
                before: Option<NotificationId>,
                desired: usize,
            },
            Materialize {
                desired: usize,
            },
        }
        loop {
            let action = {
                let mut inner = self.inner.lock().await;
                if inner.is_destroyed {
                    return false;
                }
                let desired = inner.keep_group_size;
                match inner.store.get_mut(group_id) {
                    Some(group) if group.loaded_from_store => Action::Ready(true),
                    Some(group) if group.loading_from_store => Action::Wait,
                    Some(group) => {
                        group.loading_from_store = true;
                        Action::Backfill {
                            before: group.notifications.first().map(|n| n.id),
                            desired,
                        }
                    }
                    None => Action::Materialize { desired },
                }
            };
            match action {
                Action::Ready(exists) => return exists,
                Action::Wait => {
                    tokio::task::yield_now().await;
                }
                Action::Backfill { before, desired } => {
                    return self.run_backfill(group_id, before, desired).await;
                }
                Action::Materialize { desired } => {
                    match self.run_materialize(group_id, desired).await {
                        Some(exists) => return exists,
                        None => continue,
                    }
                }
            }
        }
    }

    async fn run_backfill(
        &self,
        group_id: NotificationGroupId,
        before: Option<NotificationId>,
        desired: usize,
    ) -> bool {
        let summary = self.persist.load_group(group_id).await;
        let loaded = match summary {
            Ok(Some(summary)) => {
                let notifications = self
                    .persist
                    .load_notifications(group_id, before, desired)
                    .await
                    .unwrap_or_else(|err| {
                        warn!("history of {} unavailable: {}", group_id, err);
                        Vec::new()
                    });
                Some((summary, notifications))
            }
            Ok(None) => None,
            Err(err) => {
                // Treated as empty until the next access retries.
                warn!("summary of {} unavailable: {}", group_id, err);
                let mut inner = self.inner.lock().await;
                let deferred = match inner.store.get_mut(group_id) {
                    Some(group) => {
                        group.loading_from_store = false;
                        !group.pending_notifications.is_empty()
                            && group.pending_flush_at.is_none()
                    }
                    None => return false,
                };
                if deferred && !self.is_gated(&inner, group_id) {
                    self.do_flush_pending_notifications(&mut inner, group_id);
                }
                return true;
            }
        };
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed {
            return false;
        }
        let group_count_max = inner.group_count_max;
        let group_size_max = inner.group_size_max;
        let active_before = inner.store.active_ids(group_count_max);
        let was_active = active_before.contains(&group_id);
        let Some(group) = inner.store.get_mut(group_id) else {
            // Deleted while the load was in flight; discard.
            return false;
        };
        group.loading_from_store = false;
        group.loaded_from_store = true;
        let flush_deferred = if let Some((summary, notifications)) = loaded {
            let window_before: Vec<NotificationId> = if was_active {
                group.visible_ids(group_size_max)
            } else {
                Vec::new()
            };
            let first_id = group.notifications.first().map(|n| n.id);
            let prefix: Vec<Notification> = notifications
                .into_iter()
                .filter(|n| first_id.map_or(true, |first| n.id < first))
                .collect();
            if !prefix.is_empty() {
                group.notifications.splice(0..0, prefix);
            }
            group.total_count += summary.total_count;
            let last_date = group
                .last_notification_date()
                .max(summary.last_notification_date);
            inner.store.rekey(group_id, last_date);
            self.handle_activation_diff(&mut inner, &active_before, Some(group_id));
            if inner.store.is_active(group_id, group_count_max) {
                self.queue_window_extension(&mut inner, group_id, &window_before);
            }
            inner
                .store
                .get(group_id)
                .map(|group| {
                    !group.pending_notifications.is_empty()
                        && group.pending_flush_at.is_none()
                })
                .unwrap_or(false)
        } else {
            !group.pending_notifications.is_empty() && group.pending_flush_at.is_none()
        };
        if flush_deferred && !self.is_gated(&inner, group_id) {
            self.do_flush_pending_notifications(&mut inner, group_id);
        }
        true
    }

    async fn run_materialize(
        &self,
        group_id: NotificationGroupId,
        desired: usize,
    ) -> Option<bool> {
        let summary = match self.persist.load_group(group_id).await {
            Ok(Some(summary)) => summary,
            Ok(None) => return Some(false),
            Err(err) => {
                warn!("summary of {} unavailable: {}", group_id, err);
                return Some(false);
            }
        };
        let notifications = self
            .persist
            .load_notifications(group_id, None, desired)
            .await
            .unwrap_or_else(|err| {
                warn!("history of {} unavailable: {}", group_id, err);
                Vec::new()
            });
        let mut inner = self.inner.lock().await;
        if inner.is_destroyed {
            return Some(false);
        }
        if inner.store.contains(group_id) {
            // Raced with another materialization; start over.
            return None;
        }
        let group_count_max = inner.group_count_max;
        let active_before = inner.store.active_ids(group_count_max);
        let last_date = notifications
            .last()
            .map(|n| n.date)
            .unwrap_or(0)
            .max(summary.last_notification_date);
        let mut group = NotificationGroup::new(summary.kind);
        group.loaded_from_store = true;
        group.total_count = summary.total_count;
        group.notifications = notifications;
        inner.store.insert(
            NotificationGroupKey {
                last_notification_date: last_date,
                group_id,
                dialog_id: summary.dialog_id,
            },
            group,
        );
        inner
            .dialog_groups
            .insert((summary.dialog_id, summary.kind), group_id);
        self.handle_activation_diff(&mut inner, &active_before, None);
        Some(true)
    }

    /// After a backfill the visible window may have grown at its older end;
    /// the observer learns about it with an add-only update.
    fn queue_window_extension(
        &self,
        inner: &mut Inner,
        group_id: NotificationGroupId,
        window_before: &[NotificationId],
    ) {
        let group_size_max = inner.group_size_max;
        let Some(group) = inner.store.get(group_id) else {
            return;
        };
        let Some(key) = inner.store.key_of(group_id) else {
            return;
        };
        let added: Vec<Notification> = group
            .visible(group_size_max)
            .iter()
            .filter(|n| !window_before.contains(&n.id))
            .cloned()
            .collect();
        if added.is_empty() {
            return;
        }
        let update = PendingUpdate::Group(UpdateNotificationGroup {
            group_id,
            kind: group.kind,
            chat_id: key.dialog_id,
            notification_settings_chat_id: key.dialog_id,
            is_silent: true,
            total_count: group.total_count,
            added_notifications: added,
            removed_notification_ids: Vec::new(),
        });
        self.queue_update(inner, group_id, update);
    }
}

fn next_notification_id(inner: &mut Inner) -> NotificationId {
    inner.current_notification_id += 1;
    NotificationId::new(inner.current_notification_id)
}

fn next_group_id(inner: &mut Inner) -> NotificationGroupId {
    while let Some(&id) = inner.available_group_ids.iter().next() {
        inner.available_group_ids.remove(&id);
        if id.value > inner.emitted_group_id_watermark {
            return id;
        }
    }
    inner.current_group_id += 1;
    NotificationGroupId::new(inner.current_group_id)
}

fn is_duplicate_push(
    group: &NotificationGroup,
    message_id: MessageId,
    random_id: i64,
) -> bool {
    let matches = |kind: &NotificationType| match kind {
        NotificationType::NewPushMessage {
            message,
            random_id: existing,
            ..
        } => {
            (message_id.is_valid() && message.message_id == message_id)
                || (random_id != 0 && *existing == random_id)
        }
        NotificationType::NewMessage { message } => {
            message_id.is_valid() && message.message_id == message_id
        }
        _ => false,
    };
    group.notifications.iter().any(|n| matches(&n.kind))
        || group.pending_notifications.iter().any(|p| matches(&p.kind))
}

#[cfg(test)]
mod tests;
