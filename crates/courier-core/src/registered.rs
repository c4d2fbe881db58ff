use crate::config::{CONTACT_SYNC_RETRY_BASE_MS, CONTACT_SYNC_RETRY_MAX_MS};
use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    NotSynced,
    Pending,
    Completed,
}

/// Reconciliation of the local contact-registered notification preference
/// with the server copy. One write may be in flight at a time; failures fall
/// back to NotSynced and retry with truncated exponential backoff.
#[derive(Debug)]
pub struct ContactRegisteredSync {
    pub state: SyncState,
    pub is_disabled: bool,
    pub failed_attempts: u32,
}

impl ContactRegisteredSync {
    /// Restores state from the persisted server-confirmed value: completed
    /// only when the stored flag matches the effective preference.
    pub fn restore(is_disabled: bool, synced: Option<bool>) -> Self {
        let state = if synced == Some(is_disabled) {
            SyncState::Completed
        } else {
            SyncState::NotSynced
        };
        Self {
            state,
            is_disabled,
            failed_attempts: 0,
        }
    }

    pub fn needs_sync(&self) -> bool {
        self.state == SyncState::NotSynced
    }

    pub fn begin_write(&mut self) {
        self.state = SyncState::Pending;
    }

    /// True when the confirmed value still matches the current preference;
    /// a preference change racing the write leaves the state unsynced.
    pub fn complete_write(&mut self, written_value: bool) -> bool {
        if self.is_disabled == written_value {
            self.state = SyncState::Completed;
            self.failed_attempts = 0;
            true
        } else {
            self.state = SyncState::NotSynced;
            false
        }
    }

    pub fn fail_write(&mut self) {
        self.state = SyncState::NotSynced;
        self.failed_attempts = self.failed_attempts.saturating_add(1);
    }

    pub fn retry_delay_ms(&self) -> u64 {
        let shift = self.failed_attempts.saturating_sub(1).min(16);
        let base = CONTACT_SYNC_RETRY_BASE_MS.saturating_mul(1 << shift);
        let capped = base.min(CONTACT_SYNC_RETRY_MAX_MS);
        capped + rand::thread_rng().gen_range(0..=capped / 2)
    }
}
