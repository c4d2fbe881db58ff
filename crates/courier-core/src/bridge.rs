use crate::error::NotificationError;
use async_trait::async_trait;
use courier_api::ids::DialogId;
use courier_api::updates::Update;

/// Capability set the manager needs from its owning client. The manager keeps
/// a shared handle to this seam instead of calling back into the owner.
#[async_trait]
pub trait NotificationBridge: Send + Sync {
    /// Delivers one outbound update to the UI observer.
    fn emit_update(&self, update: Update);

    /// Last wall-clock instant the chat was known online to the server,
    /// in milliseconds, if any.
    fn dialog_last_online_ms(&self, dialog_id: DialogId) -> Option<u64>;

    /// Writes the contact-registered notification preference to the server.
    async fn write_contact_registered_preference(
        &self,
        is_disabled: bool,
    ) -> Result<(), NotificationError>;
}
