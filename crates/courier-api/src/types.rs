use crate::ids::{CallId, DialogId, MessageId, NotificationId, UserId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum NotificationGroupType {
    Messages,
    Mentions,
    SecretChat,
    Calls,
}

/// Reference to the message a notification was produced from, used to
/// reconcile provisional push notifications with later authoritative data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageRef {
    pub dialog_id: DialogId,
    pub message_id: MessageId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum NotificationType {
    NewMessage {
        message: MessageRef,
    },
    NewSecretChat,
    NewCall {
        call_id: CallId,
    },
    NewPushMessage {
        message: MessageRef,
        random_id: i64,
        sender_user_id: UserId,
        sender_name: String,
        loc_key: String,
        loc_args: Vec<String>,
    },
}

impl NotificationType {
    /// Push-derived notifications are provisional and are dropped once the
    /// authoritative sync for their group completes.
    pub fn is_temporary(&self) -> bool {
        matches!(self, NotificationType::NewPushMessage { .. })
    }

    pub fn message_ref(&self) -> Option<MessageRef> {
        match self {
            NotificationType::NewMessage { message } => Some(*message),
            NotificationType::NewPushMessage { message, .. } => Some(*message),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Notification {
    pub id: NotificationId,
    pub date: i32,
    pub disable_notification: bool,
    pub kind: NotificationType,
}

impl Notification {
    pub fn message_id(&self) -> Option<MessageId> {
        self.kind.message_ref().map(|m| m.message_id)
    }
}
