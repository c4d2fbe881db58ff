pub mod ids;
pub mod types;
pub mod updates;

pub use ids::{CallId, DialogId, MessageId, NotificationGroupId, NotificationId, UserId};
pub use types::{MessageRef, Notification, NotificationGroupType, NotificationType};
pub use updates::{
    ActiveNotificationGroup, Update, UpdateActiveNotifications, UpdateHavePendingNotifications,
    UpdateNotification, UpdateNotificationGroup,
};
