use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Dense positive identifier of a single notification. Never reused.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(deny_unknown_fields)]
pub struct NotificationId {
    pub value: i32,
}

/// Positive identifier of a notification group.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(deny_unknown_fields)]
pub struct NotificationGroupId {
    pub value: i32,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(deny_unknown_fields)]
pub struct DialogId {
    pub value: i64,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(deny_unknown_fields)]
pub struct MessageId {
    pub value: i64,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(deny_unknown_fields)]
pub struct UserId {
    pub value: i64,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(deny_unknown_fields)]
pub struct CallId {
    pub value: i32,
}

impl NotificationId {
    pub fn new(value: i32) -> Self {
        Self { value }
    }

    pub fn is_valid(&self) -> bool {
        self.value > 0
    }
}

impl NotificationGroupId {
    pub fn new(value: i32) -> Self {
        Self { value }
    }

    pub fn is_valid(&self) -> bool {
        self.value > 0
    }
}

impl DialogId {
    pub fn new(value: i64) -> Self {
        Self { value }
    }

    pub fn is_valid(&self) -> bool {
        self.value != 0
    }
}

impl MessageId {
    pub fn new(value: i64) -> Self {
        Self { value }
    }

    pub fn is_valid(&self) -> bool {
        self.value > 0
    }
}

impl UserId {
    pub fn new(value: i64) -> Self {
        Self { value }
    }
}

impl CallId {
    pub fn new(value: i32) -> Self {
        Self { value }
    }
}

impl Display for NotificationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification {}", self.value)
    }
}

impl Display for NotificationGroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification group {}", self.value)
    }
}

impl Display for DialogId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "dialog {}", self.value)
    }
}
