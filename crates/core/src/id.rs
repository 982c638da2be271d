//! Strongly-typed identifiers used by the projection queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a queued projection task.
///
/// Assigned by the store on insert and strictly increasing, so it doubles as
/// the final tie-breaker of the polling order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(i64);

/// Identifier of the aggregate whose projection a task updates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(i64);

/// Identifier of a dead-letter record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(Uuid);

macro_rules! impl_i64_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = s
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(value))
            }
        }
    };
}

impl_i64_newtype!(TaskId, "TaskId");
impl_i64_newtype!(TargetId, "TargetId");

impl DeadLetterId {
    /// Create a new identifier (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for DeadLetterId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("DeadLetterId: {}", e)))?;
        Ok(Self(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_parse_and_display() {
        let id: TargetId = "42".parse().unwrap();
        assert_eq!(id, TargetId::new(42));
        assert_eq!(id.to_string(), "42");

        let task: TaskId = " 7 ".parse().unwrap();
        assert_eq!(task.get(), 7);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let err = "forty-two".parse::<TargetId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(ref msg) if msg.starts_with("TargetId")));

        assert!("not-a-uuid".parse::<DeadLetterId>().is_err());
    }

    #[test]
    fn task_ids_order_numerically() {
        assert!(TaskId::new(2) < TaskId::new(10));
    }
}
