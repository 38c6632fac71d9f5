//! Strongly-typed identifiers used across the projection engine.
//!
//! Identifiers coming out of the event store are opaque strings (instance ids,
//! aggregate ids) or stable dotted names (aggregate and event types). Wrapping
//! them keeps the sequence bookkeeping from mixing up an instance with an
//! aggregate.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of an instance (tenant boundary).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

/// Identifier of an aggregate (one event stream).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

/// Stable aggregate type name (e.g. "user", "org").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateType(String);

/// Stable event type name (e.g. "user.added").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Wrap a raw value. Empty values are rejected.
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::invalid_id($name, "must not be empty"));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&'static str> for $t {
            /// Infallible conversion for compile-time constants.
            fn from(value: &'static str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $t {
            /// Values read back from storage were validated when written.
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_string_newtype!(InstanceId, "InstanceId");
impl_string_newtype!(AggregateId, "AggregateId");
impl_string_newtype!(AggregateType, "AggregateType");
impl_string_newtype!(EventType, "EventType");

impl InstanceId {
    /// Reserved key used for system-wide work that is not bound to a tenant,
    /// such as the very first catch-up across all instances.
    pub const SYSTEM: &'static str = "system";

    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    pub fn is_system(&self) -> bool {
        self.0 == Self::SYSTEM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_identifiers() {
        assert!(InstanceId::new("").is_err());
        assert!(AggregateType::new("   ").is_err());
        assert!("".parse::<EventType>().is_err());
    }

    #[test]
    fn system_instance_is_recognized() {
        assert!(InstanceId::system().is_system());
        assert!(!InstanceId::from("acme").is_system());
    }

    #[test]
    fn displays_raw_value() {
        let id = AggregateId::from("agg-1");
        assert_eq!(id.to_string(), "agg-1");
        assert_eq!(id.as_ref(), "agg-1");
    }
}
