//! Strongly-typed identifiers used across the reconciliation core.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a stored PV-system definition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemId(Uuid);

impl SystemId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
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

impl Default for SystemId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for SystemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Always the lowercase hyphenated form; job keys rely on it.
        core::fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl From<Uuid> for SystemId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<SystemId> for Uuid {
    fn from(value: SystemId) -> Self {
        value.0
    }
}

impl FromStr for SystemId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| DomainError::invalid_id(format!("SystemId: {e}")))?;
        Ok(Self(uuid))
    }
}

macro_rules! impl_text_newtype {
    ($t:ident, $name:literal) => {
        impl $t {
            /// Validate and wrap a non-empty identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::validation(concat!($name, " must not be empty")));
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

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
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

/// Identifier of a background dataset a system is modelled against
/// (e.g. `NSRDB_2019`).
///
/// Datasets come from a fixed enumeration in the API layer, but storage may
/// hold rows for datasets that are no longer offered, so this stays free-form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dataset(String);

impl Dataset {
    /// The NSRDB 2019 background dataset.
    pub const NSRDB_2019: &'static str = "NSRDB_2019";

    pub fn nsrdb_2019() -> Self {
        Self(Self::NSRDB_2019.to_string())
    }
}

/// Identity of the user owning a system (the authentication subject).
///
/// Jobs carry it so the worker computes under the owner's authorization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl_text_newtype!(Dataset, "Dataset");
impl_text_newtype!(UserId, "UserId");
