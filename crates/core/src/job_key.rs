//! Job identity shared by the broker, the sync loop and the API enqueue path.
//!
//! A key is `{system_id}:{dataset}`. The system id is always rendered in the
//! canonical hyphenated UUID form, which never contains the separator, so
//! decomposition splits on the *first* separator and the dataset part may
//! contain anything (including further separators) without ambiguity.
//!
//! Broker listings can contain identities this module never produced (another
//! application sharing the broker, manual tinkering). Those are still
//! representable as a [`JobKey`] via [`JobKey::from_raw`], but
//! [`JobKey::decompose`] rejects them instead of guessing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{Dataset, SystemId};

/// Separator between the system id and the dataset.
pub const KEY_SEPARATOR: char = ':';

/// Opaque broker identity of a (system, dataset) computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

/// A key that was not produced by [`generate_key`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobKeyError {
    #[error("job key {0:?} has no ':' separator")]
    MissingSeparator(String),

    #[error("job key {key:?} does not start with a system id: {reason}")]
    InvalidSystemId { key: String, reason: String },

    #[error("job key {0:?} has an empty dataset")]
    EmptyDataset(String),

    #[error("job key {0:?} is not in canonical form")]
    NonCanonical(String),
}

impl JobKey {
    /// Deterministic, total key for a (system, dataset) pair.
    pub fn generate(system_id: SystemId, dataset: &Dataset) -> Self {
        Self(format!("{system_id}{KEY_SEPARATOR}{dataset}"))
    }

    /// Wrap an identity reported by the broker without validating it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the (system, dataset) pair this key was generated from.
    pub fn decompose(&self) -> Result<(SystemId, Dataset), JobKeyError> {
        let (system, dataset) = self
            .0
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| JobKeyError::MissingSeparator(self.0.clone()))?;

        let system_id: SystemId =
            system
                .parse()
                .map_err(|e: crate::DomainError| JobKeyError::InvalidSystemId {
                    key: self.0.clone(),
                    reason: e.to_string(),
                })?;
        let dataset =
            Dataset::new(dataset).map_err(|_| JobKeyError::EmptyDataset(self.0.clone()))?;

        // Uppercase or braced UUID spellings parse, but were never generated.
        if Self::generate(system_id, &dataset) != *self {
            return Err(JobKeyError::NonCanonical(self.0.clone()));
        }

        Ok((system_id, dataset))
    }
}

impl core::fmt::Display for JobKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<JobKey> for String {
    fn from(value: JobKey) -> Self {
        value.0
    }
}

/// Free-function form of [`JobKey::generate`].
pub fn generate_key(system_id: SystemId, dataset: &Dataset) -> JobKey {
    JobKey::generate(system_id, dataset)
}

/// Free-function form of [`JobKey::decompose`].
pub fn decompose_key(key: &JobKey) -> Result<(SystemId, Dataset), JobKeyError> {
    key.decompose()
}
