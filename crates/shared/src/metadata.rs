//! Bounded key/value annotations attached to usage events
//!
//! Limits follow the payment processor's metadata rules so that event
//! metadata can be forwarded verbatim: at most 50 keys, keys up to 40
//! characters of `[A-Za-z0-9_.-]`, values up to 500 characters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

pub const MAX_METADATA_ENTRIES: usize = 50;
pub const MAX_METADATA_KEY_LEN: usize = 40;
pub const MAX_METADATA_VALUE_LEN: usize = 500;

/// Typed, size-bounded string map for traceability context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct EventMetadata(BTreeMap<String, String>);

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, rejecting anything outside the bounds
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), DomainError> {
        let key = key.into();
        let value = value.into();
        validate_key(&key)?;

        if value.chars().count() > MAX_METADATA_VALUE_LEN {
            return Err(DomainError::Metadata(format!(
                "value for '{}' exceeds {} characters",
                key, MAX_METADATA_VALUE_LEN
            )));
        }

        if !self.0.contains_key(&key) && self.0.len() >= MAX_METADATA_ENTRIES {
            return Err(DomainError::Metadata(format!(
                "at most {} entries allowed",
                MAX_METADATA_ENTRIES
            )));
        }

        self.0.insert(key, value);
        Ok(())
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Result<Self, DomainError> {
        self.insert(key, value)?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn validate_key(key: &str) -> Result<(), DomainError> {
    if key.is_empty() || key.len() > MAX_METADATA_KEY_LEN {
        return Err(DomainError::Metadata(format!(
            "key must be 1-{} characters: '{}'",
            MAX_METADATA_KEY_LEN, key
        )));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(DomainError::Metadata(format!(
            "key contains unsupported characters: '{}'",
            key
        )));
    }
    Ok(())
}

impl TryFrom<BTreeMap<String, String>> for EventMetadata {
    type Error = DomainError;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        let mut metadata = Self::new();
        for (key, value) in map {
            metadata.insert(key, value)?;
        }
        Ok(metadata)
    }
}

impl From<EventMetadata> for BTreeMap<String, String> {
    fn from(metadata: EventMetadata) -> Self {
        metadata.0
    }
}
