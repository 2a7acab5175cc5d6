//! # Channels and Subject Mapping
//!
//! Handlers speak in logical [`Channel`]s; the wire speaks in [`BusSubject`]s.
//! The [`ChannelMapper`] translates in both directions so a deployment can
//! rename subjects without touching service code. Unmapped names pass through
//! unchanged.

use crate::error::CubeError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::warn;

/// Logical, deployment-independent channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

/// Physical subject name used on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusSubject(String);

macro_rules! name_type {
    ($ty:ident) => {
        impl $ty {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(name: &str) -> Self {
                Self(name.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(name: String) -> Self {
                Self(name)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

name_type!(Channel);
name_type!(BusSubject);

/// Immutable bidirectional lookup between channels and subjects.
#[derive(Debug, Clone, Default)]
pub struct ChannelMapper {
    to_physical: HashMap<Channel, BusSubject>,
    to_logical: HashMap<BusSubject, Channel>,
}

impl ChannelMapper {
    /// Build the mapper from a `logical → physical` table.
    ///
    /// With `strict`, two channels mapped to the same subject is a
    /// configuration error. Otherwise the inverse lookup keeps the channel
    /// that sorts last, so resolution does not depend on hash order.
    pub fn new(mapping: BTreeMap<Channel, BusSubject>, strict: bool) -> Result<Self, CubeError> {
        let mut to_logical: HashMap<BusSubject, Channel> = HashMap::with_capacity(mapping.len());

        for (channel, subject) in &mapping {
            if let Some(previous) = to_logical.insert(subject.clone(), channel.clone()) {
                if strict {
                    return Err(CubeError::Configuration(format!(
                        "channels {previous} and {channel} both map to subject {subject}"
                    )));
                }
                warn!(
                    subject = %subject,
                    replaced = %previous,
                    channel = %channel,
                    "Duplicate subject mapping, last channel wins"
                );
            }
        }

        Ok(Self {
            to_physical: mapping.into_iter().collect(),
            to_logical,
        })
    }

    /// Mapper with no entries: every name maps to itself.
    #[must_use]
    pub fn identity() -> Self {
        Self::default()
    }

    /// Subject for a channel.
    #[must_use]
    pub fn to_physical(&self, channel: &Channel) -> BusSubject {
        self.to_physical
            .get(channel)
            .cloned()
            .unwrap_or_else(|| BusSubject::new(channel.as_str()))
    }

    /// Channel for a subject.
    #[must_use]
    pub fn to_logical(&self, subject: &BusSubject) -> Channel {
        self.to_logical
            .get(subject)
            .cloned()
            .unwrap_or_else(|| Channel::new(subject.as_str()))
    }

    /// Number of explicit mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.to_physical.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_physical.is_empty()
    }
}
