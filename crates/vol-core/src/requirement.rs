//! Task volume requirements: `my-volume` or `group:<name>`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::MountMode;

/// Prefix that selects a volume group instead of a named volume.
pub const GROUP_PREFIX: &str = "group:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VolumeSource {
    /// A concrete volume, by its unique name.
    Name(String),
    /// Any interchangeable member of a group.
    Group(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequirementError {
    #[error("empty volume source")]
    Empty,
    #[error("empty group name in source: {0}")]
    EmptyGroup(String),
}

impl VolumeSource {
    pub fn parse(source: &str) -> Result<Self, RequirementError> {
        let source = source.trim();
        if source.is_empty() {
            return Err(RequirementError::Empty);
        }
        match source.strip_prefix(GROUP_PREFIX) {
            Some("") => Err(RequirementError::EmptyGroup(source.to_string())),
            Some(group) => Ok(VolumeSource::Group(group.to_string())),
            None => Ok(VolumeSource::Name(source.to_string())),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, VolumeSource::Group(_))
    }
}

impl fmt::Display for VolumeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeSource::Name(name) => f.write_str(name),
            VolumeSource::Group(group) => write!(f, "{GROUP_PREFIX}{group}"),
        }
    }
}

impl std::str::FromStr for VolumeSource {
    type Err = RequirementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// What a task needs from the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequirement {
    pub source: VolumeSource,
    pub mode: MountMode,
}

impl VolumeRequirement {
    pub fn new(source: &str, mode: MountMode) -> Result<Self, RequirementError> {
        Ok(Self {
            source: VolumeSource::parse(source)?,
            mode,
        })
    }
}
