//! Typed policy model built from the raw macros

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::tables::tc;

/// Traffic direction relative to the physical interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Upload, Direction::Download];

    /// Uppercase token used inside macro names
    pub fn macro_token(&self) -> &'static str {
        match self {
            Direction::Upload => "UPLOAD",
            Direction::Download => "DOWNLOAD",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated rate or ceiling, kept exactly as written in the policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Rate(String);

impl Rate {
    /// Wraps a string that already passed rate validation.
    pub(crate) fn new_unchecked(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// HTB class identifier in `major:minor` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct ClassId {
    major: String,
    minor: String,
}

impl ClassId {
    /// Class `1:<minor>` under the root scheduler
    pub fn under_root(minor: &str) -> Self {
        Self {
            major: tc::ROOT_MAJOR.to_string(),
            minor: minor.to_string(),
        }
    }

    /// The root-bound class `1:1`
    pub fn root_class() -> Self {
        Self::under_root(tc::ROOT_CLASS_MINOR)
    }

    pub fn major(&self) -> &str {
        &self.major
    }

    pub fn minor(&self) -> &str {
        &self.minor
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl From<ClassId> for String {
    fn from(id: ClassId) -> Self {
        id.to_string()
    }
}

impl FromStr for ClassId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid class id (expected major:minor): {}", s))?;

        if major.is_empty() || !major.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("Invalid class id major: {}", s));
        }
        if minor.is_empty() || !minor.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("Invalid class id minor (must be numeric): {}", s));
        }

        Ok(Self {
            major: major.to_string(),
            minor: minor.to_string(),
        })
    }
}

/// One traffic class: guaranteed rate, ceiling and scheduling priority
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassSpec {
    pub id: ClassId,
    pub priority: u8,
    pub rate: Rate,
    pub ceil: Rate,
}

/// A WAN interface and its paired IFB device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceConfig {
    /// Discovery key taken from `QOS_IF_<KEY>_NAME`
    pub key: String,
    pub name: String,
    /// Absent disables download shaping
    pub ifb: Option<String>,
    pub total_upload_bw: Rate,
    pub total_download_bw: Rate,
    pub default_upload_class: ClassSpec,
    pub default_download_class: ClassSpec,
}

impl InterfaceConfig {
    /// Device that carries the HTB tree for `direction`
    pub fn device(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Upload => Some(&self.name),
            Direction::Download => self.ifb.as_deref(),
        }
    }

    pub fn total_bandwidth(&self, direction: Direction) -> &Rate {
        match direction {
            Direction::Upload => &self.total_upload_bw,
            Direction::Download => &self.total_download_bw,
        }
    }

    pub fn default_class(&self, direction: Direction) -> &ClassSpec {
        match direction {
            Direction::Upload => &self.default_upload_class,
            Direction::Download => &self.default_download_class,
        }
    }
}

/// Service-wide class parameters for one direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectionSpec {
    /// Minor number of the service class (`1:<suffix>`)
    pub class_id_suffix: String,
    pub rate: Rate,
    pub ceil: Rate,
    pub filter_priority: u8,
}

/// Interface-specific rate/ceil replacement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateOverride {
    pub rate: Rate,
    pub ceil: Rate,
}

/// Overrides that resolved for one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InterfaceOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<RateOverride>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<RateOverride>,
}

impl InterfaceOverrides {
    pub fn get(&self, direction: Direction) -> Option<&RateOverride> {
        match direction {
            Direction::Upload => self.upload.as_ref(),
            Direction::Download => self.download.as_ref(),
        }
    }

    pub fn set(&mut self, direction: Direction, value: RateOverride) {
        match direction {
            Direction::Upload => self.upload = Some(value),
            Direction::Download => self.download = Some(value),
        }
    }
}

/// A traffic service selected by firewall mark
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceConfig {
    /// Key as listed in `QOS_SERVICE_LIST`
    pub key: String,
    pub mark: u32,
    pub priority: u8,
    pub upload: Option<DirectionSpec>,
    pub download: Option<DirectionSpec>,
    /// Keyed by device name: the physical interface for upload, the IFB for
    /// download
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub interfaces: BTreeMap<String, InterfaceOverrides>,
}

impl ServiceConfig {
    pub fn spec(&self, direction: Direction) -> Option<&DirectionSpec> {
        match direction {
            Direction::Upload => self.upload.as_ref(),
            Direction::Download => self.download.as_ref(),
        }
    }

    pub fn override_for(&self, device: &str, direction: Direction) -> Option<&RateOverride> {
        self.interfaces.get(device).and_then(|o| o.get(direction))
    }
}

/// The fully validated policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QosPlan {
    pub interfaces: Vec<InterfaceConfig>,
    pub services: Vec<ServiceConfig>,
}
