//! Semantic versions and gateway compatibility ranges.
//!
//! Release versions are always compared with semantic-version precedence,
//! so `1.9.0 < 1.10.0` even though the strings sort the other way.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A release or agent version (`MAJOR.MINOR.PATCH[-pre][+build]`).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SemVersion(semver::Version);

impl SemVersion {
    /// Parse a version string. Leading `v`, whitespace, and partial versions
    /// such as `1.2` are rejected.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.trim() != s {
            return Err(crate::Error::InvalidVersion(format!(
                "{s:?}: surrounding whitespace"
            )));
        }
        semver::Version::parse(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidVersion(format!("{s:?}: {e}")))
    }

    /// Construct from numeric components.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    /// Access the underlying semver value.
    pub fn as_semver(&self) -> &semver::Version {
        &self.0
    }

    /// True when this is a pre-release (`1.2.0-rc.1`).
    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }
}

impl Ord for SemVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for SemVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for SemVersion {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for SemVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SemVersion({})", self.0)
    }
}

impl fmt::Display for SemVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for SemVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SemVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Inclusive range of agent versions a manifest may be applied on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompatibilityRange {
    min: SemVersion,
    max: SemVersion,
}

impl CompatibilityRange {
    /// Build a range, rejecting `min > max`.
    pub fn new(min: SemVersion, max: SemVersion) -> crate::Result<Self> {
        if min > max {
            return Err(crate::Error::InvalidRange(format!(
                "min_gateway_version {min} is greater than max_gateway_version {max}"
            )));
        }
        Ok(Self { min, max })
    }

    /// Parse both bounds from strings.
    pub fn parse(min: &str, max: &str) -> crate::Result<Self> {
        Self::new(SemVersion::parse(min)?, SemVersion::parse(max)?)
    }

    pub fn min(&self) -> &SemVersion {
        &self.min
    }

    pub fn max(&self) -> &SemVersion {
        &self.max
    }

    /// True when `version` lies within `[min, max]`.
    pub fn contains(&self, version: &SemVersion) -> bool {
        &self.min <= version && version <= &self.max
    }

    /// True when `other` is entirely inside this range.
    pub fn covers(&self, other: &CompatibilityRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }
}

/// Whether an agent running `agent_version` may apply a release with `range`.
pub fn is_compatible(agent_version: &SemVersion, range: &CompatibilityRange) -> bool {
    range.contains(agent_version)
}
