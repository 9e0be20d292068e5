//! OS version parsing and ordering.
//!
//! Inventory providers report versions like `13.2`, `14.4.1` or `v12.7.6`.
//! Missing components are treated as zero, so `13.2 == 13.2.0`. Pre-release
//! tags after `-` and build metadata after `+` are dropped at parse time, so
//! `14.4.1-rc1` satisfies a `14.4.1` requirement.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced when a version string cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("empty version string")]
    Empty,

    #[error("malformed version {input:?}: {reason}")]
    Malformed { input: String, reason: String },
}

/// A numeric `major.minor.patch` version. Field order gives the ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OsVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl OsVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// True when `self` is at least `required`.
    pub fn satisfies(&self, required: &OsVersion) -> bool {
        self >= required
    }
}

impl FromStr for OsVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }

        let malformed = |reason: &str| VersionError::Malformed {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let body = body.split('+').next().unwrap_or(body);

        let core = match body.split_once('-') {
            Some((core, tag)) if !tag.is_empty() => core,
            Some(_) => return Err(malformed("empty pre-release tag")),
            None => body,
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() > 3 {
            return Err(malformed("more than three components"));
        }

        let mut nums = [0u64; 3];
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                return Err(malformed("empty component"));
            }
            nums[i] = part
                .parse()
                .map_err(|_| malformed(&format!("component {part:?} is not a number")))?;
        }

        Ok(Self {
            major: nums[0],
            minor: nums[1],
            patch: nums[2],
        })
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Whether `reported` is at or above `required`.
///
/// Either side failing to parse is an error for this single comparison.
pub fn meets_requirement(reported: &str, required: &str) -> Result<bool, VersionError> {
    let reported: OsVersion = reported.parse()?;
    let required: OsVersion = required.parse()?;
    Ok(reported.satisfies(&required))
}
