//! Release version handling.
//!
//! Update manifests carry plain `major.minor.patch` version strings.
//! Anything else (pre-release suffixes, build metadata, `v` prefixes,
//! missing components) is rejected at parse time so a malformed manifest
//! can never be mistaken for an older or newer release.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A strict three-component semantic version.
///
/// Ordering is the standard major.minor.patch ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct ReleaseVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ReleaseVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for ReleaseVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(format!(
                "expected three dot-separated components, got {:?}",
                s
            ));
        }

        let mut nums = [0u32; 3];
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!("non-numeric version component {:?} in {:?}", part, s));
            }
            nums[i] = part
                .parse()
                .map_err(|_| format!("version component {:?} out of range in {:?}", part, s))?;
        }

        Ok(Self::new(nums[0], nums[1], nums[2]))
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl TryFrom<String> for ReleaseVersion {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ReleaseVersion> for String {
    fn from(v: ReleaseVersion) -> String {
        v.to_string()
    }
}
