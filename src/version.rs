// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Dotted build versions, as compared by the minimum-version and rollback
//! policies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A dotted-quad-style version. Missing trailing components compare as zero,
/// so `"1.2" == "1.2.0.0"`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version(pub Vec<u32>);

impl Version {
    /// True when updating from `self` to `target` moves to an older build.
    pub fn is_downgrade_to(&self, target: &Version) -> bool {
        target < self
    }

    /// True when this version starts with the given prefix components.
    pub fn matches_prefix(&self, prefix: &Version) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{part}")?;
            first = false;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                std::cmp::Ordering::Equal => continue,
                ord => return ord,
            }
        }
        std::cmp::Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
#[error("invalid version component: {0}")]
pub struct VersionParseError(String);

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split('.')
            .map(|p| p.parse::<u32>().map_err(|_| VersionParseError(p.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        if parts.is_empty() {
            return Err(VersionParseError(s.to_string()));
        }
        Ok(Version(parts))
    }
}

impl TryFrom<String> for Version {
    type Error = VersionParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> String {
        v.to_string()
    }
}

impl<const N: usize> From<[u32; N]> for Version {
    fn from(parts: [u32; N]) -> Self {
        Version(parts.to_vec())
    }
}
