//! Dotted numeric version parsing and ordering
//!
//! Release tags for the tunnel client use up to four numeric components
//! (major.minor.build.revision). Missing trailing components compare as
//! zero, so `1.2` and `1.2.0` are the same version.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Maximum number of dotted components a version may carry.
const MAX_COMPONENTS: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid version string '{input}': {reason}")]
pub struct VersionParseError {
    pub input: String,
    pub reason: String,
}

/// An immutable release version.
///
/// Stores the components exactly as parsed so `Display` round-trips the
/// original component count, while ordering zero-extends the shorter side.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    components: Vec<u64>,
}

impl Version {
    /// Parse a dotted numeric version, e.g. `2.1.16` or `1.5.0.3`.
    pub fn parse(text: &str) -> Result<Version, VersionParseError> {
        text.parse()
    }

    /// Component at `index`, zero when absent.
    pub fn component(&self, index: usize) -> u64 {
        self.components.get(index).copied().unwrap_or(0)
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| VersionParseError {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        if s.is_empty() {
            return Err(fail("empty string"));
        }

        let mut components = Vec::with_capacity(MAX_COMPONENTS);
        for part in s.split('.') {
            if components.len() == MAX_COMPONENTS {
                return Err(fail("more than four components"));
            }
            if part.is_empty() {
                return Err(fail("empty component"));
            }
            if !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(fail("non-numeric component"));
            }
            let value = part
                .parse::<u64>()
                .map_err(|_| fail("component out of range"))?;
            components.push(value);
        }

        Ok(Version { components })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            match self.component(i).cmp(&other.component(i)) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}
