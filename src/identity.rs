//! Versioned plugin identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique key for a logical plugin across all plugin binaries.
///
/// Two identities are equal only when the id and both version numbers match,
/// so `weather 1.0` and `weather 1.1` can be registered and loaded side by side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginIdentity {
    /// Plugin id, e.g. `"weather"`
    pub id: String,
    /// Major version
    pub major_version: u32,
    /// Minor version
    pub minor_version: u32,
}

impl PluginIdentity {
    /// Create a new identity.
    pub fn new(id: impl Into<String>, major_version: u32, minor_version: u32) -> Self {
        Self {
            id: id.into(),
            major_version,
            minor_version,
        }
    }

    /// Directory name under which this plugin's static content is packaged,
    /// e.g. `"weather 1.0"`.
    pub fn content_dir_name(&self) -> String {
        format!("{} {}.{}", self.id, self.major_version, self.minor_version)
    }
}

impl fmt::Display for PluginIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.id, self.major_version, self.minor_version)
    }
}
