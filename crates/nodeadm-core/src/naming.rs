use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Validate a single DNS label used as a container name: lowercase
/// alphanumeric + hyphens, 1-63 chars.
pub fn validate_label(label: &str, kind: &str) -> Result<()> {
    if label.is_empty() || label.len() > 63 {
        bail!("{} must be 1-63 characters, got {}", kind, label.len());
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!("{} must be lowercase alphanumeric + hyphens: {:?}", kind, label);
    }
    if label.starts_with('-') || label.ends_with('-') {
        bail!("{} must not start or end with a hyphen: {:?}", kind, label);
    }
    Ok(())
}

/// Name of the container backing a node. One container per managed node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerName(String);

impl ContainerName {
    /// Wrap an already-derived container name, validating it.
    pub fn new(name: &str) -> Result<Self> {
        validate_label(name, "Container name")?;
        Ok(Self(name.to_string()))
    }

    /// Derive the container name from a node hostname: its first DNS label.
    ///
    /// `host1.test.yahoo.com` → `host1`.
    pub fn from_hostname(hostname: &str) -> Result<Self> {
        let label = hostname.split('.').next().unwrap_or_default();
        Self::new(&label.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContainerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
