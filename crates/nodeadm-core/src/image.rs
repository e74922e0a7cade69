use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Version reported for images without a tag.
pub const EMPTY_VERSION: &str = "0.0.0";

/// A container image reference: `repository[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DockerImage(String);

impl DockerImage {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Repository part, without the tag.
    pub fn repository(&self) -> &str {
        match self.tag_separator() {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// Tag part, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag_separator().map(|idx| &self.0[idx + 1..])
    }

    /// The tag interpreted as the software version running in the image.
    pub fn tag_as_version(&self) -> String {
        self.tag().unwrap_or(EMPTY_VERSION).to_string()
    }

    /// Same repository, different tag.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self(format!("{}:{}", self.repository(), tag))
    }

    // A ':' only separates a tag if it comes after the last '/', otherwise
    // it is a registry port (`registry:5000/image`).
    fn tag_separator(&self) -> Option<usize> {
        let idx = self.0.rfind(':')?;
        match self.0.rfind('/') {
            Some(slash) if slash > idx => None,
            _ => Some(idx),
        }
    }
}

impl FromStr for DockerImage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            bail!("Docker image reference must not be empty");
        }
        if s.chars().any(char::is_whitespace) {
            bail!("Docker image reference must not contain whitespace: {:?}", s);
        }
        if s.ends_with(':') || s.ends_with('/') {
            bail!("Docker image reference is truncated: {:?}", s);
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for DockerImage {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DockerImage> for String {
    fn from(image: DockerImage) -> Self {
        image.0
    }
}

impl fmt::Display for DockerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
