//! Typed identifiers for reelforge.
//!
//! An upload session is addressed by the client-supplied logical file name.
//! The same name later becomes the merged artifact's file name, so it is
//! validated once here and every other layer can join it onto a directory
//! without re-checking.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest accepted session name, in bytes.
pub const MAX_SESSION_ID_LEN: usize = 255;

/// Identifier of one chunked upload: the logical file name being uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Validate a client-supplied file name.
    ///
    /// Rejects empty names, names over [`MAX_SESSION_ID_LEN`] bytes, path
    /// separators, NUL and any leading `.` (which also covers `.` and `..`).
    pub fn parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::invalid_argument("file name is empty"));
        }
        if name.len() > MAX_SESSION_ID_LEN {
            return Err(Error::invalid_argument(format!(
                "file name longer than {MAX_SESSION_ID_LEN} bytes"
            )));
        }
        if name.contains(['/', '\\', '\0']) {
            return Err(Error::invalid_argument(format!(
                "file name '{}' contains a path separator",
                name.escape_debug()
            )));
        }
        if name.starts_with('.') {
            return Err(Error::invalid_argument(format!(
                "file name '{name}' must not start with '.'"
            )));
        }
        Ok(Self(name))
    }

    /// The name as supplied by the client.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-cased extension without the dot, if any.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.0)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
    }
}

impl TryFrom<String> for SessionId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl std::str::FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_file_names() {
        let id = SessionId::parse("holiday clip.MOV").unwrap();
        assert_eq!(id.as_str(), "holiday clip.MOV");
        assert_eq!(id.extension().as_deref(), Some("mov"));
        assert_eq!(id.to_string(), "holiday clip.MOV");
    }

    #[test]
    fn rejects_traversal_and_separators() {
        for bad in ["", "   ", "../etc/passwd", "a/b.mp4", "a\\b.mp4", "..", ".", ".hidden"] {
            let err = SessionId::parse(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "accepted {bad:?}");
        }
    }

    #[test]
    fn rejects_nul_and_overlong() {
        assert!(SessionId::parse("a\0b").is_err());
        assert!(SessionId::parse("x".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
        assert!(SessionId::parse("x".repeat(MAX_SESSION_ID_LEN)).is_ok());
    }

    #[test]
    fn no_extension() {
        let id = SessionId::parse("README").unwrap();
        assert_eq!(id.extension(), None);
    }

    #[test]
    fn serde_round_trip_validates() {
        let id: SessionId = serde_json::from_str("\"clip.mp4\"").unwrap();
        assert_eq!(id.as_str(), "clip.mp4");
        assert!(serde_json::from_str::<SessionId>("\"../x\"").is_err());
    }
}
