use std::fmt;

use crate::{StoreError, StoreResult};

const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']', '/'];

/// Slash-separated location in the store tree. The empty path is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(raw: &str) -> StoreResult<Self> {
        let mut path = Self::root();
        for segment in raw.split('/').filter(|segment| !segment.is_empty()) {
            path = path.child(segment)?;
        }
        Ok(path)
    }

    pub fn child(&self, segment: impl AsRef<str>) -> StoreResult<Self> {
        let segment = segment.as_ref();
        validate_segment(segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self { segments })
    }

    /// True when `self` equals `other` or is one of its ancestors.
    pub fn contains(&self, other: &StorePath) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// True when a write at one path changes the subtree seen from the other.
    pub fn overlaps(&self, other: &StorePath) -> bool {
        self.contains(other) || other.contains(self)
    }
}

fn validate_segment(segment: &str) -> StoreResult<()> {
    if segment.is_empty() {
        return Err(StoreError::InvalidPath {
            path: segment.to_string(),
            reason: "empty segment",
        });
    }
    if segment.chars().any(|ch| FORBIDDEN.contains(&ch) || ch.is_control()) {
        return Err(StoreError::InvalidPath {
            path: segment.to_string(),
            reason: "segment contains a reserved character",
        });
    }
    Ok(())
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let path = StorePath::parse("/calls/r1//sessions/").unwrap();
        assert_eq!(path.segments(), ["calls", "r1", "sessions"]);
        assert_eq!(path.to_string(), "/calls/r1/sessions");
        assert_eq!(StorePath::root().to_string(), "/");
    }

    #[test]
    fn rejects_reserved_characters() {
        let err = StorePath::root().child("a.b").unwrap_err();
        assert!(matches!(err, StoreError::InvalidPath { .. }));
        assert!(StorePath::root().child("").is_err());
        assert!(StorePath::root().child("user_abc").is_ok());
    }

    #[test]
    fn containment_is_prefix_based() {
        let room = StorePath::parse("calls/r1").unwrap();
        let entry = StorePath::parse("calls/r1/sessions/u1_x").unwrap();
        let other = StorePath::parse("calls/r10").unwrap();
        assert!(room.contains(&entry));
        assert!(!entry.contains(&room));
        assert!(entry.overlaps(&room));
        assert!(!room.overlaps(&other));
        assert_eq!(entry.parent().unwrap().last(), Some("sessions"));
        assert!(StorePath::root().parent().is_none());
    }
}
