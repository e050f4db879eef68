//! Query key definitions.
//!
//! A `QueryKey` identifies a cached resource and doubles as an invalidation
//! scope: invalidating a key also covers every key that extends it.

use std::fmt;

use uuid::Uuid;

/// One segment of a query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// A resource kind or named parameter, e.g. `"user"` or `"progress"`.
    Text(String),
    /// An entity identifier.
    Id(Uuid),
    /// A numeric parameter such as a page number or limit.
    Index(u64),
    /// A boolean parameter such as a visibility filter.
    Flag(bool),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Text(text) => write!(f, "{text}"),
            Segment::Id(id) => write!(f, "{id}"),
            Segment::Index(index) => write!(f, "{index}"),
            Segment::Flag(flag) => write!(f, "{flag}"),
        }
    }
}

impl From<&str> for Segment {
    fn from(value: &str) -> Self {
        Segment::Text(value.to_string())
    }
}

impl From<String> for Segment {
    fn from(value: String) -> Self {
        Segment::Text(value)
    }
}

impl From<Uuid> for Segment {
    fn from(value: Uuid) -> Self {
        Segment::Id(value)
    }
}

impl From<u64> for Segment {
    fn from(value: u64) -> Self {
        Segment::Index(value)
    }
}

impl From<u32> for Segment {
    fn from(value: u32) -> Self {
        Segment::Index(u64::from(value))
    }
}

impl From<bool> for Segment {
    fn from(value: bool) -> Self {
        Segment::Flag(value)
    }
}

/// Structured identifier for a cached resource.
///
/// Keys are ordered segment sequences; two keys are equal iff their segment
/// sequences are deep-equal. The first segment names the resource kind, so
/// distinct kinds never collide. A key is also a prefix scope:
/// `["user", u1]` covers `["user", u1, "progress"]` for invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    segments: Vec<Segment>,
}

impl QueryKey {
    /// Create a key rooted at a resource kind.
    pub fn of(kind: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::Text(kind.into())],
        }
    }

    /// Append a parameter segment.
    pub fn with(mut self, segment: impl Into<Segment>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// The ordered segments of this key.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether this key falls under `prefix`.
    ///
    /// Every key starts with itself.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, segment) in self.segments.iter().enumerate() {
            if position > 0 {
                write!(f, "/")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality() {
        let user = Uuid::nil();
        let key1 = QueryKey::of("user").with(user).with("progress");
        let key2 = QueryKey::of("user").with(user).with("progress");
        assert_eq!(key1, key2);

        let key3 = QueryKey::of("user").with(user).with("settings");
        assert_ne!(key1, key3);
    }

    #[test]
    fn distinct_kinds_never_collide() {
        let id = Uuid::nil();
        assert_ne!(QueryKey::of("course").with(id), QueryKey::of("project").with(id));
    }

    #[test]
    fn prefix_scope() {
        let user = Uuid::new_v4();
        let parent = QueryKey::of("user").with(user);
        let child = QueryKey::of("user").with(user).with("progress");

        assert!(child.starts_with(&parent));
        assert!(child.starts_with(&child));
        assert!(!parent.starts_with(&child));
        assert!(!child.starts_with(&QueryKey::of("courses")));
    }

    #[test]
    fn prefix_compares_segments_not_rendering() {
        // "ab" + "c" must not match the prefix "a" + "bc".
        let key = QueryKey::of("ab").with("c");
        let prefix = QueryKey::of("a").with("bc");
        assert!(!key.starts_with(&prefix));
    }

    #[test]
    fn display_joins_segments() {
        let key = QueryKey::of("courses").with(7u64).with(true);
        assert_eq!(key.to_string(), "courses/7/true");
    }
}
