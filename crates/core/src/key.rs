//! Reconcile key encoding.
//!
//! Simple identity keys are `"<namespace>/<name>"`. Event-carrying keys are
//! `"<namespace>/<tag>/<payload>"`; the payload is opaque (usually JSON) and may itself
//! contain `/`, so only the first two separators are significant.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("malformed reconcile key {0:?}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn parse(key: &str) -> Result<Self, KeyError> {
        match key.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok(Self::new(ns, name)),
            _ => Err(KeyError::Malformed(key.to_string())),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub namespace: String,
    pub tag: String,
    pub payload: String,
}

impl EventKey {
    pub fn new(namespace: impl Into<String>, tag: impl Into<String>, payload: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), tag: tag.into(), payload: payload.into() }
    }

    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let mut it = key.splitn(3, '/');
        match (it.next(), it.next(), it.next()) {
            (Some(ns), Some(tag), Some(payload)) if !ns.is_empty() && !tag.is_empty() && !payload.is_empty() => {
                Ok(Self::new(ns, tag, payload))
            }
            _ => Err(KeyError::Malformed(key.to_string())),
        }
    }

    /// True when `key` has the event shape and carries `tag`.
    pub fn has_tag(key: &str, tag: &str) -> bool {
        let mut it = key.splitn(3, '/');
        it.next();
        it.next() == Some(tag) && it.next().is_some()
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.tag, self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_parses_two_segments_only() {
        let k = ObjectKey::parse("tars/test-hello").unwrap();
        assert_eq!(k, ObjectKey::new("tars", "test-hello"));
        assert_eq!(k.to_string(), "tars/test-hello");
        assert!(ObjectKey::parse("tars").is_err());
        assert!(ObjectKey::parse("/x").is_err());
        assert!(ObjectKey::parse("a/b/c").is_err());
    }

    #[test]
    fn event_key_keeps_slashes_in_payload() {
        let raw = r#"tars/event/{"name":"a/b"}"#;
        let k = EventKey::parse(raw).unwrap();
        assert_eq!(k.namespace, "tars");
        assert_eq!(k.tag, "event");
        assert_eq!(k.payload, r#"{"name":"a/b"}"#);
        assert_eq!(k.to_string(), raw);
        assert!(EventKey::has_tag(raw, "event"));
        assert!(!EventKey::has_tag("tars/event", "event"));
        assert!(EventKey::parse("tars/event/").is_err());
    }
}
