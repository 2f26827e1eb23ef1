//! Typed label selector that renders to the API server's string syntax and can be
//! evaluated locally against a label map.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    DoesNotExist(String),
    In(String, Vec<String>),
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            // absent satisfies `!=` as it does server side
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
            Requirement::In(k, vs) => labels.get(k).map(|v| vs.contains(v)).unwrap_or(false),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{k}={v}"),
            Requirement::NotEquals(k, v) => write!(f, "{k}!={v}"),
            Requirement::Exists(k) => write!(f, "{k}"),
            Requirement::DoesNotExist(k) => write!(f, "!{k}"),
            Requirement::In(k, vs) => write!(f, "{k} in ({})", vs.join(",")),
        }
    }
}

/// Conjunction of requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    reqs: Vec<Requirement>,
}

impl Selector {
    pub fn new() -> Self { Self::default() }

    pub fn equal(mut self, k: &str, v: &str) -> Self { self.reqs.push(Requirement::Equals(k.into(), v.into())); self }
    pub fn not_equal(mut self, k: &str, v: &str) -> Self { self.reqs.push(Requirement::NotEquals(k.into(), v.into())); self }
    pub fn exists(mut self, k: &str) -> Self { self.reqs.push(Requirement::Exists(k.into())); self }
    pub fn absent(mut self, k: &str) -> Self { self.reqs.push(Requirement::DoesNotExist(k.into())); self }

    pub fn within<I, S>(mut self, k: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reqs.push(Requirement::In(k.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn requirements(&self) -> &[Requirement] { &self.reqs }
    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let empty = BTreeMap::new();
        let labels = labels.unwrap_or(&empty);
        self.reqs.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.reqs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{r}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn renders_server_syntax() {
        let s = Selector::new()
            .equal("tars.io/ServerApp", "test")
            .absent("tars.io/Deleting")
            .exists("tars.io/Deactivate")
            .within("tars.io/Version", ["v1", "v2"]);
        assert_eq!(
            s.to_string(),
            "tars.io/ServerApp=test,!tars.io/Deleting,tars.io/Deactivate,tars.io/Version in (v1,v2)"
        );
        assert_eq!(Selector::new().to_string(), "");
    }

    #[test]
    fn evaluates_locally() {
        let l = labels(&[("app", "a"), ("seq", "m")]);
        assert!(Selector::new().equal("app", "a").matches(Some(&l)));
        assert!(!Selector::new().equal("app", "b").matches(Some(&l)));
        assert!(Selector::new().not_equal("app", "b").absent("gone").matches(Some(&l)));
        assert!(Selector::new().within("seq", ["1", "m"]).matches(Some(&l)));
        assert!(!Selector::new().within("missing", ["x"]).matches(Some(&l)));
        assert!(Selector::new().matches(None));
        assert!(!Selector::new().exists("app").matches(None));
    }
}
