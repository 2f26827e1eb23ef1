//! RFC 6902 JSON Patch documents restricted to add/remove/replace.

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: serde_json::Value },
    Remove { path: String },
    Replace { path: String, value: serde_json::Value },
}

/// Ordered list of operations applied atomically by the API server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonPatch(pub Vec<PatchOp>);

impl JsonPatch {
    pub fn new() -> Self { Self::default() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn ops(&self) -> &[PatchOp] { &self.0 }

    pub fn add(mut self, path: impl Into<String>, value: serde_json::Value) -> Self {
        self.0.push(PatchOp::Add { path: path.into(), value });
        self
    }

    pub fn remove(mut self, path: impl Into<String>) -> Self {
        self.0.push(PatchOp::Remove { path: path.into() });
        self
    }

    pub fn replace(mut self, path: impl Into<String>, value: serde_json::Value) -> Self {
        self.0.push(PatchOp::Replace { path: path.into(), value });
        self
    }

    /// The same operations as a `json_patch` document, as sent to the API server.
    pub fn to_document(&self) -> Result<json_patch::Patch, ApiError> {
        serde_json::to_value(self)
            .and_then(serde_json::from_value::<json_patch::Patch>)
            .map_err(|e| ApiError::Invalid(e.to_string()))
    }
}

/// Escape one reference token of a JSON pointer (`~` -> `~0`, `/` -> `~1`).
pub fn escape(token: &str) -> String { token.replace('~', "~0").replace('/', "~1") }

/// Pointer to a label entry, e.g. `/metadata/labels/tars.io~1Activated`.
pub fn label_path(label: &str) -> String { format!("/metadata/labels/{}", escape(label)) }

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn escapes_label_keys() {
        assert_eq!(label_path("tars.io/Activated"), "/metadata/labels/tars.io~1Activated");
        assert_eq!(escape("a~b/c"), "a~0b~1c");
    }

    #[test]
    fn serializes_as_operation_array() {
        let p = JsonPatch::new()
            .add("/pods/0", json!({"uid": "u1"}))
            .remove("/pods/60")
            .replace("/activated", json!(false));
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(
            v,
            json!([
                {"op": "add", "path": "/pods/0", "value": {"uid": "u1"}},
                {"op": "remove", "path": "/pods/60"},
                {"op": "replace", "path": "/activated", "value": false}
            ])
        );
    }

    #[test]
    fn converts_to_a_json_patch_document() {
        let patch = JsonPatch::new().add(label_path("tars.io/Activated"), json!("false")).remove("/pods/3");
        let doc = patch.to_document().unwrap();
        assert_eq!(doc.0.len(), 2);

        let mut obj = json!({"metadata": {"labels": {}}, "pods": [0, 1, 2, 3]});
        json_patch::patch(&mut obj, &doc).unwrap();
        assert_eq!(obj, json!({"metadata": {"labels": {"tars.io/Activated": "false"}}, "pods": [0, 1, 2]}));
    }
}
