//! Structural comparison of managed-field projections.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Whether everything `desired` sets is present and equal in `observed`.
///
/// Keys absent from (or null in) `desired` are not compared, so server-defaulted fields never
/// register as drift. Arrays must match in length. An empty array, empty string or `false` on the
/// desired side also matches an absent field, so a projection can demand "nothing here".
pub fn covers(desired: &Json, observed: &Json) -> bool {
    match (desired, observed) {
        (Json::Null, _) => true,
        (Json::Object(d), Json::Object(o)) => d.iter().all(|(k, dv)| covers(dv, o.get(k).unwrap_or(&Json::Null))),
        (Json::Object(d), Json::Null) => d.values().all(|v| covers(v, &Json::Null)),
        (Json::Array(d), Json::Array(o)) => d.len() == o.len() && d.iter().zip(o).all(|(dv, ov)| covers(dv, ov)),
        (Json::Array(d), Json::Null) => d.is_empty(),
        (Json::String(s), Json::Null) => s.is_empty(),
        (Json::Bool(b), Json::Null) => !*b,
        (d, o) => d == o,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Counts of added, changed and removed leaves going from `base` to `target`; logged alongside
/// every in-place sync.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                s.updates += (0..min_len).filter(|&i| aa[i] != bb[i]).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_defaults_do_not_count_as_drift() {
        let desired = json!({"volumes": [{"name": "cfg", "secret": {"secretName": "s"}}], "pullPolicy": null});
        let observed = json!({
            "volumes": [{"name": "cfg", "secret": {"secretName": "s", "defaultMode": 420}}],
            "pullPolicy": "IfNotPresent"
        });
        assert!(covers(&desired, &observed));
    }

    #[test]
    fn removals_requested_by_empty_values_are_drift() {
        let desired = json!({"command": [], "serviceAccount": "", "hostNetwork": false});
        assert!(covers(&desired, &json!({})));
        assert!(!covers(&desired, &json!({"command": ["/bin/sh"]})));
        assert!(!covers(&desired, &json!({"serviceAccount": "admin"})));
        assert!(!covers(&desired, &json!({"hostNetwork": true})));
    }

    #[test]
    fn arrays_must_match_in_length() {
        assert!(!covers(&json!([{"name": "a"}]), &json!([{"name": "a"}, {"name": "b"}])));
        assert!(!covers(&json!([{"name": "a"}, {"name": "b"}]), &json!([{"name": "a"}])));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
        assert!(diff_summary(&base, &base).is_empty());
    }
}
