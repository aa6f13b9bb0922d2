//! Last-applied snapshots and the three-way label/annotation merge

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{Result, ANNOTATION_LAST_APPLIED};

/// Serialize the desired object as its last-applied snapshot.
///
/// `status` and any previous snapshot are left out. `serde_json::Value`
/// keeps object keys sorted, so equal objects give byte-identical snapshots.
pub fn snapshot(desired: &Value) -> Result<String> {
    let mut value = desired.clone();
    if let Value::Object(map) = &mut value {
        map.remove("status");
    }
    if let Some(Value::Object(annotations)) = value.pointer_mut("/metadata/annotations") {
        annotations.remove(ANNOTATION_LAST_APPLIED);
    }
    let empty_annotations = value
        .pointer("/metadata/annotations")
        .and_then(Value::as_object)
        .is_some_and(|a| a.is_empty());
    if empty_annotations {
        if let Some(Value::Object(meta)) = value.get_mut("metadata") {
            meta.remove("annotations");
        }
    }
    Ok(serde_json::to_string(&value)?)
}

/// Labels and annotations recorded in a previous snapshot.
///
/// A missing or unreadable snapshot yields empty maps, which keeps every
/// live key.
pub fn previous_metadata(snapshot: Option<&str>) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let Some(value) = snapshot.and_then(|s| serde_json::from_str::<Value>(s).ok()) else {
        return Default::default();
    };
    (
        string_map(value.pointer("/metadata/labels")),
        string_map(value.pointer("/metadata/annotations")),
    )
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Three-way merge of one metadata map.
///
/// Desired keys win. Live keys are kept only when the previous snapshot
/// never applied them, i.e. someone else added them.
pub fn three_way(
    desired: &BTreeMap<String, String>,
    live: &BTreeMap<String, String>,
    previous: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = desired.clone();
    for (key, value) in live {
        if !desired.contains_key(key) && !previous.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn snapshot_excludes_status_and_itself() {
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "settings",
                "annotations": { ANNOTATION_LAST_APPLIED: "{\"old\":true}" }
            },
            "data": { "a": "1" },
            "status": { "phase": "Active" }
        });
        let snap = snapshot(&desired).unwrap();
        assert!(!snap.contains("status"));
        assert!(!snap.contains("old"));
        assert!(!snap.contains("annotations"));
    }

    #[test]
    fn snapshot_is_independent_of_key_order() {
        let a: Value = serde_json::from_str(r#"{"kind":"ConfigMap","apiVersion":"v1","data":{"b":"2","a":"1"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"apiVersion":"v1","data":{"a":"1","b":"2"},"kind":"ConfigMap"}"#).unwrap();
        assert_eq!(snapshot(&a).unwrap(), snapshot(&b).unwrap());
    }

    #[test]
    fn three_way_keeps_foreign_keys_and_drops_removed_ones() {
        let desired = map(&[("app", "web"), ("tier", "frontend")]);
        let live = map(&[("app", "old"), ("foo", "bar"), ("stale", "x")]);
        let previous = map(&[("app", "old"), ("stale", "x")]);

        let merged = three_way(&desired, &live, &previous);
        assert_eq!(
            merged,
            map(&[("app", "web"), ("foo", "bar"), ("tier", "frontend")])
        );
    }

    #[test]
    fn unreadable_snapshot_keeps_every_live_key() {
        let (labels, annotations) = previous_metadata(Some("not json"));
        assert!(labels.is_empty() && annotations.is_empty());

        let merged = three_way(&map(&[]), &map(&[("foo", "bar")]), &labels);
        assert_eq!(merged, map(&[("foo", "bar")]));
    }

    #[test]
    fn previous_metadata_reads_labels_and_annotations() {
        let snap = r#"{"metadata":{"labels":{"app":"web"},"annotations":{"note":"x"}}}"#;
        let (labels, annotations) = previous_metadata(Some(snap));
        assert_eq!(labels, map(&[("app", "web")]));
        assert_eq!(annotations, map(&[("note", "x")]));
    }
}
