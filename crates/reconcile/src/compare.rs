//! Desired-versus-observed comparison helpers.
//!
//! Observed documents are supersets of what we send (ids, urls, timestamps),
//! so every comparison walks the desired side only.

use serde_json::{Map, Value as Json};

/// Order-insensitive equality for sets of comparable keys.
pub fn same_set<T: Ord + Clone>(a: &[T], b: &[T]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    a.dedup();
    b.sort();
    b.dedup();
    a == b
}

/// The service leaves empty strings and nulls out of its documents.
fn blank(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::String(s) => s.is_empty(),
        _ => false,
    }
}

/// True when every field present in `desired` has the same value in
/// `observed`. Arrays compare as sets of elements; extra observed fields
/// never count as drift, and a missing one matches a blank desired value.
pub fn covers(desired: &Json, observed: &Json) -> bool {
    match (desired, observed) {
        (Json::Object(d), Json::Object(o)) => d.iter().all(|(k, dv)| o.get(k).map(|ov| covers(dv, ov)).unwrap_or_else(|| blank(dv))),
        (Json::Array(d), Json::Array(o)) => {
            d.len() == o.len() && d.iter().all(|dv| o.iter().any(|ov| covers(dv, ov))) && o.iter().all(|ov| d.iter().any(|dv| covers(dv, ov)))
        }
        (Json::Number(a), Json::Number(b)) => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

/// Keys among `keys` whose desired value is not covered by the observed one.
pub fn changed_keys<'k>(desired: &Map<String, Json>, observed: &Json, keys: &[&'k str]) -> Vec<&'k str> {
    keys.iter()
        .copied()
        .filter(|k| match desired.get(*k) {
            Some(dv) => !observed.get(*k).map(|ov| covers(dv, ov)).unwrap_or_else(|| blank(dv)),
            None => false,
        })
        .collect()
}

/// The narrowest patch: only the changed keys, with their desired values.
pub fn patch_body(desired: &Map<String, Json>, observed: &Json, keys: &[&str]) -> Option<Json> {
    let changed = changed_keys(desired, observed, keys);
    if changed.is_empty() {
        return None;
    }
    let mut out = Map::new();
    for k in changed {
        if let Some(v) = desired.get(k) {
            out.insert(k.to_string(), v.clone());
        }
    }
    Some(Json::Object(out))
}

/// String field of an observed document, empty when absent.
pub fn str_field<'a>(v: &'a Json, key: &str) -> &'a str { v.get(key).and_then(Json::as_str).unwrap_or("") }

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_set_ignores_order_and_duplicates() {
        assert!(same_set(&["b", "a"], &["a", "b", "a"]));
        assert!(!same_set(&["a"], &["a", "c"]));
    }

    #[test]
    fn covers_ignores_server_fields_and_array_order() {
        let desired = json!({"name": "r", "tags": ["x", "y"], "n": 1});
        let observed = json!({"name": "r", "tags": ["y", "x"], "n": 1.0, "id": "9", "url": "https://e/9"});
        assert!(covers(&desired, &observed));
        assert!(!covers(&json!({"name": "s"}), &observed));
        assert!(!covers(&json!({"tags": ["x"]}), &observed));
    }

    #[test]
    fn covers_treats_missing_observed_as_blank() {
        assert!(covers(&json!({"x": null}), &json!({})));
        assert!(covers(&json!({"x": ""}), &json!({})));
        assert!(!covers(&json!({"x": 1}), &json!({})));
        assert!(!covers(&json!({"x": ""}), &json!({"x": "set"})));
    }

    #[test]
    fn omitted_empty_description_is_not_changed() {
        let desired = json!({"name": "a", "description": ""});
        let d = desired.as_object().unwrap();
        assert!(changed_keys(d, &json!({"name": "a"}), &["name", "description"]).is_empty());
        assert_eq!(changed_keys(d, &json!({"name": "a", "description": "old"}), &["description"]), vec!["description"]);
    }

    #[test]
    fn patch_body_contains_only_changed_allowed_keys() {
        let desired = json!({"name": "a", "description": "new", "visibility": "private"});
        let observed = json!({"name": "a", "description": "old", "visibility": "public", "state": "wellFormed"});
        let d = desired.as_object().unwrap();
        let p = patch_body(d, &observed, &["name", "description"]).unwrap();
        assert_eq!(p, json!({"description": "new"}));
        assert!(patch_body(d, &observed, &["name"]).is_none());
    }
}
