use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

/// Result of consolidating per-chunk annotations for one document.
/// `Degraded` carries the raw merged mapping when it does not satisfy the
/// target schema; that is a signal, not a failure.
#[derive(Debug, Clone)]
pub enum Consolidated<T> {
    Typed(T),
    Degraded(Value),
}

impl<T> Consolidated<T> {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Consolidated::Degraded(_))
    }
}

/// Pairwise merge of two JSON-like values: list-valued keys concatenate
/// in order with no deduplication, mapping-valued keys deep-merge
/// recursively, anything else is last-writer-wins.
pub fn merge_values(base: Value, next: Value) -> Value {
    match (base, next) {
        (Value::Array(mut left), Value::Array(right)) => {
            left.extend(right);
            Value::Array(left)
        }
        (Value::Object(mut left), Value::Object(right)) => {
            for (key, value) in right {
                let merged = match left.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                left.insert(key, merged);
            }
            Value::Object(left)
        }
        (_, next) => next,
    }
}

fn is_usable(payload: &Value) -> bool {
    match payload {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

/// Merge all chunk annotations for one document, in original chunk order,
/// then attempt typed construction. A schema mismatch degrades to the raw
/// merged mapping; no usable chunk data at all yields `None`.
pub fn consolidate<T: DeserializeOwned>(
    source: &str,
    payloads: Vec<Value>,
) -> Option<Consolidated<T>> {
    let usable: Vec<Value> = payloads.into_iter().filter(is_usable).collect();
    if usable.is_empty() {
        info!(source, "no chunk produced usable extraction data");
        return None;
    }

    let merged = usable
        .into_iter()
        .reduce(merge_values)
        .unwrap_or(Value::Null);

    match serde_json::from_value::<T>(merged.clone()) {
        Ok(typed) => Some(Consolidated::Typed(typed)),
        Err(error) => {
            warn!(source, %error, "merged extraction failed schema validation, returning raw mapping");
            Some(Consolidated::Degraded(merged))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Labeled {
        items: Vec<String>,
        name: String,
    }

    #[test]
    fn lists_concatenate_and_scalars_take_the_last_writer() {
        let merged = [
            json!({"items": ["a"]}),
            json!({"items": ["b"], "name": "x"}),
            json!({"name": "y"}),
        ]
        .into_iter()
        .reduce(merge_values)
        .unwrap();

        assert_eq!(merged, json!({"items": ["a", "b"], "name": "y"}));
    }

    #[test]
    fn mappings_deep_merge_recursively() {
        let merged = merge_values(
            json!({"meta": {"lot": "L1", "tags": ["raw"]}}),
            json!({"meta": {"site": "plant-2", "tags": ["ocr"]}}),
        );
        assert_eq!(
            merged,
            json!({"meta": {"lot": "L1", "site": "plant-2", "tags": ["raw", "ocr"]}})
        );
    }

    #[test]
    fn list_and_mapping_merges_are_associative() {
        let a = json!({"items": ["a"], "meta": {"x": [1]}});
        let b = json!({"items": ["b"], "meta": {"x": [2]}});
        let c = json!({"items": ["c"], "meta": {"x": [3]}});

        let left = merge_values(merge_values(a.clone(), b.clone()), c.clone());
        let right = merge_values(a, merge_values(b, c));
        assert_eq!(left, right);
    }

    #[test]
    fn scalar_overwrite_is_order_sensitive() {
        let forward = merge_values(json!({"name": "x"}), json!({"name": "y"}));
        let backward = merge_values(json!({"name": "y"}), json!({"name": "x"}));
        assert_eq!(forward["name"], "y");
        assert_eq!(backward["name"], "x");
    }

    #[test]
    fn consolidation_produces_a_typed_instance() {
        let result = consolidate::<Labeled>(
            "doc.pdf",
            vec![
                json!({"items": ["a"]}),
                json!({"items": ["b"], "name": "x"}),
                json!({"name": "y"}),
            ],
        );
        match result {
            Some(Consolidated::Typed(labeled)) => {
                assert_eq!(
                    labeled,
                    Labeled {
                        items: vec!["a".to_string(), "b".to_string()],
                        name: "y".to_string(),
                    }
                );
            }
            other => panic!("expected typed consolidation, got {other:?}"),
        }
    }

    #[test]
    fn schema_mismatch_degrades_to_the_raw_mapping() {
        let result =
            consolidate::<Labeled>("doc.pdf", vec![json!({"unexpected": true})]).unwrap();
        assert!(result.is_degraded());
        match result {
            Consolidated::Degraded(raw) => assert_eq!(raw, json!({"unexpected": true})),
            Consolidated::Typed(_) => unreachable!(),
        }
    }

    #[test]
    fn no_usable_chunk_data_yields_none() {
        let result = consolidate::<Labeled>("doc.pdf", vec![Value::Null, json!({})]);
        assert!(result.is_none());

        let result = consolidate::<Labeled>("doc.pdf", Vec::new());
        assert!(result.is_none());
    }
}
