//! Precedence merge of configuration sources.
//!
//! Sources are combined lowest precedence first: defaults, then included
//! files, then the primary file, then explicit flag overrides. Strings and
//! other scalars replace, arrays concatenate, maps deep-merge with the later
//! source winning on conflicts.

use serde_yaml::Value;

/// Merges `overlay` onto `base`, returning the combined document.
#[must_use]
pub fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Mapping(base_map)
        }
        (Value::Sequence(mut base_seq), Value::Sequence(overlay_seq)) => {
            base_seq.extend(overlay_seq);
            Value::Sequence(base_seq)
        }
        // a null overlay does not erase configured values
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Merges an ordered list of sources, later entries overriding earlier ones.
#[must_use]
pub fn merge_all(sources: Vec<Value>) -> Value {
    sources
        .into_iter()
        .fold(Value::Null, |acc, next| match acc {
            Value::Null => next,
            acc => merge_values(acc, next),
        })
}
