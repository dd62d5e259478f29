//! Shallow state diffs.
//!
//! A diff holds every top-level key whose value changed. Object values are
//! compared one level deeper so a moving axis only sends that axis. Keys that
//! disappeared are sent as `null`.

use serde_json::{Map, Value};

pub type StateMap = Map<String, Value>;

/// Changes that turn `previous` into `next`, or `None` when they are equal.
pub fn diff(previous: &StateMap, next: &StateMap) -> Option<StateMap> {
    let mut changes = StateMap::new();

    for (key, value) in next {
        match (previous.get(key), value) {
            (Some(old), new) if old == new => {}
            (Some(Value::Object(old)), Value::Object(new)) => {
                changes.insert(key.clone(), Value::Object(diff_flat(old, new)));
            }
            _ => {
                changes.insert(key.clone(), value.clone());
            }
        }
    }

    for key in previous.keys() {
        if !next.contains_key(key) {
            changes.insert(key.clone(), Value::Null);
        }
    }

    (!changes.is_empty()).then_some(changes)
}

fn diff_flat(previous: &StateMap, next: &StateMap) -> StateMap {
    let mut changes: StateMap = next
        .iter()
        .filter(|(key, value)| previous.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    for key in previous.keys() {
        if !next.contains_key(key) {
            changes.insert(key.clone(), Value::Null);
        }
    }
    changes
}

/// Apply a diff produced by [`diff`] to `state`.
pub fn apply(state: &mut StateMap, changes: &StateMap) {
    for (key, value) in changes {
        match (state.get_mut(key), value) {
            (_, Value::Null) => {
                state.remove(key);
            }
            (Some(Value::Object(current)), Value::Object(nested)) => {
                for (inner_key, inner_value) in nested {
                    if inner_value.is_null() {
                        current.remove(inner_key);
                    } else {
                        current.insert(inner_key.clone(), inner_value.clone());
                    }
                }
            }
            _ => {
                state.insert(key.clone(), value.clone());
            }
        }
    }
}
