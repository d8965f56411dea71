// A small JSON document engine for the CLI
//
// Every change is a JSON object whose keys are written into the document;
// `null` removes a key. Changes apply in delivery order, which is enough for
// watching replication from a terminal.

use anyhow::{Context, Result};
use meshmerge_core::{Change, MergeEngine};
use serde_json::{Map, Value};

pub struct JsonEngine;

fn apply(state: &mut Map<String, Value>, change: &Change) -> Result<Value> {
    let value: Value = serde_json::from_slice(&change.data).context("Change is not JSON")?;
    let Value::Object(fields) = value else {
        anyhow::bail!("Change {} of {} is not an object", change.seq, change.actor.short());
    };
    for (key, field) in &fields {
        if field.is_null() {
            state.remove(key);
        } else {
            state.insert(key.clone(), field.clone());
        }
    }
    Ok(Value::Object(fields))
}

impl MergeEngine for JsonEngine {
    type State = Map<String, Value>;
    type Patch = Value;

    fn init(&self) -> Self::State {
        Map::new()
    }

    fn apply_changes(&self, state: &mut Self::State, changes: &[Change]) -> Result<Value> {
        let mut patch = Map::new();
        for change in changes {
            if let Value::Object(fields) = apply(state, change)? {
                patch.extend(fields);
            }
        }
        Ok(Value::Object(patch))
    }

    fn apply_local_change(&self, state: &mut Self::State, change: &Change) -> Result<Value> {
        apply(state, change)
    }

    fn get_patch(&self, state: &Self::State) -> Value {
        Value::Object(state.clone())
    }
}
