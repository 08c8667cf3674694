// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Variable pool resolution.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::model::{TaskDefinition, VarPool, WorkflowDefinition};

/// Initial pool of a run: global parameters, overridden by command parameters.
pub fn initial_var_pool(definition: &WorkflowDefinition, command_params: &VarPool) -> VarPool {
    let mut pool: VarPool = definition
        .global_params
        .iter()
        .map(|p| (p.name.clone(), p.value.clone()))
        .collect();
    for (name, value) in command_params {
        pool.insert(name.clone(), value.clone());
    }
    pool
}

/// Task parameters with every `${name}` in string values replaced from `pool`.
///
/// A reference to a missing variable is left untouched. A string that is
/// exactly one reference takes the variable's JSON value as is.
pub fn resolve_task_params(task: &TaskDefinition, pool: &VarPool) -> BTreeMap<String, Value> {
    task.params
        .iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, pool)))
        .collect()
}

fn resolve_value(value: &Value, pool: &VarPool) -> Value {
    match value {
        Value::String(s) => resolve_string(s, pool),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, pool)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, pool)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, pool: &VarPool) -> Value {
    if let Some(name) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}'))
        && !name.contains("${")
        && let Some(value) = pool.get(name)
    {
        return value.clone();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match pool.get(name) {
                    Some(Value::String(v)) => out.push_str(v),
                    Some(v) => out.push_str(&v.to_string()),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

/// Merge a successful task's var-pool delta into the workflow pool.
///
/// Only keys declared as outputs of the task are taken. Returns the number of
/// variables written.
pub fn merge_outputs(pool: &mut VarPool, task: &TaskDefinition, delta: &VarPool) -> usize {
    let mut written = 0;
    for name in &task.output_params {
        if let Some(value) = delta.get(name) {
            pool.insert(name.clone(), value.clone());
            written += 1;
        }
    }
    written
}
