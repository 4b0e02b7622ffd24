//! Step input resolution.
//!
//! A step's effective inputs start as a copy of its config. Each entry of
//! the input mapping then reads a dotted path from the execution input, the
//! accumulated output, or the step's own config. Paths that do not resolve
//! contribute nothing and leave any config default in place.

use serde_json::{Map, Value};
use tracing::debug;

use crate::domain::{ContextSource, ExecutionContext, Step};

/// Compute the effective inputs for `step`
pub fn resolve_inputs(step: &Step, context: &ExecutionContext) -> Map<String, Value> {
    let mut inputs = step.config.clone();

    for (target, spec) in &step.input_mapping {
        let root = match spec.source() {
            ContextSource::Input => context.input(),
            ContextSource::Output => context.output(),
            ContextSource::Config => &step.config,
        };

        match get_path_in(root, spec.path()) {
            Some(value) => {
                inputs.insert(target.clone(), value.clone());
            }
            None => {
                debug!(
                    step = %step.id,
                    target = %target,
                    path = %spec.path(),
                    source = ?spec.source(),
                    "Input mapping did not resolve"
                );
            }
        }
    }

    inputs
}

/// Look up a dotted path inside `value`.
///
/// Objects are descended by key and arrays by numeric index. An empty path
/// returns `value` itself.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Look up a dotted path inside a map
pub fn get_path_in<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => (path, ""),
    };

    if head.is_empty() {
        return None;
    }

    map.get(head).and_then(|value| get_path(value, rest))
}
