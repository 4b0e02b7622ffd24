//! `{{identifier}}` template interpolation.
//!
//! Identifiers are looked up in a flat variable map; dotted identifiers fall
//! back to descending into structured values. Unknown identifiers are left in
//! place verbatim.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use super::resolver::get_path_in;

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").expect("valid interpolation regex")
    })
}

/// Replace every known `{{identifier}}` in `template`
pub fn interpolate(template: &str, vars: &Map<String, Value>) -> String {
    token_regex()
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            match lookup(vars, name) {
                Some(value) => stringify(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Interpolate every string inside a JSON value
pub fn interpolate_value(value: &Value, vars: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Identifiers referenced by `template`
pub fn placeholders(template: &str) -> Vec<String> {
    token_regex()
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

fn lookup<'a>(vars: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    vars.get(name).or_else(|| get_path_in(vars, name))
}

/// Strings are inserted raw, everything else JSON-encoded
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_simple_substitution() {
        let vars = vars(json!({"name": "Ada"}));
        assert_eq!(interpolate("{{name}}", &vars), "Ada");
        assert_eq!(interpolate("Hello, {{ name }}!", &vars), "Hello, Ada!");
    }

    #[test]
    fn test_missing_token_left_verbatim() {
        let vars = vars(json!({"name": "Ada"}));
        assert_eq!(interpolate("{{missing}}", &vars), "{{missing}}");
        assert_eq!(interpolate("{{name}} and {{ other }}", &vars), "Ada and {{ other }}");
    }

    #[test]
    fn test_structured_values_json_encoded() {
        let vars = vars(json!({"list": [1, 2], "obj": {"k": "v"}, "n": 3, "flag": true}));
        assert_eq!(interpolate("{{list}}", &vars), "[1,2]");
        assert_eq!(interpolate("{{obj}}", &vars), r#"{"k":"v"}"#);
        assert_eq!(interpolate("{{n}}/{{flag}}", &vars), "3/true");
    }

    #[test]
    fn test_dotted_lookup() {
        let vars = vars(json!({"user": {"name": "Grace"}, "a.b": "flat"}));
        assert_eq!(interpolate("{{user.name}}", &vars), "Grace");
        assert_eq!(interpolate("{{a.b}}", &vars), "flat");
    }

    #[test]
    fn test_interpolate_value_recurses() {
        let vars = vars(json!({"id": 7}));
        let value = json!({"url": "/items/{{id}}", "tags": ["{{id}}"], "n": 1});
        assert_eq!(
            interpolate_value(&value, &vars),
            json!({"url": "/items/7", "tags": ["7"], "n": 1})
        );
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders("{{a}} {{ b.c }} {{a}}"), vec!["a", "b.c", "a"]);
    }
}
