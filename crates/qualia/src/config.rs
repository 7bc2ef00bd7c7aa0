//! Layered configuration tree: `Item = Scalar | Fixed | Path | List | Dict`.
//!
//! Merge precedence follows `orca::config::loader`'s dual-location config loader; the
//! schema shape follows the Python `qualia.config` module's class tree, recast here
//! as a plain sum type with exhaustive matching rather than polymorphic dispatch.
//!
//! `diff`, `merge`, and `verify` are inherent methods on `Item` rather than virtual
//! calls, so adding a new kind is a compile error everywhere a match isn't exhaustive.

use crate::error::{QualiaError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A dotted-path configuration error, e.g. `metadata.tags.type`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{path}: {message}")]
pub struct ConstrainedError {
    pub path: String,
    pub message: String,
}

impl ConstrainedError {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self { path: path.to_string(), message: message.into() }
    }
}

/// The primitive JSON types a [`Item::Scalar`] may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    String,
    Bool,
    Integer,
    Float,
}

impl ScalarKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ScalarKind::String => value.is_string(),
            ScalarKind::Bool => value.is_boolean(),
            ScalarKind::Integer => value.is_i64() || value.is_u64(),
            ScalarKind::Float => value.is_f64() || value.is_i64() || value.is_u64(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ScalarKind::String => "string",
            ScalarKind::Bool => "bool",
            ScalarKind::Integer => "integer",
            ScalarKind::Float => "number",
        }
    }
}

/// One node of the configuration tree.
#[derive(Debug, Clone)]
pub enum Item {
    /// A value of a declared primitive type, or one of a finite set of strings.
    Scalar { kind: ScalarKind, enum_values: Option<Vec<String>>, default: Value },
    /// A value that cannot change once set; attempts to override fail verification.
    Fixed(Value),
    /// A scalar string with `~` expanded to the home directory at merge time.
    Path(Option<PathBuf>),
    /// A list whose every element must validate against the inner kind.
    List(Box<Item>),
    /// A nested map of named kinds, plus an optional catch-all for unknown keys.
    Dict { fields: BTreeMap<String, Item>, others: Option<Box<Item>> },
}

impl Item {
    pub fn scalar(kind: ScalarKind, default: Value) -> Self {
        Item::Scalar { kind, enum_values: None, default }
    }

    pub fn enum_of(values: &[&str], default: &str) -> Self {
        Item::Scalar {
            kind: ScalarKind::String,
            enum_values: Some(values.iter().map(|s| s.to_string()).collect()),
            default: Value::String(default.to_string()),
        }
    }

    pub fn dict(fields: BTreeMap<String, Item>, others: Option<Item>) -> Self {
        Item::Dict { fields, others: others.map(Box::new) }
    }

    /// Validate `value` (as read from a config file, before merge) against this node's
    /// shape. Runs before `merge`; `merge` itself never fails.
    pub fn verify(&self, path: &str, value: Option<&Value>) -> Result<()> {
        let Some(value) = value else { return Ok(()) };
        if value.is_null() {
            return Ok(());
        }

        match self {
            Item::Scalar { kind, enum_values, .. } => {
                if !kind.matches(value) {
                    return Err(ConstrainedError::new(path, format!("must be a {}", kind.name())).into());
                }
                if let Some(allowed) = enum_values {
                    let s = value.as_str().unwrap_or_default();
                    if !allowed.iter().any(|a| a == s) {
                        return Err(ConstrainedError::new(
                            path,
                            format!("must be one of {}", allowed.join(", ")),
                        )
                        .into());
                    }
                }
                Ok(())
            }
            Item::Fixed(expected) => {
                if value != expected {
                    Err(ConstrainedError::new(path, "cannot be changed").into())
                } else {
                    Ok(())
                }
            }
            Item::Path(_) => {
                if !value.is_string() {
                    Err(ConstrainedError::new(path, "must be a string").into())
                } else {
                    Ok(())
                }
            }
            Item::List(inner) => {
                let Value::Array(items) = value else {
                    return Err(ConstrainedError::new(path, "must be a list").into());
                };
                for (i, item) in items.iter().enumerate() {
                    inner.verify(&format!("{path}[{i}]"), Some(item))?;
                }
                Ok(())
            }
            Item::Dict { fields, others } => {
                let Value::Object(map) = value else {
                    return Err(ConstrainedError::new(path, "must be a map").into());
                };
                for (key, item) in fields {
                    let child_path = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                    item.verify(&child_path, map.get(key))?;
                }
                let extra: Vec<&String> = map.keys().filter(|k| !fields.contains_key(*k)).collect();
                if extra.is_empty() {
                    return Ok(());
                }
                match others {
                    Some(other_item) => {
                        for key in extra {
                            let child_path = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                            other_item.verify(&child_path, map.get(key))?;
                        }
                        Ok(())
                    }
                    None => Err(ConstrainedError::new(
                        path,
                        format!("unexpected keys: {}", extra.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")),
                    )
                    .into()),
                }
            }
        }
    }

    /// Merge a possibly-partial `value` over this node's defaults. Total: never fails.
    pub fn merge(&self, value: Option<&Value>) -> Value {
        match self {
            Item::Scalar { default, .. } => value.cloned().unwrap_or_else(|| default.clone()),
            Item::Fixed(v) => v.clone(),
            Item::Path(default) => {
                let raw = value
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| default.as_ref().map(|p| p.display().to_string()));
                match raw {
                    Some(s) => Value::String(expand_home(&s)),
                    None => Value::Null,
                }
            }
            Item::List(inner) => match value {
                Some(Value::Array(items)) => {
                    Value::Array(items.iter().map(|i| inner.merge(Some(i))).collect())
                }
                _ => Value::Array(vec![]),
            },
            Item::Dict { fields, others } => {
                let input = value.and_then(Value::as_object);
                let mut out = serde_json::Map::new();
                for (key, item) in fields {
                    out.insert(key.clone(), item.merge(input.and_then(|m| m.get(key))));
                }
                if let (Some(other_item), Some(input)) = (others, input) {
                    for (key, v) in input {
                        if !fields.contains_key(key) {
                            out.insert(key.clone(), other_item.merge(Some(v)));
                        }
                    }
                }
                Value::Object(out)
            }
        }
    }

    /// The set of keys present in `new` but absent from (or different to) `old`, one
    /// level deep -- used by `qualia field list` to show what a config edit changed.
    pub fn diff(&self, old: &Value, new: &Value) -> Option<Value> {
        if old == new {
            return None;
        }
        match self {
            Item::Dict { fields, .. } => {
                let old_map = old.as_object();
                let new_map = new.as_object()?;
                let mut out = serde_json::Map::new();
                for (key, item) in fields {
                    let old_v = old_map.and_then(|m| m.get(key)).cloned().unwrap_or(Value::Null);
                    let new_v = new_map.get(key).cloned().unwrap_or(Value::Null);
                    if let Some(d) = item.diff(&old_v, &new_v) {
                        out.insert(key.clone(), d);
                    }
                }
                if out.is_empty() { None } else { Some(Value::Object(out)) }
            }
            _ => Some(new.clone()),
        }
    }
}

fn expand_home(s: &str) -> String {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).display().to_string();
        }
    } else if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.display().to_string();
        }
    }
    s.to_string()
}

impl From<ConstrainedError> for QualiaError {
    fn from(e: ConstrainedError) -> Self {
        QualiaError::Constrained(e)
    }
}

/// Load a YAML config file, verify it, and merge it over `base`'s defaults.
/// A missing file is treated as an empty override (matches `qualia.config.load`).
pub fn load_merged(path: &std::path::Path, base: &Item) -> Result<Value> {
    let user_value: Value = match std::fs::read(path) {
        Ok(bytes) => serde_yaml::from_slice(&bytes).map_err(|e| QualiaError::Config(e.to_string()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Null,
        Err(e) => return Err(e.into()),
    };

    base.verify("", Some(&user_value))?;
    Ok(base.merge(Some(&user_value)))
}

/// Where the user-level config file lives: `$XDG_CONFIG_HOME/qualia.yaml`, falling
/// back to `~/.config/qualia.yaml`.
pub fn default_config_path() -> PathBuf {
    let config_home = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs::home_dir().unwrap_or_default().join(".config"));
    config_home.join("qualia.yaml")
}

/// The top-level `qualia.yaml` shape: just `database_path` for now, with an open
/// catch-all for the field declarations plugins add over time.
pub fn schema() -> Item {
    let mut fields = BTreeMap::new();
    fields.insert("database_path".to_string(), Item::Path(None));
    Item::dict(fields, Some(Item::scalar(ScalarKind::String, Value::Null)))
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Item {
        let mut fields = BTreeMap::new();
        fields.insert("database_path".to_string(), Item::Path(None));
        fields.insert("version".to_string(), Item::scalar(ScalarKind::Integer, json!(null)));
        Item::dict(fields, Some(Item::scalar(ScalarKind::String, json!(""))))
    }

    #[test]
    fn merge_fills_in_defaults() {
        let item = sample();
        let merged = item.merge(Some(&json!({"version": 3})));
        assert_eq!(merged["version"], json!(3));
    }

    #[test]
    fn verify_rejects_wrong_type() {
        let item = sample();
        let err = item.verify("", Some(&json!({"version": "nope"}))).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn verify_allows_catch_all_others() {
        let item = sample();
        assert!(item.verify("", Some(&json!({"database_path": "~/db", "custom": "x"}))).is_ok());
    }

    #[test]
    fn fixed_item_rejects_override() {
        let item = Item::Fixed(json!("id"));
        assert!(item.verify("type", Some(&json!("text"))).is_err());
        assert!(item.verify("type", Some(&json!("id"))).is_ok());
    }
}
