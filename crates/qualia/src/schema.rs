//! Field schema: the typed, aliasable vocabulary of properties an object may carry.
//!
//! A field's type is pinned the first time it's written -- the schema itself only
//! tracks declarations made in-process (via [`FieldSchema::declare`]); the backing
//! store is responsible for comparing a declaration against what's already on disk
//! and raising [`crate::error::QualiaError::FieldConfigChanged`] on a mismatch.

use crate::error::{QualiaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// The type a field's values are constrained to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Matched case-sensitively and in full.
    ExactText,
    /// Free text; supports substring/regexp matching.
    Text,
    /// A single opaque token, exact match only -- the content hash's own type.
    Id,
    /// A number, supports `between` range queries.
    Number,
    /// A string drawn from a small, repeated vocabulary (e.g. tags).
    Keyword,
    /// An RFC 3339 datetime, supports `between` range queries.
    Datetime,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::ExactText => "exact_text",
            FieldType::Text => "text",
            FieldType::Id => "id",
            FieldType::Number => "number",
            FieldType::Keyword => "keyword",
            FieldType::Datetime => "datetime",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "exact_text" => Some(FieldType::ExactText),
            "text" => Some(FieldType::Text),
            "id" => Some(FieldType::Id),
            "number" => Some(FieldType::Number),
            "keyword" => Some(FieldType::Keyword),
            "datetime" => Some(FieldType::Datetime),
            _ => None,
        }
    }

    /// Whether a JSON value parses as this field's type, for `set`/`update` calls.
    pub fn validate(&self, value: &serde_json::Value) -> bool {
        match self {
            FieldType::ExactText | FieldType::Text | FieldType::Keyword | FieldType::Id => value.is_string(),
            FieldType::Number => value.is_i64() || value.is_u64() || value.is_f64(),
            FieldType::Datetime => value
                .as_str()
                .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false),
        }
    }

    /// Infer a field's type from the value it's first written with -- fields are
    /// added lazily, with no prior declaration required.
    pub fn infer(value: &serde_json::Value) -> FieldType {
        match value {
            serde_json::Value::Number(_) => FieldType::Number,
            serde_json::Value::String(s) if chrono::DateTime::parse_from_rfc3339(s).is_ok() => FieldType::Datetime,
            _ => FieldType::Text,
        }
    }
}

/// A single field's declared shape.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub aliases: Vec<String>,
    /// Whether callers may `set`/`update` this field directly.
    pub read_only: bool,
    /// Whether `qualia show`/`qualia field list` surfaces it by default.
    pub shown: bool,
}

impl FieldDescriptor {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self { name: name.to_string(), field_type, aliases: Vec::new(), read_only: false, shown: true }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.shown = false;
        self
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// The registry of declared fields, plus the alias -> canonical name map used to
/// rewrite query terms and CLI shorthand.
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    fields: HashMap<String, FieldDescriptor>,
    aliases: HashMap<String, String>,
    /// Fields declared outside of [`builtin_fields`] -- either inferred lazily on
    /// first write, or reloaded from a prior open's `state` file. Tracked separately
    /// so [`FieldSchema::custom_fields`] can persist exactly these across opens.
    custom: std::collections::BTreeSet<String>,
}

impl FieldSchema {
    pub fn new() -> Self {
        let mut schema = Self::default();
        for descriptor in builtin_fields() {
            schema.declare(descriptor).expect("builtin fields never collide");
        }
        schema
    }

    /// Add a field to the registry. Fails if its name or an alias is already taken
    /// by a *different* field -- re-declaring the same field with the same type is a
    /// no-op, since plugins may run `declare` on every load.
    pub fn declare(&mut self, descriptor: FieldDescriptor) -> Result<()> {
        if let Some(existing) = self.fields.get(&descriptor.name) {
            if existing.field_type != descriptor.field_type {
                return Err(QualiaError::FieldConfigChanged {
                    field: descriptor.name.clone(),
                    existing: existing.field_type.as_str().to_string(),
                    requested: descriptor.field_type.as_str().to_string(),
                });
            }
        }
        for alias in &descriptor.aliases {
            if let Some(target) = self.aliases.get(alias) {
                if target != &descriptor.name {
                    return Err(QualiaError::FieldConfigChanged {
                        field: alias.clone(),
                        existing: target.clone(),
                        requested: descriptor.name.clone(),
                    });
                }
            }
            self.aliases.insert(alias.clone(), descriptor.name.clone());
        }
        self.fields.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Resolve a field name or alias to its canonical name.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        if self.fields.contains_key(name) {
            return name;
        }
        self.aliases.get(name).map(|s| s.as_str()).unwrap_or(name)
    }

    pub fn get(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(self.resolve(name))
    }

    pub fn require(&self, name: &str) -> Result<&FieldDescriptor> {
        self.get(name).ok_or_else(|| QualiaError::FieldDoesNotExist(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.values()
    }

    /// Resolve a field, lazily declaring it with a type inferred from `value` if it
    /// has never been written before. A `null` value never triggers inference -- it only makes
    /// sense as a merge-patch removal of a field that must already exist.
    pub fn require_or_infer(&mut self, name: &str, value: &serde_json::Value) -> Result<&FieldDescriptor> {
        if value.is_null() || self.get(name).is_some() {
            return self.require(name);
        }
        let canonical = self.resolve(name).to_string();
        self.declare(FieldDescriptor::new(&canonical, FieldType::infer(value)))?;
        self.custom.insert(canonical);
        self.require(name)
    }

    /// Fields declared outside of [`builtin_fields`] -- the ones that need to survive
    /// into the next [`FieldSchema::load_persisted`] call.
    pub fn custom_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.custom.iter().filter_map(|name| self.fields.get(name))
    }

    /// Re-declare every custom field recorded in a prior open's `state` file, so a
    /// lazily-inferred field's type stays pinned across `Database::open` instead of
    /// resetting to builtins-only each time. Fatal on the first field whose recorded
    /// type no longer matches this schema's declaration (see
    /// [`Self::load_persisted_tolerant`] for the read-only degrade path).
    pub fn load_persisted(&mut self, state_path: &Path) -> Result<()> {
        match self.load_persisted_tolerant(state_path)?.into_iter().next() {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Like [`Self::load_persisted`], but never aborts on a field-type mismatch -- a
    /// drifted field is left with whatever type this schema already had for it (its
    /// first, successful declaration wins) and the mismatch is returned to the caller
    /// instead of raised. Used by `Database::open` to implement spec's read-only
    /// schema-drift degrade: opening read-only tolerates drift, opening read-write
    /// does not (see `QualiaError::FieldConfigChanged`).
    pub fn load_persisted_tolerant(&mut self, state_path: &Path) -> Result<Vec<QualiaError>> {
        let bytes = match std::fs::read(state_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let state: PersistedFields = serde_yaml::from_slice(&bytes).unwrap_or_default();
        let mut drifted = Vec::new();
        for (name, type_name) in state.fields {
            if let Some(field_type) = FieldType::from_str(&type_name) {
                match self.declare(FieldDescriptor::new(&name, field_type)) {
                    Ok(()) => {
                        self.custom.insert(name);
                    }
                    Err(e) => drifted.push(e),
                }
            }
        }
        Ok(drifted)
    }

    /// Rewrite the `state` file's field section with every currently-declared custom
    /// field, so a lazily-inferred type survives the next
    /// [`FieldSchema::load_persisted`] call. A no-op for single-file stores, which
    /// have no `state` file to write.
    pub fn persist_custom_fields(&self, state_path: &Path) -> Result<()> {
        let fields = self.custom_fields().map(|d| (d.name.clone(), d.field_type.as_str().to_string())).collect();
        let yaml = serde_yaml::to_string(&PersistedFields { fields }).map_err(|e| QualiaError::Config(e.to_string()))?;
        std::fs::write(state_path, yaml)?;
        Ok(())
    }
}

/// The `state` file's field section: just `name -> type`, enough to re-pin a
/// lazily-inferred field's type on reopen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedFields {
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

/// Fields every store carries regardless of plugins.
fn builtin_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new("hash", FieldType::Id).read_only().hidden(),
        FieldDescriptor::new("filename", FieldType::ExactText).read_only(),
        FieldDescriptor::new("file_modified_at", FieldType::Datetime).read_only(),
        FieldDescriptor::new("imported_at", FieldType::Datetime).read_only(),
        FieldDescriptor::new("comments", FieldType::Text),
        FieldDescriptor::new("tags", FieldType::Keyword),
        // Contributed by `auto_import::MagicBytesImporter`.
        FieldDescriptor::new("mime_type", FieldType::ExactText).read_only(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_fields_resolve() {
        let schema = FieldSchema::new();
        assert!(schema.get("hash").unwrap().read_only);
        assert!(!schema.get("tags").unwrap().read_only);
    }

    #[test]
    fn redeclaring_same_type_is_ok() {
        let mut schema = FieldSchema::new();
        assert!(schema.declare(FieldDescriptor::new("tags", FieldType::Keyword)).is_ok());
    }

    #[test]
    fn redeclaring_different_type_errors() {
        let mut schema = FieldSchema::new();
        let err = schema.declare(FieldDescriptor::new("tags", FieldType::Text)).unwrap_err();
        assert!(matches!(err, QualiaError::FieldConfigChanged { .. }));
    }

    #[test]
    fn alias_resolves_to_canonical_name() {
        let mut schema = FieldSchema::new();
        schema
            .declare(FieldDescriptor::new("description", FieldType::Text).with_aliases(&["desc"]))
            .unwrap();
        assert_eq!(schema.resolve("desc"), "description");
    }
}
