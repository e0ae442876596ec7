//! The Resource/Field contract: typed schemas describing a record's
//! attributes, identity key(s), and an optional version attribute.
//!
//! A [`Resource`] is immutable after construction. Items are represented as
//! `serde_json::Value` objects; the Resource validates them, and encodes or
//! decodes them to string-keyed maps for backends that only store strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, QueryError, Result};

/// The type of a resource attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Boolean,
    Json,
}

impl FieldKind {
    /// Declarative SQL-ish type name, used by the schema state export.
    pub fn type_name(self) -> &'static str {
        match self {
            FieldKind::String => "text",
            FieldKind::Integer => "bigint",
            FieldKind::Float => "double precision",
            FieldKind::Boolean => "boolean",
            FieldKind::Json => "jsonb",
        }
    }
}

/// A single attribute definition: type plus required flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub kind: FieldKind,
    pub required: bool,
}

impl Field {
    pub fn string() -> Self {
        Self {
            kind: FieldKind::String,
            required: true,
        }
    }

    pub fn integer() -> Self {
        Self {
            kind: FieldKind::Integer,
            required: true,
        }
    }

    pub fn float() -> Self {
        Self {
            kind: FieldKind::Float,
            required: true,
        }
    }

    pub fn boolean() -> Self {
        Self {
            kind: FieldKind::Boolean,
            required: true,
        }
    }

    pub fn json() -> Self {
        Self {
            kind: FieldKind::Json,
            required: true,
        }
    }

    /// Mark this field as optional (absent or null values pass validation).
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Check a single value against this field's type. Null/absent is only
    /// acceptable for optional fields and is checked by the caller.
    pub fn accepts(&self, value: &Value) -> bool {
        match self.kind {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Float => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Json => true,
        }
    }

    /// Encode a value to the string representation used by string-only
    /// backends. The encoding is lossless for every [`FieldKind`].
    pub fn encode(&self, value: &Value) -> String {
        match (self.kind, value) {
            (FieldKind::String, Value::String(s)) => s.clone(),
            (FieldKind::Json, v) => v.to_string(),
            (_, v) => v.to_string(),
        }
    }

    /// Decode a string produced by [`Field::encode`] back into a value.
    /// Returns `Value::Null` for strings that do not parse as the field's
    /// type; the row-level validation pass decides what to do with those.
    pub fn decode(&self, raw: &str) -> Value {
        match self.kind {
            FieldKind::String => Value::String(raw.to_string()),
            FieldKind::Integer => raw
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or(Value::Null),
            FieldKind::Float => raw
                .parse::<f64>()
                .map(Value::from)
                .unwrap_or(Value::Null),
            FieldKind::Boolean => match raw {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::Null,
            },
            FieldKind::Json => serde_json::from_str(raw).unwrap_or(Value::Null),
        }
    }
}

/// An immutable schema: name, ordered attributes, identity key(s), and an
/// optional version attribute used for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    name: String,
    fields: Vec<(String, Field)>,
    identity: Vec<String>,
    version: Option<String>,
}

impl Resource {
    /// Start building a resource. Attributes keep declaration order.
    pub fn builder(name: &str) -> ResourceBuilder {
        ResourceBuilder {
            name: name.to_string(),
            fields: Vec::new(),
            identity: Vec::new(),
            version: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered attribute definitions.
    pub fn fields(&self) -> &[(String, Field)] {
        &self.fields
    }

    /// Ordered identity key attribute names (non-empty).
    pub fn identity_keys(&self) -> &[String] {
        &self.identity
    }

    /// Optional version key attribute name.
    pub fn version_key(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }

    /// Validate an item against the schema, collecting every violation.
    pub fn validate(&self, item: &Value) -> Result<()> {
        let obj = match item.as_object() {
            Some(obj) => obj,
            None => {
                return Err(Error::Validation {
                    resource: self.name.clone(),
                    errors: vec!["item is not an object".to_string()],
                });
            }
        };

        let mut errors = Vec::new();
        for (name, field) in &self.fields {
            match obj.get(name) {
                None | Some(Value::Null) if field.required => {
                    errors.push(format!("missing required attribute: {name}"));
                }
                Some(value) if !value.is_null() && !field.accepts(value) => {
                    errors.push(format!(
                        "attribute '{name}' expected {:?}, got {value}",
                        field.kind
                    ));
                }
                _ => {}
            }
        }
        for name in obj.keys() {
            if self.field(name).is_none() {
                errors.push(format!("unknown attribute: {name}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation {
                resource: self.name.clone(),
                errors,
            })
        }
    }

    /// Extract the identity (and the version value, when the schema declares
    /// a version key and the item carries it) from an item.
    pub fn identity_of(&self, item: &Value) -> Result<Identity> {
        let mut keys = Vec::with_capacity(self.identity.len());
        for name in &self.identity {
            match item.get(name) {
                Some(v) if !v.is_null() => keys.push((name.clone(), v.clone())),
                _ => return Err(QueryError::MissingIdentityKey(name.clone()).into()),
            }
        }
        let version = self.version.as_ref().and_then(|vk| {
            item.get(vk)
                .filter(|v| !v.is_null())
                .map(|v| (vk.clone(), v.clone()))
        });
        Ok(Identity { keys, version })
    }

    /// Encode an item into a string-keyed, string-valued map for backends
    /// that only store strings. Null/absent attributes are omitted.
    pub fn encode_item(&self, item: &Value) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (name, field) in &self.fields {
            if let Some(v) = item.get(name) {
                if !v.is_null() {
                    out.push((name.clone(), field.encode(v)));
                }
            }
        }
        out
    }

    /// Decode a string-keyed map back into an item. Attributes absent from
    /// the map decode as absent; unknown attribute names are ignored.
    pub fn decode_item<'a, I>(&self, attrs: I) -> Value
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut obj = Map::new();
        for (name, raw) in attrs {
            if let Some(field) = self.field(name) {
                obj.insert(name.to_string(), field.decode(raw));
            }
        }
        Value::Object(obj)
    }
}

/// Builder for [`Resource`]. `build` validates that identity keys are
/// non-empty and that every declared key refers to a declared field.
pub struct ResourceBuilder {
    name: String,
    fields: Vec<(String, Field)>,
    identity: Vec<String>,
    version: Option<String>,
}

impl ResourceBuilder {
    pub fn field(mut self, name: &str, field: Field) -> Self {
        self.fields.push((name.to_string(), field));
        self
    }

    pub fn identity_key(mut self, name: &str) -> Self {
        self.identity.push(name.to_string());
        self
    }

    pub fn version_key(mut self, name: &str) -> Self {
        self.version = Some(name.to_string());
        self
    }

    pub fn build(self) -> Result<Resource> {
        let mut errors = Vec::new();
        if self.identity.is_empty() {
            errors.push("at least one identity key is required".to_string());
        }
        for key in self
            .identity
            .iter()
            .chain(self.version.iter())
        {
            if !self.fields.iter().any(|(n, _)| n == key) {
                errors.push(format!("key '{key}' does not name a declared field"));
            }
        }
        if let Some(version) = &self.version {
            if self.identity.contains(version) {
                errors.push(format!(
                    "version key '{version}' may not also be an identity key"
                ));
            }
        }
        if !errors.is_empty() {
            return Err(Error::Validation {
                resource: self.name,
                errors,
            });
        }
        Ok(Resource {
            name: self.name,
            fields: self.fields,
            identity: self.identity,
            version: self.version,
        })
    }
}

/// Separator for derived composite identity strings. 0x1F (unit separator)
/// cannot collide with the encoding of any scalar field value in practice.
const COMPOSITE_SEPARATOR: char = '\u{1f}';

/// A value containing all identity-key attributes plus, optionally, the
/// version attribute. A present version acts as an optimistic-concurrency
/// precondition: a write only applies if the stored version still matches.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub keys: Vec<(String, Value)>,
    pub version: Option<(String, Value)>,
}

impl Identity {
    /// Build an identity from key/value pairs, without a version.
    pub fn new<I, V>(keys: I) -> Self
    where
        I: IntoIterator<Item = (V, Value)>,
        V: Into<String>,
    {
        Identity {
            keys: keys.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            version: None,
        }
    }

    /// Attach a version precondition.
    pub fn with_version(mut self, attribute: &str, expected: Value) -> Self {
        self.version = Some((attribute.to_string(), expected));
        self
    }

    /// Derived composite key: identity values encoded and joined into one
    /// string. Used by backends without native composite keys to enforce
    /// identity uniqueness. Excludes the version attribute.
    pub fn composite(&self, resource: &Resource) -> String {
        let mut parts = Vec::with_capacity(self.keys.len());
        for (name, value) in &self.keys {
            let encoded = match resource.field(name) {
                Some(field) => field.encode(value),
                None => value.to_string(),
            };
            parts.push(encoded);
        }
        parts.join(&COMPOSITE_SEPARATOR.to_string())
    }

    /// All equality pairs this identity implies, version included.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.keys
            .iter()
            .map(|(n, v)| (n.as_str(), v))
            .chain(self.version.iter().map(|(n, v)| (n.as_str(), v)))
    }

    /// Whether an item carries exactly these identity-key values
    /// (version excluded).
    pub fn matches_keys(&self, item: &Value) -> bool {
        self.keys
            .iter()
            .all(|(name, value)| item.get(name) == Some(value))
    }

    /// Whether an item satisfies this identity including the version
    /// precondition, if one is present.
    pub fn matches(&self, item: &Value) -> bool {
        self.matches_keys(item)
            && self
                .version
                .as_ref()
                .map(|(name, value)| item.get(name) == Some(value))
                .unwrap_or(true)
    }
}
