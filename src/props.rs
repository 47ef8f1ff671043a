//! Typed target properties.
//!
//! Collaborators register property definitions in a [`Schema`]; targets
//! store values in a [`PropertySet`]. Types are enforced at set time, and a
//! property set is sealed once its target has completed, after which all
//! writes fail.

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

/// The type of a property value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PropKind {
    /// A boolean flag.
    Bool,
    /// A signed integer.
    Int,
    /// A single string.
    String,
    /// A list of strings.
    StringList,
    /// A list of paths.
    PathList,
    /// A map of string keys to arbitrary JSON values.
    Map,
}

impl std::fmt::Display for PropKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Bool => "Bool",
            Self::Int => "Int",
            Self::String => "String",
            Self::StringList => "StringList",
            Self::PathList => "PathList",
            Self::Map => "Map",
        };
        f.write_str(name)
    }
}

/// A typed property value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropValue {
    /// See [`PropKind::Bool`].
    Bool(bool),
    /// See [`PropKind::Int`].
    Int(i64),
    /// See [`PropKind::String`].
    String(String),
    /// See [`PropKind::StringList`].
    StringList(Vec<String>),
    /// See [`PropKind::PathList`].
    PathList(Vec<Utf8PathBuf>),
    /// See [`PropKind::Map`].
    Map(IndexMap<String, serde_json::Value>),
}

impl PropValue {
    /// The kind of this value.
    #[must_use]
    pub fn kind(&self) -> PropKind {
        match self {
            Self::Bool(_) => PropKind::Bool,
            Self::Int(_) => PropKind::Int,
            Self::String(_) => PropKind::String,
            Self::StringList(_) => PropKind::StringList,
            Self::PathList(_) => PropKind::PathList,
            Self::Map(_) => PropKind::Map,
        }
    }

    /// Whether the value is empty for its kind. Scalars are empty only when
    /// they are the empty string; `Bool` and `Int` never are.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Bool(_) | Self::Int(_) => false,
            Self::String(s) => s.is_empty(),
            Self::StringList(v) => v.is_empty(),
            Self::PathList(v) => v.is_empty(),
            Self::Map(m) => m.is_empty(),
        }
    }

    /// An empty value of `kind`.
    #[must_use]
    pub fn empty(kind: PropKind) -> Self {
        match kind {
            PropKind::Bool => Self::Bool(false),
            PropKind::Int => Self::Int(0),
            PropKind::String => Self::String(String::new()),
            PropKind::StringList => Self::StringList(Vec::new()),
            PropKind::PathList => Self::PathList(Vec::new()),
            PropKind::Map => Self::Map(IndexMap::new()),
        }
    }

    /// Extend a list or map value with `other`; scalar kinds are replaced.
    pub fn merge(&mut self, other: Self) {
        match (self, other) {
            (Self::StringList(dst), Self::StringList(src)) => dst.extend(src),
            (Self::PathList(dst), Self::PathList(src)) => dst.extend(src),
            (Self::Map(dst), Self::Map(src)) => dst.extend(src),
            (dst, src) => *dst = src,
        }
    }

    /// Convert a loosely-typed JSON value (from a build script) into a value
    /// of `kind`. Single strings promote to one-element lists, matching the
    /// string-or-list convention of the script format.
    ///
    /// # Errors
    ///
    /// Returns [`PropError::TypeMismatch`] when the value cannot represent
    /// `kind`.
    pub fn from_json(
        key: &str,
        kind: PropKind,
        value: &serde_json::Value,
    ) -> Result<Self, PropError> {
        use serde_json::Value;
        let mismatch = || PropError::TypeMismatch {
            key: key.to_owned(),
            expected: kind,
            got: json_kind_name(value),
        };
        let as_string_vec = |value: &Value| -> Option<Vec<String>> {
            match value {
                Value::String(s) => Some(vec![s.clone()]),
                Value::Array(items) => items
                    .iter()
                    .map(|v| v.as_str().map(str::to_owned))
                    .collect(),
                _ => None,
            }
        };
        match kind {
            PropKind::Bool => value.as_bool().map(Self::Bool).ok_or_else(mismatch),
            PropKind::Int => value.as_i64().map(Self::Int).ok_or_else(mismatch),
            PropKind::String => value
                .as_str()
                .map(|s| Self::String(s.to_owned()))
                .ok_or_else(mismatch),
            PropKind::StringList => as_string_vec(value)
                .map(Self::StringList)
                .ok_or_else(mismatch),
            PropKind::PathList => as_string_vec(value)
                .map(|v| Self::PathList(v.into_iter().map(Utf8PathBuf::from).collect()))
                .ok_or_else(mismatch),
            PropKind::Map => match value {
                Value::Object(map) => Ok(Self::Map(
                    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                )),
                _ => Err(mismatch()),
            },
        }
    }

    /// Borrow as a string list, if the kind matches.
    #[must_use]
    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Self::StringList(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow as a path list, if the kind matches.
    #[must_use]
    pub fn as_path_list(&self) -> Option<&[Utf8PathBuf]> {
        match self {
            Self::PathList(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow as a string, if the kind matches.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read as a bool, if the kind matches.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

fn json_kind_name(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Errors raised by the property layer.
#[derive(Debug, Error)]
pub enum PropError {
    /// The property was never registered.
    #[error("unknown property '{0}'")]
    Unknown(String),
    /// A value of the wrong type was supplied.
    #[error("property '{key}' expects {expected}, got {got}")]
    TypeMismatch {
        /// Property key.
        key: String,
        /// Registered kind.
        expected: PropKind,
        /// What was supplied instead.
        got: &'static str,
    },
    /// Two collaborators registered the same key with different types.
    #[error("property '{key}' already registered as {existing}, conflicting with {conflicting}")]
    ConflictingDefinition {
        /// Property key.
        key: String,
        /// Previously registered kind.
        existing: PropKind,
        /// The conflicting kind.
        conflicting: PropKind,
    },
    /// The target has completed; its properties are read-only.
    #[error("property '{0}' can not be modified after the target completed")]
    Sealed(String),
    /// `+=` was used on a scalar property.
    #[error("property '{0}' is not a list or map and can not be appended to")]
    NotAppendable(String),
}

/// A property definition.
#[derive(Clone, Debug)]
pub struct PropDef {
    /// Full key, `"<namespace>.<name>"`.
    pub key: String,
    /// Value type.
    pub kind: PropKind,
    /// Default when neither the target nor its dependencies provide a value.
    pub default: Option<PropValue>,
    /// Whether values accumulate from transitive dependencies.
    pub inherit: bool,
}

impl PropDef {
    /// Shorthand constructor for a non-inherited property.
    #[must_use]
    pub fn new(key: &str, kind: PropKind) -> Self {
        Self {
            key: key.to_owned(),
            kind,
            default: None,
            inherit: false,
        }
    }

    /// Mark the property as inherited from dependencies.
    #[must_use]
    pub fn inherited(mut self) -> Self {
        self.inherit = true;
        self
    }

    /// Attach a default value.
    #[must_use]
    pub fn with_default(mut self, value: PropValue) -> Self {
        self.default = Some(value);
        self
    }
}

/// The session-wide registry of property definitions.
#[derive(Debug, Default)]
pub struct Schema {
    defs: IndexMap<String, PropDef>,
}

impl Schema {
    /// Register a definition. Re-registering the same key with a matching
    /// type is a no-op; a conflicting type is an error.
    ///
    /// # Errors
    ///
    /// Returns [`PropError::ConflictingDefinition`] on a type conflict.
    pub fn register(&mut self, def: PropDef) -> Result<(), PropError> {
        if let Some(existing) = self.defs.get(&def.key) {
            if existing.kind == def.kind {
                return Ok(());
            }
            return Err(PropError::ConflictingDefinition {
                key: def.key,
                existing: existing.kind,
                conflicting: def.kind,
            });
        }
        self.defs.insert(def.key.clone(), def);
        Ok(())
    }

    /// Look up a definition.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PropDef> {
        self.defs.get(key)
    }

    /// Look up a definition or fail.
    ///
    /// # Errors
    ///
    /// Returns [`PropError::Unknown`] for unregistered keys.
    pub fn require(&self, key: &str) -> Result<&PropDef, PropError> {
        self.defs.get(key).ok_or_else(|| PropError::Unknown(key.to_owned()))
    }
}

/// The values a single target carries.
#[derive(Debug, Default)]
pub struct PropertySet {
    values: IndexMap<String, PropValue>,
    sealed: bool,
}

impl PropertySet {
    /// Set `key` to `value`, checking the registered type.
    ///
    /// # Errors
    ///
    /// Fails for unknown keys, type mismatches, or a sealed set.
    pub fn set(&mut self, schema: &Schema, key: &str, value: PropValue) -> Result<(), PropError> {
        let def = schema.require(key)?;
        if self.sealed {
            return Err(PropError::Sealed(key.to_owned()));
        }
        if value.kind() != def.kind {
            return Err(PropError::TypeMismatch {
                key: key.to_owned(),
                expected: def.kind,
                got: kind_name(value.kind()),
            });
        }
        self.values.insert(key.to_owned(), value);
        Ok(())
    }

    /// Append to a list or map property (the `+=` write API).
    ///
    /// # Errors
    ///
    /// Fails for unknown keys, scalar kinds, type mismatches, or a sealed
    /// set.
    pub fn append(&mut self, schema: &Schema, key: &str, value: PropValue) -> Result<(), PropError> {
        let def = schema.require(key)?;
        if self.sealed {
            return Err(PropError::Sealed(key.to_owned()));
        }
        if !matches!(
            def.kind,
            PropKind::StringList | PropKind::PathList | PropKind::Map
        ) {
            return Err(PropError::NotAppendable(key.to_owned()));
        }
        if value.kind() != def.kind {
            return Err(PropError::TypeMismatch {
                key: key.to_owned(),
                expected: def.kind,
                got: kind_name(value.kind()),
            });
        }
        self.values
            .entry(key.to_owned())
            .or_insert_with(|| PropValue::empty(def.kind))
            .merge(value);
        Ok(())
    }

    /// The explicit value stored for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.values.get(key)
    }

    /// Forbid all further writes.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Whether the set has been sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}

fn kind_name(kind: PropKind) -> &'static str {
    match kind {
        PropKind::Bool => "bool",
        PropKind::Int => "number",
        PropKind::String => "string",
        PropKind::StringList | PropKind::PathList => "array",
        PropKind::Map => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        let mut schema = Schema::default();
        schema
            .register(PropDef::new("cxx.srcs", PropKind::PathList))
            .expect("register");
        schema
            .register(PropDef::new("cxx.defines", PropKind::StringList).inherited())
            .expect("register");
        schema
            .register(
                PropDef::new("build.optimize", PropKind::String)
                    .with_default(PropValue::String("speed".into())),
            )
            .expect("register");
        schema
    }

    #[test]
    fn reregistering_matching_type_is_a_noop() {
        let mut schema = schema();
        schema
            .register(PropDef::new("cxx.srcs", PropKind::PathList))
            .expect("idempotent");
    }

    #[test]
    fn reregistering_conflicting_type_fails() {
        let mut schema = schema();
        let err = schema
            .register(PropDef::new("cxx.srcs", PropKind::StringList))
            .expect_err("conflict");
        assert!(matches!(err, PropError::ConflictingDefinition { .. }));
    }

    #[test]
    fn set_enforces_types() {
        let schema = schema();
        let mut props = PropertySet::default();
        let err = props
            .set(&schema, "cxx.srcs", PropValue::String("oops".into()))
            .expect_err("type mismatch");
        assert!(matches!(err, PropError::TypeMismatch { .. }));
    }

    #[test]
    fn append_accumulates_lists() {
        let schema = schema();
        let mut props = PropertySet::default();
        props
            .append(&schema, "cxx.defines", PropValue::StringList(vec!["A".into()]))
            .expect("append");
        props
            .append(&schema, "cxx.defines", PropValue::StringList(vec!["B".into()]))
            .expect("append");
        assert_eq!(
            props.get("cxx.defines"),
            Some(&PropValue::StringList(vec!["A".into(), "B".into()]))
        );
    }

    #[test]
    fn append_rejects_scalars() {
        let schema = schema();
        let mut props = PropertySet::default();
        let err = props
            .append(&schema, "build.optimize", PropValue::String("size".into()))
            .expect_err("scalar append");
        assert!(matches!(err, PropError::NotAppendable(_)));
    }

    #[test]
    fn sealed_set_rejects_writes() {
        let schema = schema();
        let mut props = PropertySet::default();
        props.seal();
        let err = props
            .set(&schema, "cxx.srcs", PropValue::PathList(vec!["a.c".into()]))
            .expect_err("sealed");
        assert!(matches!(err, PropError::Sealed(_)));
    }

    #[test]
    fn from_json_promotes_single_strings_to_lists() {
        let value = serde_json::json!("main.c");
        let parsed = PropValue::from_json("cxx.srcs", PropKind::PathList, &value).expect("convert");
        assert_eq!(parsed, PropValue::PathList(vec!["main.c".into()]));
    }
}
