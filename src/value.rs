//! Attribute values, records, and the two dictionaries that drive construction.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use crate::{consistency::CheckToggles, fields::FieldKind};

/// Surrogate identity shared by a base row and every specialization row refining it.
pub type EntityId = i64;

/// Flat attribute name (optionally dotted by relation path) to value.
pub type Parameters = BTreeMap<String, Value>;

/// Dotted relation path to the concrete type name instantiated there.
pub type Tree = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert into the native representation of `kind`.
    ///
    /// Returns `None` when the value has no faithful representation, e.g. `"abc"` as an
    /// integer or `2.5` as a relation id. Null passes through; whether it is acceptable is
    /// up to the caller.
    pub fn coerce(&self, kind: &FieldKind) -> Option<Value> {
        use FieldKind::*;
        match (kind, self) {
            (_, Value::Null) => Some(Value::Null),
            (Integer | Timestamp | Owner | ForeignKey { .. }, Value::Integer(i)) => {
                Some(Value::Integer(*i))
            }
            // `i64::MAX as f64` rounds up to 2^63, which is already out of range.
            (Integer | Timestamp | Owner | ForeignKey { .. }, Value::Real(f)) => (f.fract() == 0.0
                && *f >= i64::MIN as f64
                && *f < i64::MAX as f64)
                .then_some(Value::Integer(*f as i64)),
            (Integer | Timestamp | Owner | ForeignKey { .. }, Value::Text(s)) => {
                s.trim().parse::<i64>().ok().map(Value::Integer)
            }
            (Real, Value::Integer(i)) => Some(Value::Real(*i as f64)),
            (Real, Value::Real(f)) => Some(Value::Real(*f)),
            (Real, Value::Text(s)) => s.trim().parse::<f64>().ok().map(Value::Real),
            (Text | Discriminator, Value::Text(s)) => Some(Value::Text(s.clone())),
            (Text, Value::Integer(_) | Value::Real(_) | Value::Bool(_)) => {
                Some(Value::Text(self.to_string()))
            }
            (Boolean, Value::Bool(b)) => Some(Value::Bool(*b)),
            (Boolean, Value::Integer(0)) => Some(Value::Bool(false)),
            (Boolean, Value::Integer(1)) => Some(Value::Bool(true)),
            (Boolean, Value::Text(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(Value::Bool(true)),
                "false" | "0" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Source-like rendering used by construction scripts.
    pub fn literal(&self) -> String {
        match self {
            Value::Text(s) => format!("{s:?}"),
            other => other.to_string(),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or_default()
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => n.as_f64().map(Value::Real).unwrap_or_default(),
            },
            serde_json::Value::String(s) => Value::Text(s),
            // Nested structures are kept verbatim so they can still feed text fields.
            other => Value::Text(other.to_string()),
        }
    }
}

/// One entity row, seen at a particular concrete type.
///
/// `values` holds every stored column of the type's lineage that has been loaded or set,
/// keyed by field name. Relations are stored as the related entity's id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub type_name: String,
    pub id: Option<EntityId>,
    pub values: BTreeMap<String, Value>,
    #[serde(skip)]
    pub toggles: CheckToggles,
}

impl Record {
    pub fn new(type_name: impl Into<String>) -> Self {
        Record {
            type_name: type_name.into(),
            id: None,
            values: BTreeMap::new(),
            toggles: CheckToggles::default(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn is_saved(&self) -> bool {
        self.id.is_some()
    }

    /// Identity of a saved record; unsaved records cannot take part in relations.
    pub fn saved_id(&self) -> Result<EntityId, crate::CatalogError> {
        self.id
            .ok_or_else(|| crate::CatalogError::Unsaved(self.type_name.clone()))
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}[{}]", self.type_name, id),
            None => write!(f, "{}[unsaved]", self.type_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_coerce_integer_from_text_and_integral_real() {
        assert_eq!(
            Value::from("42").coerce(&FieldKind::Integer),
            Some(Value::Integer(42))
        );
        assert_eq!(
            Value::Real(8.0).coerce(&FieldKind::Integer),
            Some(Value::Integer(8))
        );
        assert_eq!(Value::Real(8.5).coerce(&FieldKind::Integer), None);
        assert_eq!(Value::from("abc").coerce(&FieldKind::Integer), None);
    }

    #[test]
    fn test_coerce_integer_rejects_out_of_range_reals() {
        assert_eq!(Value::Real(1e20).coerce(&FieldKind::Integer), None);
        assert_eq!(Value::Real(-1e20).coerce(&FieldKind::Timestamp), None);
        assert_eq!(Value::Real(f64::INFINITY).coerce(&FieldKind::Integer), None);
        assert_eq!(Value::Real(f64::NAN).coerce(&FieldKind::Integer), None);
        assert_eq!(
            Value::Real(-9.0e15).coerce(&FieldKind::Integer),
            Some(Value::Integer(-9_000_000_000_000_000))
        );
    }

    #[test]
    fn test_coerce_real_and_text() {
        assert_eq!(Value::Integer(3).coerce(&FieldKind::Real), Some(Value::Real(3.0)));
        assert_eq!(
            Value::from(" 0.125 ").coerce(&FieldKind::Real),
            Some(Value::Real(0.125))
        );
        assert_eq!(
            Value::Integer(32).coerce(&FieldKind::Text),
            Some(Value::Text("32".to_string()))
        );
    }

    #[test]
    fn test_coerce_boolean() {
        assert_eq!(Value::from("True").coerce(&FieldKind::Boolean), Some(Value::Bool(true)));
        assert_eq!(Value::Integer(0).coerce(&FieldKind::Boolean), Some(Value::Bool(false)));
        assert_eq!(Value::Integer(2).coerce(&FieldKind::Boolean), None);
    }

    #[test]
    fn test_null_passes_through() {
        assert_eq!(Value::Null.coerce(&FieldKind::Real), Some(Value::Null));
    }

    #[test]
    fn test_relation_ids_must_be_integral() {
        let kind = FieldKind::ForeignKey {
            target: "lattice.GaugeConfig".to_string(),
        };
        assert_eq!(Value::Integer(7).coerce(&kind), Some(Value::Integer(7)));
        assert_eq!(Value::Real(7.5).coerce(&kind), None);
    }

    #[test]
    fn test_parameters_from_json() {
        let json = serde_json::json!({"nx": 32, "mval": 0.1, "tag": "run-a", "skip": null});
        let params: Parameters = json
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect();
        assert_eq!(params["nx"], Value::Integer(32));
        assert_eq!(params["mval"], Value::Real(0.1));
        assert_eq!(params["tag"], Value::Text("run-a".to_string()));
        assert!(params["skip"].is_null());
    }

    #[test]
    fn test_untagged_deserialization() {
        let params: Parameters =
            serde_json::from_str(r#"{"a": 1, "b": 2.5, "c": "x", "d": true}"#).unwrap();
        assert_eq!(params["a"], Value::Integer(1));
        assert_eq!(params["b"], Value::Real(2.5));
        assert_eq!(params["c"], Value::Text("x".to_string()));
        assert_eq!(params["d"], Value::Bool(true));
    }

    #[test]
    fn test_literal_quotes_text() {
        assert_eq!(Value::from("a b").literal(), "\"a b\"");
        assert_eq!(Value::Integer(5).literal(), "5");
    }
}
