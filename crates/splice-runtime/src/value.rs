//! Export values recorded from executed host modules.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

/// Native implementation backing a callable export.
pub type NativeFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// JSON key marking a function export in bundles: `{"$fn": "source"}`.
pub const FUNCTION_KEY: &str = "$fn";

/// A value produced by a host module.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// The null value.
    #[default]
    Null,
    /// A string value.
    String(String),
    /// A numeric value (always f64, like JavaScript).
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// An array of values.
    Array(Vec<Value>),
    /// An object with string keys, iterated in insertion order.
    Object(IndexMap<String, Value>),
    /// A callable export.
    Function(Function),
}

/// A function export: its source text and, optionally, something to run.
#[derive(Clone)]
pub struct Function {
    pub name: String,
    pub source: Arc<str>,
    native: Option<NativeFn>,
}

impl Function {
    pub fn new(name: impl Into<String>, source: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            native: None,
        }
    }

    /// A function that can actually be invoked.
    pub fn native<F>(name: impl Into<String>, source: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            source: source.into(),
            native: Some(Arc::new(f)),
        }
    }

    /// Run the native implementation, `None` if there is none.
    pub fn invoke(&self, args: &[Value]) -> Option<Result<Value, String>> {
        self.native.as_ref().map(|f| f(args))
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        let same_native = match (&self.native, &other.native) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_native && self.name == other.name && self.source == other.source
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("native", &self.native.is_some())
            .finish()
    }
}

impl Value {
    /// Build an object from key/value pairs.
    pub fn object<I, K>(entries: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Look up a property of an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Whether every named property exists on this object.
    pub fn has_props<S: AsRef<str>>(&self, props: &[S]) -> bool {
        match self {
            Value::Object(map) => props.iter().all(|p| map.contains_key(p.as_ref())),
            _ => false,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Coerce this value to a string.
    pub fn to_string_value(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::String(s) => s.clone(),
            Value::Number(n) => {
                if n.is_nan() {
                    "NaN".to_string()
                } else if n.is_infinite() {
                    if *n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
                } else if *n == n.trunc() && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            Value::Boolean(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Array(arr) => {
                let items: Vec<String> = arr.iter().map(|v| v.to_string_value()).collect();
                items.join(",")
            }
            Value::Object(_) => "[object Object]".to_string(),
            Value::Function(f) => f.source.to_string(),
        }
    }

    /// Parse a JSON string into a Value.
    pub fn from_json(s: &str) -> Result<Value, serde_json::Error> {
        let json: JsonValue = serde_json::from_str(s)?;
        Ok(Value::from_json_value(json))
    }

    /// Convert a serde_json Value, turning `{"$fn": "..."}` into a function.
    pub fn from_json_value(json: JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Boolean(b),
            JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from_json_value).collect())
            }
            JsonValue::Object(obj) => {
                if let Some(JsonValue::String(source)) = obj.get(FUNCTION_KEY) {
                    let name = obj
                        .get("name")
                        .and_then(JsonValue::as_str)
                        .unwrap_or_default();
                    return Value::Function(Function::new(name, source.as_str()));
                }
                let map = obj
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json_value(v)))
                    .collect();
                Value::Object(map)
            }
        }
    }

    /// Convert this Value to a JSON string.
    pub fn to_json(&self) -> String {
        let json = self.to_json_value();
        serde_json::to_string_pretty(&json).unwrap_or_else(|_| "null".to_string())
    }

    /// Convert this Value to a serde_json Value.
    pub fn to_json_value(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Number(n) => {
                serde_json::Number::from_f64(*n)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            }
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Array(arr) => {
                JsonValue::Array(arr.iter().map(|v| v.to_json_value()).collect())
            }
            Value::Object(obj) => {
                let map: serde_json::Map<String, JsonValue> = obj.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_value()))
                    .collect();
                JsonValue::Object(map)
            }
            Value::Function(f) => {
                let mut map = serde_json::Map::new();
                map.insert(FUNCTION_KEY.to_string(), JsonValue::String(f.source.to_string()));
                if !f.name.is_empty() {
                    map.insert("name".to_string(), JsonValue::String(f.name.clone()));
                }
                JsonValue::Object(map)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_value())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_function_marker() {
        let v = Value::from_json(r#"{"render": {"$fn": "function(e){return e.x}", "name": "render"}, "n": 3}"#).unwrap();
        let f = v.get("render").and_then(Value::as_function).unwrap();
        assert_eq!(f.name, "render");
        assert!(f.source.contains("return e.x"));
        assert_eq!(v.get("n"), Some(&Value::Number(3.0)));
    }

    #[test]
    fn test_json_round_trip_keeps_functions() {
        let v = Value::object([("f", Value::Function(Function::new("f", "()=>1")))]);
        let back = Value::from_json(&v.to_json()).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_has_props() {
        let v = Value::object([("a", Value::Null), ("b", Value::from(1.0))]);
        assert!(v.has_props(&["a", "b"]));
        assert!(!v.has_props(&["a", "c"]));
        assert!(!Value::from("a").has_props(&["len"]));
    }

    #[test]
    fn test_function_equality_tracks_native_identity() {
        let f = Function::native("f", "()=>1", |_| Ok(Value::Number(1.0)));
        assert_eq!(f.clone(), f);
        let g = Function::native("f", "()=>1", |_| Ok(Value::Number(1.0)));
        assert_ne!(f, g);
    }

    #[test]
    fn test_number_coercion() {
        assert_eq!(Value::Number(42.0).to_string_value(), "42");
        assert_eq!(Value::Number(1.5).to_string_value(), "1.5");
    }
}
