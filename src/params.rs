//! Tool parameter descriptors and validation.
//!
//! Every tool declares its parameters as a list of [`ParamSpec`]s. The same
//! list produces the JSON Schema advertised to agents and drives
//! [`validate`], which runs before any tool executes:
//!
//! - unknown parameters are rejected
//! - required parameters must be present (and non-blank when marked so)
//! - values must match the declared type and range
//! - missing optional parameters receive their default, if any

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{Result, VaultError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    String {
        non_empty: bool,
    },
    Integer {
        min: Option<i64>,
        max: Option<i64>,
    },
    Boolean,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn string(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            kind: ParamKind::String { non_empty: false },
            required: false,
            default: None,
        }
    }

    pub fn integer(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            kind: ParamKind::Integer {
                min: None,
                max: None,
            },
            required: false,
            default: None,
        }
    }

    pub fn boolean(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            kind: ParamKind::Boolean,
            required: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Reject blank strings. Only meaningful for string parameters.
    pub fn non_empty(mut self) -> Self {
        if let ParamKind::String { non_empty } = &mut self.kind {
            *non_empty = true;
        }
        self
    }

    pub fn range(mut self, lo: Option<i64>, hi: Option<i64>) -> Self {
        if let ParamKind::Integer { min, max } = &mut self.kind {
            *min = lo;
            *max = hi;
        }
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    fn json_type(&self) -> &'static str {
        match self.kind {
            ParamKind::String { .. } => "string",
            ParamKind::Integer { .. } => "integer",
            ParamKind::Boolean => "boolean",
        }
    }

    fn check(&self, value: &Value) -> Result<()> {
        match &self.kind {
            ParamKind::String { non_empty } => {
                let s = value.as_str().ok_or_else(|| self.type_error(value))?;
                if *non_empty && s.trim().is_empty() {
                    return Err(VaultError::Validation(format!(
                        "parameter '{}' must not be empty",
                        self.name
                    )));
                }
            }
            ParamKind::Integer { min, max } => {
                let n = value.as_i64().ok_or_else(|| self.type_error(value))?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return Err(VaultError::Validation(format!(
                        "parameter '{}' must be in {}..={}, got {}",
                        self.name,
                        min.map(|m| m.to_string()).unwrap_or_default(),
                        max.map(|m| m.to_string()).unwrap_or_default(),
                        n
                    )));
                }
            }
            ParamKind::Boolean => {
                value.as_bool().ok_or_else(|| self.type_error(value))?;
            }
        }
        Ok(())
    }

    fn type_error(&self, value: &Value) -> VaultError {
        VaultError::Validation(format!(
            "parameter '{}' must be of type '{}', got {}",
            self.name,
            self.json_type(),
            json_type_name(value)
        ))
    }
}

/// JSON Schema object for a parameter list.
pub fn schema(specs: &[ParamSpec]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for spec in specs {
        let mut prop = Map::new();
        prop.insert("type".into(), json!(spec.json_type()));
        prop.insert("description".into(), json!(spec.description));
        if let ParamKind::Integer { min, max } = &spec.kind {
            if let Some(m) = min {
                prop.insert("minimum".into(), json!(m));
            }
            if let Some(m) = max {
                prop.insert("maximum".into(), json!(m));
            }
        }
        if let Some(default) = &spec.default {
            prop.insert("default".into(), default.clone());
        }
        if spec.required {
            required.push(json!(spec.name));
        }
        properties.insert(spec.name.to_string(), Value::Object(prop));
    }

    let mut schema = Map::new();
    schema.insert("type".into(), json!("object"));
    schema.insert("properties".into(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".into(), Value::Array(required));
    }
    Value::Object(schema)
}

/// Validate `params` against `specs`, returning the parameters with
/// defaults filled in. `null` is treated as an empty object.
pub fn validate(specs: &[ParamSpec], params: &Value) -> Result<Map<String, Value>> {
    let given = match params {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(VaultError::Validation(format!(
                "parameters must be an object, got {}",
                json_type_name(other)
            )))
        }
    };

    if let Some(unknown) = given
        .keys()
        .find(|k| !specs.iter().any(|s| s.name == k.as_str()))
    {
        return Err(VaultError::Validation(format!(
            "unknown parameter: {}",
            unknown
        )));
    }

    let mut out = given.clone();
    for spec in specs {
        match given.get(spec.name) {
            Some(Value::Null) | None => {
                if spec.required {
                    return Err(VaultError::Validation(format!(
                        "missing required parameter: {}",
                        spec.name
                    )));
                }
                out.remove(spec.name);
                if let Some(default) = &spec.default {
                    out.insert(spec.name.to_string(), default.clone());
                }
            }
            Some(value) => spec.check(value)?,
        }
    }
    Ok(out)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<ParamSpec> {
        vec![
            ParamSpec::string("query", "Search query").required(),
            ParamSpec::integer("limit", "Max results")
                .range(Some(1), Some(100))
                .default_value(json!(20)),
            ParamSpec::string("path", "Note path").non_empty(),
        ]
    }

    #[test]
    fn test_defaults_injected() {
        let out = validate(&specs(), &json!({"query": "alpha"})).unwrap();
        assert_eq!(out["limit"], json!(20));
        assert!(!out.contains_key("path"));
    }

    #[test]
    fn test_missing_required() {
        let err = validate(&specs(), &json!({"limit": 5})).unwrap_err();
        assert!(matches!(err, VaultError::Validation(_)));
        assert!(err.to_string().contains("query"));
        assert!(validate(&specs(), &json!({"query": null})).is_err());
    }

    #[test]
    fn test_type_and_range() {
        let err = validate(&specs(), &json!({"query": 3})).unwrap_err();
        assert!(err.to_string().contains("type 'string'"));
        let err = validate(&specs(), &json!({"query": "q", "limit": 0})).unwrap_err();
        assert!(err.to_string().contains("1..=100"));
        assert!(validate(&specs(), &json!({"query": "q", "limit": 2.5})).is_err());
    }

    #[test]
    fn test_blank_and_unknown() {
        let err = validate(&specs(), &json!({"query": "q", "path": "  "})).unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
        let err = validate(&specs(), &json!({"query": "q", "mode": "x"})).unwrap_err();
        assert!(err.to_string().contains("unknown parameter: mode"));
        assert!(validate(&specs(), &json!([1])).is_err());
    }

    #[test]
    fn test_schema_shape() {
        let s = schema(&specs());
        assert_eq!(s["type"], "object");
        assert_eq!(s["required"], json!(["query"]));
        assert_eq!(s["properties"]["limit"]["minimum"], 1);
        assert_eq!(s["properties"]["limit"]["default"], 20);
        assert_eq!(s["properties"]["path"]["type"], "string");
    }
}
