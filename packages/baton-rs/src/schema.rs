//! JSON-schema subset validation for workflow inputs and outputs.
//!
//! The accepted keyword set is closed: `type`, `properties`, `required`,
//! `items`, `enum`, `minimum`, `maximum`, `minLength`, `maxLength`,
//! `pattern`, `additionalProperties`. Anything else, `$ref` and `oneOf`
//! included, is rejected at parse time so a definition cannot smuggle in
//! semantics the engine does not implement.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde_json::Value;

const KEYWORDS: &[&str] = &[
    "type",
    "properties",
    "required",
    "items",
    "enum",
    "minimum",
    "maximum",
    "minLength",
    "maxLength",
    "pattern",
    "additionalProperties",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

impl SchemaType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(SchemaType::String),
            "number" => Some(SchemaType::Number),
            "integer" => Some(SchemaType::Integer),
            "boolean" => Some(SchemaType::Boolean),
            "object" => Some(SchemaType::Object),
            "array" => Some(SchemaType::Array),
            "null" => Some(SchemaType::Null),
            _ => None,
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            SchemaType::String => value.is_string(),
            SchemaType::Number => value.is_number(),
            SchemaType::Integer => {
                value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            SchemaType::Boolean => value.is_boolean(),
            SchemaType::Object => value.is_object(),
            SchemaType::Array => value.is_array(),
            SchemaType::Null => value.is_null(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "integer",
            SchemaType::Boolean => "boolean",
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::Null => "null",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    ty: Option<SchemaType>,
    properties: BTreeMap<String, Node>,
    required: Vec<String>,
    items: Option<Box<Node>>,
    enum_values: Option<Vec<Value>>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    pattern: Option<Regex>,
    /// `false` closes the object to the listed properties.
    additional_properties: Option<bool>,
}

/// A parsed, validated schema. Keeps its JSON source for persistence.
#[derive(Debug, Clone)]
pub struct Schema {
    source: Value,
    root: Node,
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl Schema {
    /// Parse a schema document, rejecting any keyword outside the subset.
    pub fn parse(value: &Value) -> Result<Self, String> {
        let root = parse_node(value, "$")?;
        Ok(Self {
            source: value.clone(),
            root,
        })
    }

    /// The JSON document this schema was parsed from.
    pub fn source(&self) -> &Value {
        &self.source
    }

    /// Validate an instance, collecting every violation.
    pub fn validate(&self, instance: &Value) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        validate_node(&self.root, instance, "$", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn parse_node(value: &Value, path: &str) -> Result<Node, String> {
    let Some(obj) = value.as_object() else {
        return Err(format!("{path}: schema must be an object"));
    };

    for key in obj.keys() {
        if !KEYWORDS.contains(&key.as_str()) {
            return Err(format!("{path}: unsupported schema keyword: {key}"));
        }
    }

    let mut node = Node::default();

    if let Some(ty) = obj.get("type") {
        let name = ty
            .as_str()
            .ok_or_else(|| format!("{path}: type must be a string"))?;
        node.ty = Some(
            SchemaType::parse(name).ok_or_else(|| format!("{path}: unknown type: {name}"))?,
        );
    }

    if let Some(props) = obj.get("properties") {
        let props = props
            .as_object()
            .ok_or_else(|| format!("{path}: properties must be an object"))?;
        for (name, sub) in props {
            let sub_path = format!("{path}.{name}");
            node.properties.insert(name.clone(), parse_node(sub, &sub_path)?);
        }
    }

    if let Some(required) = obj.get("required") {
        let names = required
            .as_array()
            .ok_or_else(|| format!("{path}: required must be an array"))?;
        for name in names {
            let name = name
                .as_str()
                .ok_or_else(|| format!("{path}: required entries must be strings"))?;
            node.required.push(name.to_string());
        }
    }

    if let Some(items) = obj.get("items") {
        node.items = Some(Box::new(parse_node(items, &format!("{path}[]"))?));
    }

    if let Some(enum_values) = obj.get("enum") {
        let values = enum_values
            .as_array()
            .ok_or_else(|| format!("{path}: enum must be an array"))?;
        if values.is_empty() {
            return Err(format!("{path}: enum must not be empty"));
        }
        node.enum_values = Some(values.clone());
    }

    if let Some(minimum) = obj.get("minimum") {
        node.minimum =
            Some(minimum.as_f64().ok_or_else(|| format!("{path}: minimum must be a number"))?);
    }
    if let Some(maximum) = obj.get("maximum") {
        node.maximum =
            Some(maximum.as_f64().ok_or_else(|| format!("{path}: maximum must be a number"))?);
    }

    if let Some(min_length) = obj.get("minLength") {
        node.min_length = Some(
            min_length
                .as_u64()
                .ok_or_else(|| format!("{path}: minLength must be a non-negative integer"))?
                as usize,
        );
    }
    if let Some(max_length) = obj.get("maxLength") {
        node.max_length = Some(
            max_length
                .as_u64()
                .ok_or_else(|| format!("{path}: maxLength must be a non-negative integer"))?
                as usize,
        );
    }

    if let Some(pattern) = obj.get("pattern") {
        let source = pattern
            .as_str()
            .ok_or_else(|| format!("{path}: pattern must be a string"))?;
        node.pattern = Some(
            Regex::new(source).map_err(|e| format!("{path}: invalid pattern: {e}"))?,
        );
    }

    if let Some(additional) = obj.get("additionalProperties") {
        node.additional_properties = Some(
            additional
                .as_bool()
                .ok_or_else(|| format!("{path}: additionalProperties must be a boolean"))?,
        );
    }

    Ok(node)
}

fn validate_node(node: &Node, instance: &Value, path: &str, errors: &mut Vec<String>) {
    if let Some(ty) = node.ty {
        if !ty.matches(instance) {
            errors.push(format!("{path}: expected {}", ty.name()));
            return;
        }
    }

    if let Some(enum_values) = &node.enum_values {
        if !enum_values.contains(instance) {
            errors.push(format!("{path}: value not in enum"));
        }
    }

    if let Some(n) = instance.as_f64() {
        if let Some(minimum) = node.minimum {
            if n < minimum {
                errors.push(format!("{path}: {n} below minimum {minimum}"));
            }
        }
        if let Some(maximum) = node.maximum {
            if n > maximum {
                errors.push(format!("{path}: {n} above maximum {maximum}"));
            }
        }
    }

    if let Some(s) = instance.as_str() {
        let len = s.chars().count();
        if let Some(min_length) = node.min_length {
            if len < min_length {
                errors.push(format!("{path}: shorter than minLength {min_length}"));
            }
        }
        if let Some(max_length) = node.max_length {
            if len > max_length {
                errors.push(format!("{path}: longer than maxLength {max_length}"));
            }
        }
        if let Some(pattern) = &node.pattern {
            if !pattern.is_match(s) {
                errors.push(format!("{path}: does not match pattern {}", pattern.as_str()));
            }
        }
    }

    if let Some(obj) = instance.as_object() {
        for name in &node.required {
            if !obj.contains_key(name) {
                errors.push(format!("{path}: missing required property {name}"));
            }
        }
        for (name, value) in obj {
            let sub_path = format!("{path}.{name}");
            match node.properties.get(name) {
                Some(sub) => validate_node(sub, value, &sub_path, errors),
                None => {
                    if node.additional_properties == Some(false) {
                        errors.push(format!("{sub_path}: unexpected property"));
                    }
                }
            }
        }
    }

    if let Some(items) = &node.items {
        if let Some(array) = instance.as_array() {
            for (i, value) in array.iter().enumerate() {
                validate_node(items, value, &format!("{path}[{i}]"), errors);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(value: Value) -> Schema {
        Schema::parse(&value).unwrap()
    }

    #[test]
    fn test_ref_and_oneof_rejected() {
        assert!(Schema::parse(&json!({"$ref": "#/defs/x"})).is_err());
        assert!(Schema::parse(&json!({"oneOf": []})).is_err());
        assert!(Schema::parse(&json!({"allOf": []})).is_err());
    }

    #[test]
    fn test_type_check() {
        let s = schema(json!({"type": "string"}));
        assert!(s.validate(&json!("hello")).is_ok());
        assert!(s.validate(&json!(7)).is_err());
    }

    #[test]
    fn test_integer_accepts_whole_numbers_only() {
        let s = schema(json!({"type": "integer"}));
        assert!(s.validate(&json!(3)).is_ok());
        assert!(s.validate(&json!(3.0)).is_ok());
        assert!(s.validate(&json!(3.5)).is_err());
    }

    #[test]
    fn test_object_with_required_and_closed_properties() {
        let s = schema(json!({
            "type": "object",
            "properties": {
                "client_name": {"type": "string", "minLength": 1},
                "hours": {"type": "number", "minimum": 0, "maximum": 1000}
            },
            "required": ["client_name"],
            "additionalProperties": false
        }));

        assert!(s.validate(&json!({"client_name": "Acme", "hours": 12})).is_ok());

        let errors = s.validate(&json!({"hours": -1, "extra": true})).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("missing required")));
        assert!(errors.iter().any(|e| e.contains("below minimum")));
        assert!(errors.iter().any(|e| e.contains("unexpected property")));
    }

    #[test]
    fn test_array_items_validated_per_element() {
        let s = schema(json!({
            "type": "array",
            "items": {"type": "string", "pattern": "^[a-z-]+$"}
        }));
        assert!(s.validate(&json!(["alpha", "beta-two"])).is_ok());
        let errors = s.validate(&json!(["ok", "NOT OK"])).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("[1]"));
    }

    #[test]
    fn test_enum_membership() {
        let s = schema(json!({"enum": ["draft", "final"]}));
        assert!(s.validate(&json!("draft")).is_ok());
        assert!(s.validate(&json!("other")).is_err());
    }

    #[test]
    fn test_source_round_trips() {
        let doc = json!({"type": "object", "properties": {"x": {"type": "integer"}}});
        let s = schema(doc.clone());
        assert_eq!(s.source(), &doc);
    }
}
