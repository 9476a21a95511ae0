//! Dynamic field schemas.
//!
//! An intent declares the shape of the summaries it wants as a loose field
//! mapping, e.g.
//!
//! ```json
//! { "topic": "str", "tags": ["str"], "owners": {"*": "str"}, "note?": "str" }
//! ```
//!
//! [`compile`] turns such a mapping into a [`TypeDescriptor`]. The descriptor
//! serves twice: rendered with [`TypeDescriptor::to_json_schema`] it is the
//! format contract sent to the generation backend, and
//! [`TypeDescriptor::validate`] checks whatever JSON comes back.
//!
//! # Type expressions
//!
//! | Expression | Meaning |
//! |------------|---------|
//! | `"str"`, `"int"`, `"float"`, `"bool"`, `"any"` | primitive (unknown names mean string) |
//! | `["str"]` | list of the element type |
//! | `[]` | untyped list |
//! | `{"*": T}` | map from any key to `T` |
//! | `{ ... }` | nested object, compiled recursively |
//!
//! A trailing `?` on a field name makes the field optional: it may be absent
//! or `null` and normalizes to `null`.

use serde_json::{json, Map, Value};

use crate::error::{DocpackError, Result};

/// Key that turns an object expression into a map.
pub const WILDCARD_KEY: &str = "*";
/// Suffix that marks a field optional.
pub const OPTIONAL_MARKER: char = '?';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    String,
    Integer,
    Float,
    Boolean,
    Any,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeDescriptor {
    Primitive(Primitive),
    /// `None` is an untyped list.
    List(Option<Box<TypeDescriptor>>),
    /// String keys, values of the given type.
    Map(Box<TypeDescriptor>),
    Object(ObjectSchema),
    Nullable(Box<TypeDescriptor>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSchema {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: TypeDescriptor,
    pub required: bool,
}

/// Compile a field mapping into an object descriptor named `name`.
pub fn compile(name: &str, spec: &Map<String, Value>) -> Result<TypeDescriptor> {
    compile_object(name, spec, "$").map(TypeDescriptor::Object)
}

/// Check a field mapping without keeping the result.
pub fn validate_schema(spec: &Value) -> Result<()> {
    let map = spec.as_object().ok_or_else(|| DocpackError::Schema {
        path: "$".to_string(),
        message: format!("schema must be a mapping, got {}", json_type_name(spec)),
    })?;
    compile("Schema", map).map(|_| ())
}

fn compile_object(name: &str, spec: &Map<String, Value>, path: &str) -> Result<ObjectSchema> {
    if spec.is_empty() {
        return Err(schema_error(path, "field mapping cannot be empty"));
    }

    let mut fields: Vec<FieldDescriptor> = Vec::with_capacity(spec.len());
    for (raw_name, expr) in spec {
        let (field_name, required) = match raw_name.strip_suffix(OPTIONAL_MARKER) {
            Some(stripped) => (stripped, false),
            None => (raw_name.as_str(), true),
        };
        let field_path = format!("{}.{}", path, raw_name);

        if field_name.trim().is_empty() {
            return Err(schema_error(&field_path, "field name cannot be empty"));
        }
        if field_name.ends_with(OPTIONAL_MARKER) {
            return Err(schema_error(&field_path, "only one trailing '?' is allowed"));
        }
        if fields.iter().any(|f| f.name == field_name) {
            return Err(schema_error(
                &field_path,
                &format!("duplicate field '{}'", field_name),
            ));
        }

        let ty = compile_type(field_name, expr, &field_path)?;
        let ty = if required {
            ty
        } else {
            TypeDescriptor::Nullable(Box::new(ty))
        };
        fields.push(FieldDescriptor {
            name: field_name.to_string(),
            ty,
            required,
        });
    }

    Ok(ObjectSchema {
        name: name.to_string(),
        fields,
    })
}

fn compile_type(field_name: &str, expr: &Value, path: &str) -> Result<TypeDescriptor> {
    match expr {
        Value::String(name) => Ok(TypeDescriptor::Primitive(parse_primitive(name))),
        Value::Array(items) => match items.as_slice() {
            [] => Ok(TypeDescriptor::List(None)),
            [element] => {
                let inner = compile_type(field_name, element, &format!("{}[0]", path))?;
                Ok(TypeDescriptor::List(Some(Box::new(inner))))
            }
            _ => Err(schema_error(
                path,
                "list expressions take exactly one example element",
            )),
        },
        Value::Object(map) if map.contains_key(WILDCARD_KEY) => {
            if map.len() != 1 {
                return Err(schema_error(
                    path,
                    "a '*' map cannot declare other keys",
                ));
            }
            let value = &map[WILDCARD_KEY];
            let inner = compile_type(field_name, value, &format!("{}.*", path))?;
            Ok(TypeDescriptor::Map(Box::new(inner)))
        }
        Value::Object(map) => {
            compile_object(&nested_name(field_name), map, path).map(TypeDescriptor::Object)
        }
        Value::Number(n) if n.is_f64() => Ok(TypeDescriptor::Primitive(Primitive::Float)),
        Value::Number(_) => Ok(TypeDescriptor::Primitive(Primitive::Integer)),
        Value::Bool(_) => Ok(TypeDescriptor::Primitive(Primitive::Boolean)),
        Value::Null => Err(schema_error(path, "null is not a type expression")),
    }
}

fn parse_primitive(name: &str) -> Primitive {
    match name.trim().to_ascii_lowercase().as_str() {
        "int" | "integer" => Primitive::Integer,
        "float" | "number" => Primitive::Float,
        "bool" | "boolean" => Primitive::Boolean,
        "any" => Primitive::Any,
        _ => Primitive::String,
    }
}

/// `key_terms` → `KeyTerms`
fn nested_name(field_name: &str) -> String {
    field_name
        .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

fn schema_error(path: &str, message: &str) -> DocpackError {
    DocpackError::Schema {
        path: path.to_string(),
        message: message.to_string(),
    }
}

impl TypeDescriptor {
    /// Render as a JSON Schema document.
    pub fn to_json_schema(&self) -> Value {
        match self {
            TypeDescriptor::Primitive(Primitive::String) => json!({"type": "string"}),
            TypeDescriptor::Primitive(Primitive::Integer) => json!({"type": "integer"}),
            TypeDescriptor::Primitive(Primitive::Float) => json!({"type": "number"}),
            TypeDescriptor::Primitive(Primitive::Boolean) => json!({"type": "boolean"}),
            TypeDescriptor::Primitive(Primitive::Any) => json!({}),
            TypeDescriptor::List(None) => json!({"type": "array", "items": {}}),
            TypeDescriptor::List(Some(inner)) => {
                json!({"type": "array", "items": inner.to_json_schema()})
            }
            TypeDescriptor::Map(inner) => {
                json!({"type": "object", "additionalProperties": inner.to_json_schema()})
            }
            TypeDescriptor::Nullable(inner) => json!({
                "anyOf": [inner.to_json_schema(), {"type": "null"}],
                "default": null,
            }),
            TypeDescriptor::Object(object) => {
                let mut properties = Map::new();
                let mut required = Vec::new();
                for field in &object.fields {
                    properties.insert(field.name.clone(), field.ty.to_json_schema());
                    if field.required {
                        required.push(Value::from(field.name.clone()));
                    }
                }
                json!({
                    "title": object.name,
                    "type": "object",
                    "properties": properties,
                    "required": required,
                })
            }
        }
    }

    /// Check `value` against this descriptor.
    ///
    /// Returns the normalized value (optional fields present as `null`,
    /// undeclared fields dropped) or every violation found, each prefixed
    /// with its JSON path.
    pub fn validate(&self, value: &Value) -> std::result::Result<Value, Vec<String>> {
        let mut issues = Vec::new();
        let normalized = self.check(value, "$", &mut issues);
        if issues.is_empty() {
            Ok(normalized)
        } else {
            Err(issues)
        }
    }

    fn check(&self, value: &Value, path: &str, issues: &mut Vec<String>) -> Value {
        match self {
            TypeDescriptor::Primitive(primitive) => {
                let ok = match primitive {
                    Primitive::String => value.is_string(),
                    Primitive::Integer => value.is_i64() || value.is_u64(),
                    Primitive::Float => value.is_number(),
                    Primitive::Boolean => value.is_boolean(),
                    Primitive::Any => true,
                };
                if !ok {
                    issues.push(format!(
                        "{}: expected {}, got {}",
                        path,
                        primitive_name(*primitive),
                        json_type_name(value)
                    ));
                }
                value.clone()
            }
            TypeDescriptor::Nullable(inner) => {
                if value.is_null() {
                    Value::Null
                } else {
                    inner.check(value, path, issues)
                }
            }
            TypeDescriptor::List(element) => match value.as_array() {
                Some(items) => match element {
                    Some(element) => Value::Array(
                        items
                            .iter()
                            .enumerate()
                            .map(|(i, item)| element.check(item, &format!("{}[{}]", path, i), issues))
                            .collect(),
                    ),
                    None => value.clone(),
                },
                None => {
                    issues.push(format!("{}: expected list, got {}", path, json_type_name(value)));
                    value.clone()
                }
            },
            TypeDescriptor::Map(inner) => match value.as_object() {
                Some(map) => Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), inner.check(v, &format!("{}.{}", path, k), issues)))
                        .collect(),
                ),
                None => {
                    issues.push(format!("{}: expected map, got {}", path, json_type_name(value)));
                    value.clone()
                }
            },
            TypeDescriptor::Object(object) => match value.as_object() {
                Some(map) => {
                    let mut out = Map::new();
                    for field in &object.fields {
                        let field_path = format!("{}.{}", path, field.name);
                        match map.get(&field.name) {
                            Some(v) => {
                                out.insert(field.name.clone(), field.ty.check(v, &field_path, issues));
                            }
                            None if field.required => {
                                issues.push(format!("{}: missing required field", field_path));
                            }
                            None => {
                                out.insert(field.name.clone(), Value::Null);
                            }
                        }
                    }
                    Value::Object(out)
                }
                None => {
                    issues.push(format!(
                        "{}: expected object, got {}",
                        path,
                        json_type_name(value)
                    ));
                    value.clone()
                }
            },
        }
    }

    /// Parse raw generated text and validate it as the output for `unit`.
    pub fn validate_generated(&self, unit: &str, raw: &str) -> Result<Map<String, Value>> {
        let value: Value =
            serde_json::from_str(raw.trim()).map_err(|e| DocpackError::SchemaValidation {
                unit: unit.to_string(),
                issues: vec![format!("$: not valid JSON: {}", e)],
            })?;
        let normalized = self
            .validate(&value)
            .map_err(|issues| DocpackError::SchemaValidation {
                unit: unit.to_string(),
                issues,
            })?;
        match normalized {
            Value::Object(map) => Ok(map),
            other => Err(DocpackError::SchemaValidation {
                unit: unit.to_string(),
                issues: vec![format!("$: expected object, got {}", json_type_name(&other))],
            }),
        }
    }

    /// Top-level field names, if this is an object descriptor.
    pub fn field_names(&self) -> Vec<&str> {
        match self {
            TypeDescriptor::Object(object) => object.fields.iter().map(|f| f.name.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

fn primitive_name(primitive: Primitive) -> &'static str {
    match primitive {
        Primitive::String => "string",
        Primitive::Integer => "integer",
        Primitive::Float => "number",
        Primitive::Boolean => "boolean",
        Primitive::Any => "any",
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
