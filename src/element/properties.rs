//! Declarative property schemas and validated property holders
//!
//! A `PropertySchema` describes the fields an element accepts. Validation
//! walks the whole value and collects every failed constraint with its
//! full path before failing, so one bad update reports all of its problems.
//!
//! ```rust,ignore
//! let schema = PropertySchema::new()
//!     .field("delay", FieldSpec::number().required().min(0.0))
//!     .field("unit", FieldSpec::string().one_of(["ms", "s"]));
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::ElementContext;
use crate::error::{ElementError, Violation};
use crate::logger::FlowLogger;

/// Type of a schema field
#[derive(Clone, Debug)]
pub enum FieldType {
    /// Any value
    Any,
    /// A string
    String,
    /// Any number
    Number,
    /// A whole number
    Integer,
    /// `true` or `false`
    Boolean,
    /// A nested object validated against its own schema
    Object(PropertySchema),
    /// An array whose items all match the inner spec
    Array(Box<FieldSpec>),
}

/// Constraints on one field
#[derive(Clone, Debug)]
pub struct FieldSpec {
    kind: FieldType,
    required: bool,
    min: Option<f64>,
    max: Option<f64>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    one_of: Option<Vec<Value>>,
    default: Option<Value>,
}

impl FieldSpec {
    /// Field of the given type with no further constraints
    pub fn of(kind: FieldType) -> Self {
        Self {
            kind,
            required: false,
            min: None,
            max: None,
            min_length: None,
            max_length: None,
            one_of: None,
            default: None,
        }
    }

    /// Any value
    pub fn any() -> Self {
        Self::of(FieldType::Any)
    }

    /// A string
    pub fn string() -> Self {
        Self::of(FieldType::String)
    }

    /// Any number
    pub fn number() -> Self {
        Self::of(FieldType::Number)
    }

    /// A whole number
    pub fn integer() -> Self {
        Self::of(FieldType::Integer)
    }

    /// A boolean
    pub fn boolean() -> Self {
        Self::of(FieldType::Boolean)
    }

    /// A nested object
    pub fn object(schema: PropertySchema) -> Self {
        Self::of(FieldType::Object(schema))
    }

    /// An array of `items`
    pub fn array(items: FieldSpec) -> Self {
        Self::of(FieldType::Array(Box::new(items)))
    }

    /// The field must be present and not null
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Minimum numeric value
    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Maximum numeric value
    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Minimum length of a string or array
    pub fn min_length(mut self, len: usize) -> Self {
        self.min_length = Some(len);
        self
    }

    /// Maximum length of a string or array
    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    /// Allowed values
    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.one_of = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Value used when the field is absent
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Ordered set of named fields
#[derive(Clone, Debug, Default)]
pub struct PropertySchema {
    fields: Vec<(String, FieldSpec)>,
}

impl PropertySchema {
    /// Create an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.push((name.into(), spec));
        self
    }

    /// Validate `value`, returning it cleaned up or every violation found
    ///
    /// Absent fields with a default are filled in. Unknown fields are
    /// rejected when `strict`, otherwise stripped.
    pub fn validate(&self, value: &Value, strict: bool) -> Result<Value, Vec<Violation>> {
        let mut violations = Vec::new();
        let cleaned = match value {
            Value::Object(map) => self.validate_object(map, "", strict, &mut violations),
            Value::Null => self.validate_object(&Map::new(), "", strict, &mut violations),
            other => {
                violations.push(Violation::new(
                    "",
                    "isObject",
                    "properties must be an object",
                    other.clone(),
                ));
                Value::Null
            }
        };
        if violations.is_empty() {
            Ok(cleaned)
        } else {
            Err(violations)
        }
    }

    fn validate_object(
        &self,
        map: &Map<String, Value>,
        prefix: &str,
        strict: bool,
        violations: &mut Vec<Violation>,
    ) -> Value {
        let mut cleaned = Map::new();

        for (name, spec) in &self.fields {
            let path = join_path(prefix, name);
            match map.get(name).filter(|v| !v.is_null()) {
                Some(value) => {
                    if let Some(v) = spec.check(&path, name, value, strict, violations) {
                        cleaned.insert(name.clone(), v);
                    }
                }
                None => {
                    if let Some(default) = &spec.default {
                        cleaned.insert(name.clone(), default.clone());
                    } else if spec.required {
                        violations.push(Violation::new(
                            path,
                            "isDefined",
                            format!("{} should not be null or undefined", name),
                            map.get(name).cloned().unwrap_or(Value::Null),
                        ));
                    }
                }
            }
        }

        for (name, value) in map {
            if self.fields.iter().any(|(field, _)| field == name) {
                continue;
            }
            if strict {
                violations.push(Violation::new(
                    join_path(prefix, name),
                    "whitelistValidation",
                    format!("property {} should not exist", name),
                    value.clone(),
                ));
            }
        }

        Value::Object(cleaned)
    }
}

impl FieldSpec {
    fn check(
        &self,
        path: &str,
        name: &str,
        value: &Value,
        strict: bool,
        violations: &mut Vec<Violation>,
    ) -> Option<Value> {
        let mut failed: BTreeMap<String, String> = BTreeMap::new();

        let cleaned = match &self.kind {
            FieldType::Any => Some(value.clone()),
            FieldType::String if value.is_string() => Some(value.clone()),
            FieldType::String => {
                failed.insert("isString".into(), format!("{} must be a string", name));
                None
            }
            FieldType::Number if value.is_number() => Some(value.clone()),
            FieldType::Number => {
                failed.insert(
                    "isNumber".into(),
                    format!("{} must be a number conforming to the specified constraints", name),
                );
                None
            }
            FieldType::Integer if is_integer(value) => Some(value.clone()),
            FieldType::Integer => {
                failed.insert("isInt".into(), format!("{} must be an integer number", name));
                None
            }
            FieldType::Boolean if value.is_boolean() => Some(value.clone()),
            FieldType::Boolean => {
                failed.insert("isBoolean".into(), format!("{} must be a boolean value", name));
                None
            }
            FieldType::Object(schema) => match value {
                Value::Object(map) => Some(schema.validate_object(map, path, strict, violations)),
                _ => {
                    failed.insert(
                        "nestedValidation".into(),
                        format!("nested property {} must be either object or array", name),
                    );
                    None
                }
            },
            FieldType::Array(items) => match value {
                Value::Array(values) => Some(Value::Array(
                    values
                        .iter()
                        .enumerate()
                        .filter_map(|(i, item)| {
                            let index = i.to_string();
                            let item_path = join_path(path, &index);
                            if item.is_null() && !items.required {
                                return Some(Value::Null);
                            }
                            items.check(&item_path, &index, item, strict, violations)
                        })
                        .collect(),
                )),
                _ => {
                    failed.insert("isArray".into(), format!("{} must be an array", name));
                    None
                }
            },
        };

        if cleaned.is_some() {
            self.check_bounds(name, value, &mut failed);
        }

        if failed.is_empty() {
            cleaned
        } else {
            violations.push(Violation {
                path: path.to_string(),
                constraints: failed,
                value: value.clone(),
            });
            None
        }
    }

    fn check_bounds(&self, name: &str, value: &Value, failed: &mut BTreeMap<String, String>) {
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min.filter(|min| n < *min) {
                failed.insert("min".into(), format!("{} must not be less than {}", name, min));
            }
            if let Some(max) = self.max.filter(|max| n > *max) {
                failed.insert("max".into(), format!("{} must not be greater than {}", name, max));
            }
        }

        let len = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(a) => Some(a.len()),
            _ => None,
        };
        if let Some(len) = len {
            if let Some(min) = self.min_length.filter(|min| len < *min) {
                failed.insert(
                    "minLength".into(),
                    format!("{} must be longer than or equal to {} characters", name, min),
                );
            }
            if let Some(max) = self.max_length.filter(|max| len > *max) {
                failed.insert(
                    "maxLength".into(),
                    format!("{} must be shorter than or equal to {} characters", name, max),
                );
            }
        }

        if let Some(allowed) = &self.one_of {
            if !allowed.contains(value) {
                let listed: Vec<String> = allowed.iter().map(crate::error::display_value).collect();
                failed.insert(
                    "isIn".into(),
                    format!(
                        "{} must be one of the following values: {}",
                        name,
                        listed.join(", ")
                    ),
                );
            }
        }
    }
}

fn is_integer(value: &Value) -> bool {
    value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Validate `value` and deserialize it into `P`
///
/// Every violation is logged at error level through `logger` before the
/// aggregate `ElementError::Validation` is returned. A `null` value is
/// treated as an empty object.
pub fn validate_properties<P: DeserializeOwned>(
    logger: &FlowLogger,
    schema: Option<&PropertySchema>,
    value: &Value,
    strict: bool,
) -> Result<P, ElementError> {
    let checked = match schema {
        Some(schema) => schema.validate(value, strict),
        None if value.is_null() => Ok(Value::Object(Map::new())),
        None => Ok(value.clone()),
    };

    let violations = match checked {
        Ok(cleaned) => match serde_json::from_value::<P>(cleaned) {
            Ok(properties) => return Ok(properties),
            Err(e) => vec![Violation::new("", "deserialization", e.to_string(), value.clone())],
        },
        Err(violations) => violations,
    };

    for violation in &violations {
        logger.error(violation.to_string());
    }
    Err(ElementError::Validation(violations))
}

/// Validated, replaceable properties of an element
///
/// Readers take a cheap snapshot with `get`; a replacement is validated in
/// full before it becomes visible, so in-flight handlers keep the snapshot
/// they started with and a failed update changes nothing.
pub struct Properties<P> {
    schema: Option<Arc<PropertySchema>>,
    strict: bool,
    interpolate: bool,
    context: ElementContext,
    raw: RwLock<Value>,
    current: RwLock<Arc<P>>,
}

impl<P: DeserializeOwned + Send + Sync> Properties<P> {
    /// Validate the initial properties
    pub fn new(
        context: &ElementContext,
        schema: Option<PropertySchema>,
        value: Value,
    ) -> Result<Self, ElementError> {
        Self::build(context, schema, value, false, false)
    }

    /// Validate the initial properties, rejecting unknown fields
    pub fn strict(
        context: &ElementContext,
        schema: PropertySchema,
        value: Value,
    ) -> Result<Self, ElementError> {
        Self::build(context, Some(schema), value, true, false)
    }

    /// Validate the initial properties after filling `${flow.*}` placeholders
    ///
    /// The raw value is kept so `refresh` can re-apply flow properties.
    pub fn interpolated(
        context: &ElementContext,
        schema: Option<PropertySchema>,
        value: Value,
    ) -> Result<Self, ElementError> {
        Self::build(context, schema, value, false, true)
    }

    fn build(
        context: &ElementContext,
        schema: Option<PropertySchema>,
        value: Value,
        strict: bool,
        interpolate: bool,
    ) -> Result<Self, ElementError> {
        let schema = schema.map(Arc::new);
        let effective = if interpolate {
            context.interpolate(&value)
        } else {
            value.clone()
        };
        let initial =
            validate_properties::<P>(context.logger(), schema.as_deref(), &effective, strict)?;
        Ok(Self {
            schema,
            strict,
            interpolate,
            context: context.clone(),
            raw: RwLock::new(value),
            current: RwLock::new(Arc::new(initial)),
        })
    }

    /// Current properties
    pub fn get(&self) -> Arc<P> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Validate a value against this holder's schema without applying it
    pub fn validate(&self, value: &Value) -> Result<P, ElementError> {
        validate_properties(self.context.logger(), self.schema.as_deref(), value, self.strict)
    }

    /// Replace the properties; nothing changes if validation fails
    pub fn set(&self, value: Value) -> Result<(), ElementError> {
        let effective = if self.interpolate {
            self.context.interpolate(&value)
        } else {
            value.clone()
        };
        let next = self.validate(&effective)?;
        *self
            .raw
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(next);
        Ok(())
    }

    /// Re-derive the properties from the last raw value, e.g. after flow properties changed
    pub fn refresh(&self) -> Result<(), ElementError> {
        let raw = self
            .raw
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        self.set(raw)
    }
}

impl<P: std::fmt::Debug> std::fmt::Debug for Properties<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        f.debug_struct("Properties")
            .field("strict", &self.strict)
            .field("current", &current)
            .finish()
    }
}
