//! Schema validation for property values, action arguments and event payloads.
//!
//! A [`Schema`] describes the shape a JSON value must have. Validation is a pure
//! function: it never mutates its input, and returns the (possibly coerced)
//! value that should be committed. The only coercions performed are
//!
//! - clamping numbers into their bounds when `crop_to_bounds` is set, and
//! - turning integral floats (`3.0`) into integers for `Integer` schemas.
//!
//! # Example
//!
//! ```rust
//! use remote_daq::schema::{NumericBounds, Schema};
//! use serde_json::json;
//!
//! let frame_rate = Schema::number().with_bounds(NumericBounds::new(0.0, 40.0).cropped());
//! assert_eq!(frame_rate.validate(&json!(55.0)).unwrap(), json!(40.0));
//! ```
//!
//! Structured schemas can be written by hand or parsed from the JSON-schema
//! subset used in instrument definitions with [`Schema::from_json`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::RemoteError;

// =============================================================================
// Numeric bounds
// =============================================================================

/// Numeric range with per-side inclusive/exclusive semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericBounds {
    /// Lower bound, `None` for unbounded.
    pub min: Option<f64>,
    /// Upper bound, `None` for unbounded.
    pub max: Option<f64>,
    /// Whether `min` itself is an accepted value.
    pub inclusive_min: bool,
    /// Whether `max` itself is an accepted value.
    pub inclusive_max: bool,
    /// Clamp out-of-range values to the nearest bound instead of rejecting them.
    pub crop_to_bounds: bool,
}

impl NumericBounds {
    /// Inclusive bounds on both sides.
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            inclusive_min: true,
            inclusive_max: true,
            crop_to_bounds: false,
        }
    }

    /// Only a lower bound.
    pub fn at_least(min: f64) -> Self {
        Self {
            min: Some(min),
            max: None,
            inclusive_min: true,
            inclusive_max: true,
            crop_to_bounds: false,
        }
    }

    /// Only an upper bound.
    pub fn at_most(max: f64) -> Self {
        Self {
            min: None,
            max: Some(max),
            inclusive_min: true,
            inclusive_max: true,
            crop_to_bounds: false,
        }
    }

    /// Set inclusive flags for (min, max).
    pub fn inclusive(mut self, inclusive_min: bool, inclusive_max: bool) -> Self {
        self.inclusive_min = inclusive_min;
        self.inclusive_max = inclusive_max;
        self
    }

    /// Clamp instead of reject.
    pub fn cropped(mut self) -> Self {
        self.crop_to_bounds = true;
        self
    }

    fn below_min(&self, value: f64) -> bool {
        match self.min {
            Some(min) if self.inclusive_min => value < min,
            Some(min) => value <= min,
            None => false,
        }
    }

    fn above_max(&self, value: f64) -> bool {
        match self.max {
            Some(max) if self.inclusive_max => value > max,
            Some(max) => value >= max,
            None => false,
        }
    }

    fn describe(&self) -> String {
        let open = if self.inclusive_min { '[' } else { '(' };
        let close = if self.inclusive_max { ']' } else { ')' };
        let min = self.min.map_or("-inf".to_string(), |v| v.to_string());
        let max = self.max.map_or("inf".to_string(), |v| v.to_string());
        format!("{}{}, {}{}", open, min, max, close)
    }

    /// Check `value`, returning the value to commit.
    ///
    /// When cropping, an out-of-range value becomes the nearest bound itself,
    /// whether or not that side is inclusive.
    pub fn apply(&self, value: f64, path: &str) -> Result<f64, RemoteError> {
        if value.is_nan() {
            return Err(RemoteError::Validation(format!("{}: NaN is not allowed", path)));
        }
        let below = self.below_min(value);
        let above = self.above_max(value);
        if !below && !above {
            return Ok(value);
        }
        if self.crop_to_bounds {
            // below/above are only true when the matching bound exists
            let cropped = if below { self.min } else { self.max };
            if let Some(bound) = cropped {
                return Ok(bound);
            }
        }
        Err(RemoteError::Validation(format!(
            "{}: value {} out of bounds {}",
            path,
            value,
            self.describe()
        )))
    }

    /// Integer counterpart of [`apply`](Self::apply), exact for the whole
    /// `i64`/`u64` range.
    ///
    /// Cropping yields the bound rounded toward the inside of the range.
    pub fn apply_integer(&self, value: i128, path: &str) -> Result<i128, RemoteError> {
        // for an integer v: v < b <=> v < ceil(b), v > b <=> v > floor(b)
        let below = match self.min {
            Some(min) if self.inclusive_min => value < min.ceil() as i128,
            Some(min) => value <= min.floor() as i128,
            None => false,
        };
        let above = match self.max {
            Some(max) if self.inclusive_max => value > max.floor() as i128,
            Some(max) => value >= max.ceil() as i128,
            None => false,
        };
        if !below && !above {
            return Ok(value);
        }
        if self.crop_to_bounds {
            match (below, self.min, self.max) {
                (true, Some(min), _) => return Ok(min.ceil() as i128),
                (false, _, Some(max)) => return Ok(max.floor() as i128),
                _ => {}
            }
        }
        Err(RemoteError::Validation(format!(
            "{}: value {} out of bounds {}",
            path,
            value,
            self.describe()
        )))
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Shape description for a JSON value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schema {
    /// Anything, including null.
    #[default]
    Any,
    /// `true` / `false`.
    Boolean,
    /// Whole numbers.
    Integer {
        /// Optional range constraint
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bounds: Option<NumericBounds>,
    },
    /// Any JSON number.
    Number {
        /// Optional range constraint
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bounds: Option<NumericBounds>,
    },
    /// Strings, optionally restricted to a set of choices.
    String {
        /// Permitted values (`enum` in JSON schema)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        choices: Option<Vec<String>>,
    },
    /// Homogeneous arrays.
    Array {
        /// Schema of every element (`None` = any element)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        items: Option<Box<Schema>>,
        /// Minimum length
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_items: Option<usize>,
        /// Maximum length
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_items: Option<usize>,
    },
    /// Objects with named fields.
    Object {
        /// Declared fields
        #[serde(default)]
        properties: BTreeMap<String, Schema>,
        /// Fields that must be present
        #[serde(default)]
        required: Vec<String>,
        /// Accept fields not listed in `properties`
        #[serde(default)]
        additional_properties: bool,
    },
    /// One of a fixed set of arbitrary values.
    Enum {
        /// Permitted values
        values: Vec<Value>,
    },
    /// The inner schema, or null.
    Nullable {
        /// Schema for non-null values
        inner: Box<Schema>,
    },
}

impl Schema {
    /// Unbounded number schema.
    pub fn number() -> Self {
        Schema::Number { bounds: None }
    }

    /// Unbounded integer schema.
    pub fn integer() -> Self {
        Schema::Integer { bounds: None }
    }

    /// Any string.
    pub fn string() -> Self {
        Schema::String { choices: None }
    }

    /// String restricted to `choices`.
    pub fn choices<I, S>(choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Schema::String {
            choices: Some(choices.into_iter().map(Into::into).collect()),
        }
    }

    /// Boolean schema.
    pub fn boolean() -> Self {
        Schema::Boolean
    }

    /// Array of `items`.
    pub fn array_of(items: Schema) -> Self {
        Schema::Array {
            items: Some(Box::new(items)),
            min_items: None,
            max_items: None,
        }
    }

    /// Empty closed object; add fields with [`Schema::field`].
    pub fn object() -> Self {
        Schema::Object {
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: false,
        }
    }

    /// Add a field to an object schema. No-op on other schemas.
    pub fn field(mut self, name: impl Into<String>, schema: Schema, required: bool) -> Self {
        if let Schema::Object {
            properties,
            required: req,
            ..
        } = &mut self
        {
            let name = name.into();
            if required {
                req.push(name.clone());
            }
            properties.insert(name, schema);
        }
        self
    }

    /// Allow undeclared fields on an object schema.
    pub fn allow_additional(mut self) -> Self {
        if let Schema::Object {
            additional_properties,
            ..
        } = &mut self
        {
            *additional_properties = true;
        }
        self
    }

    /// Attach bounds to a numeric schema. No-op on other schemas.
    pub fn with_bounds(mut self, new_bounds: NumericBounds) -> Self {
        match &mut self {
            Schema::Number { bounds } | Schema::Integer { bounds } => *bounds = Some(new_bounds),
            Schema::Nullable { inner } => {
                let schema = std::mem::take(inner.as_mut());
                **inner = schema.with_bounds(new_bounds);
            }
            _ => {}
        }
        self
    }

    /// Wrap in [`Schema::Nullable`].
    pub fn nullable(self) -> Self {
        match self {
            Schema::Nullable { .. } | Schema::Any => self,
            other => Schema::Nullable {
                inner: Box::new(other),
            },
        }
    }

    /// Numeric bounds of this schema, if any.
    pub fn bounds(&self) -> Option<&NumericBounds> {
        match self {
            Schema::Number { bounds } | Schema::Integer { bounds } => bounds.as_ref(),
            Schema::Nullable { inner } => inner.bounds(),
            _ => None,
        }
    }

    /// Validate `value`, returning the value to commit.
    pub fn validate(&self, value: &Value) -> Result<Value, RemoteError> {
        self.validate_at(value, "value")
    }

    /// Validate with `path` used as the location prefix in error messages.
    pub fn validate_at(&self, value: &Value, path: &str) -> Result<Value, RemoteError> {
        match self {
            Schema::Any => Ok(value.clone()),
            Schema::Nullable { inner } => {
                if value.is_null() {
                    Ok(Value::Null)
                } else {
                    inner.validate_at(value, path)
                }
            }
            Schema::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                other => Err(type_mismatch(path, "boolean", other)),
            },
            Schema::Number { bounds } => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| type_mismatch(path, "number", value))?;
                match bounds {
                    Some(bounds) => {
                        let checked = bounds.apply(number, path)?;
                        if checked == number {
                            Ok(value.clone())
                        } else {
                            Ok(Value::from(checked))
                        }
                    }
                    None => Ok(value.clone()),
                }
            }
            Schema::Integer { bounds } => {
                let integer = as_integer(value).ok_or_else(|| type_mismatch(path, "integer", value))?;
                let checked = match bounds {
                    Some(bounds) => bounds.apply_integer(integer, path)?,
                    None => integer,
                };
                if checked == integer && !value.is_f64() {
                    Ok(value.clone())
                } else {
                    integer_value(checked, path)
                }
            }
            Schema::String { choices } => {
                let text = value
                    .as_str()
                    .ok_or_else(|| type_mismatch(path, "string", value))?;
                if let Some(choices) = choices {
                    if !choices.iter().any(|c| c == text) {
                        return Err(RemoteError::Validation(format!(
                            "{}: '{}' is not one of [{}]",
                            path,
                            text,
                            choices.join(", ")
                        )));
                    }
                }
                Ok(value.clone())
            }
            Schema::Enum { values } => {
                if values.iter().any(|v| v == value) {
                    Ok(value.clone())
                } else {
                    Err(RemoteError::Validation(format!(
                        "{}: {} is not one of the permitted values",
                        path, value
                    )))
                }
            }
            Schema::Array {
                items,
                min_items,
                max_items,
            } => {
                let elements = value
                    .as_array()
                    .ok_or_else(|| type_mismatch(path, "array", value))?;
                if let Some(min) = min_items {
                    if elements.len() < *min {
                        return Err(RemoteError::Validation(format!(
                            "{}: expected at least {} items, got {}",
                            path,
                            min,
                            elements.len()
                        )));
                    }
                }
                if let Some(max) = max_items {
                    if elements.len() > *max {
                        return Err(RemoteError::Validation(format!(
                            "{}: expected at most {} items, got {}",
                            path,
                            max,
                            elements.len()
                        )));
                    }
                }
                match items {
                    Some(item_schema) => elements
                        .iter()
                        .enumerate()
                        .map(|(i, element)| {
                            item_schema.validate_at(element, &format!("{}[{}]", path, i))
                        })
                        .collect::<Result<Vec<_>, _>>()
                        .map(Value::Array),
                    None => Ok(value.clone()),
                }
            }
            Schema::Object {
                properties,
                required,
                additional_properties,
            } => {
                let fields = value
                    .as_object()
                    .ok_or_else(|| type_mismatch(path, "object", value))?;
                for name in required {
                    if !fields.contains_key(name) {
                        return Err(RemoteError::Validation(format!(
                            "{}: missing required field '{}'",
                            path, name
                        )));
                    }
                }
                let mut validated = Map::with_capacity(fields.len());
                for (name, field_value) in fields {
                    let field_path = format!("{}.{}", path, name);
                    match properties.get(name) {
                        Some(field_schema) => {
                            validated.insert(
                                name.clone(),
                                field_schema.validate_at(field_value, &field_path)?,
                            );
                        }
                        None if *additional_properties => {
                            validated.insert(name.clone(), field_value.clone());
                        }
                        None => {
                            return Err(RemoteError::Validation(format!(
                                "{}: unexpected field",
                                field_path
                            )));
                        }
                    }
                }
                Ok(Value::Object(validated))
            }
        }
    }

    /// Parse the JSON-schema subset used in instrument definitions.
    ///
    /// Supported keywords: `type` (string or array, `"null"` makes the schema
    /// nullable), `enum`, `minimum`, `maximum`, `exclusiveMinimum`,
    /// `exclusiveMaximum`, `properties`, `required`, `additionalProperties`,
    /// `items`, `minItems`, `maxItems`. Objects reject unknown fields unless
    /// `additionalProperties` is explicitly `true`.
    pub fn from_json(schema: &Value) -> Result<Self, RemoteError> {
        let definition = schema
            .as_object()
            .ok_or_else(|| RemoteError::Validation("schema must be a JSON object".into()))?;

        let (type_name, nullable) = match definition.get("type") {
            None => (None, false),
            Some(Value::String(t)) => (Some(t.as_str()), false),
            Some(Value::Array(types)) => {
                let names: Vec<&str> = types.iter().filter_map(Value::as_str).collect();
                let nullable = names.contains(&"null");
                let concrete: Vec<&str> = names.into_iter().filter(|t| *t != "null").collect();
                match concrete.as_slice() {
                    [] => (Some("null"), false),
                    [single] => (Some(*single), nullable),
                    _ => (None, nullable),
                }
            }
            Some(other) => {
                return Err(RemoteError::Validation(format!(
                    "unsupported schema type declaration {}",
                    other
                )))
            }
        };

        let parsed = match (type_name, definition.get("enum")) {
            (Some("string"), Some(Value::Array(values))) if values.iter().all(Value::is_string) => {
                Schema::choices(values.iter().filter_map(Value::as_str))
            }
            (_, Some(Value::Array(values))) => Schema::Enum {
                values: values.clone(),
            },
            (None, _) => Schema::Any,
            (Some("null"), _) => Schema::Enum {
                values: vec![Value::Null],
            },
            (Some("boolean"), _) => Schema::Boolean,
            (Some("string"), _) => Schema::string(),
            (Some("number"), _) => Schema::Number {
                bounds: parse_bounds(definition),
            },
            (Some("integer"), _) => Schema::Integer {
                bounds: parse_bounds(definition),
            },
            (Some("array"), _) => Schema::Array {
                items: match definition.get("items") {
                    Some(items) => Some(Box::new(Schema::from_json(items)?)),
                    None => None,
                },
                min_items: definition.get("minItems").and_then(Value::as_u64).map(|n| n as usize),
                max_items: definition.get("maxItems").and_then(Value::as_u64).map(|n| n as usize),
            },
            (Some("object"), _) => {
                let mut properties = BTreeMap::new();
                if let Some(Value::Object(fields)) = definition.get("properties") {
                    for (name, field) in fields {
                        properties.insert(name.clone(), Schema::from_json(field)?);
                    }
                }
                let required = definition
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Schema::Object {
                    properties,
                    required,
                    additional_properties: matches!(
                        definition.get("additionalProperties"),
                        Some(Value::Bool(true))
                    ),
                }
            }
            (Some(other), _) => {
                return Err(RemoteError::Validation(format!(
                    "unsupported schema type '{}'",
                    other
                )))
            }
        };

        Ok(if nullable { parsed.nullable() } else { parsed })
    }
}

fn parse_bounds(definition: &Map<String, Value>) -> Option<NumericBounds> {
    let minimum = definition.get("minimum").and_then(Value::as_f64);
    let maximum = definition.get("maximum").and_then(Value::as_f64);
    let exclusive_minimum = definition.get("exclusiveMinimum").and_then(Value::as_f64);
    let exclusive_maximum = definition.get("exclusiveMaximum").and_then(Value::as_f64);

    if minimum.is_none()
        && maximum.is_none()
        && exclusive_minimum.is_none()
        && exclusive_maximum.is_none()
    {
        return None;
    }

    Some(NumericBounds {
        min: exclusive_minimum.or(minimum),
        max: exclusive_maximum.or(maximum),
        inclusive_min: exclusive_minimum.is_none(),
        inclusive_max: exclusive_maximum.is_none(),
        crop_to_bounds: false,
    })
}

fn as_integer(value: &Value) -> Option<i128> {
    if let Some(i) = value.as_i64() {
        return Some(i128::from(i));
    }
    if let Some(u) = value.as_u64() {
        return Some(i128::from(u));
    }
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Some(f as i128),
        _ => None,
    }
}

fn integer_value(value: i128, path: &str) -> Result<Value, RemoteError> {
    if let Ok(i) = i64::try_from(value) {
        return Ok(Value::from(i));
    }
    u64::try_from(value)
        .map(Value::from)
        .map_err(|_| RemoteError::Validation(format!("{}: integer {} is out of range", path, value)))
}

fn type_mismatch(path: &str, expected: &str, got: &Value) -> RemoteError {
    let got = match got {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    RemoteError::Validation(format!("{}: expected {}, got {}", path, expected, got))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_rejects_out_of_bounds() {
        let schema = Schema::number().with_bounds(NumericBounds::new(0.0, 40.0));
        assert_eq!(schema.validate(&json!(12.5)).unwrap(), json!(12.5));
        assert!(schema.validate(&json!(40.1)).is_err());
        assert!(schema.validate(&json!(-1)).is_err());
    }

    #[test]
    fn test_number_crops_to_nearest_bound() {
        let schema = Schema::number().with_bounds(NumericBounds::new(0.0, 40.0).cropped());
        assert_eq!(schema.validate(&json!(1000)).unwrap(), json!(40.0));
        assert_eq!(schema.validate(&json!(-3.5)).unwrap(), json!(0.0));
    }

    #[test]
    fn test_exclusive_bounds() {
        let schema = Schema::number().with_bounds(NumericBounds::at_least(0.0).inclusive(false, true));
        assert!(schema.validate(&json!(0.0)).is_err());
        assert!(schema.validate(&json!(0.001)).is_ok());

        let schema = Schema::integer().with_bounds(NumericBounds::new(1.0, 255.0).inclusive(true, false));
        assert!(schema.validate(&json!(1)).is_ok());
        assert!(schema.validate(&json!(255)).is_err());
    }

    #[test]
    fn test_integer_type_checking() {
        let schema = Schema::integer();
        assert_eq!(schema.validate(&json!(3)).unwrap(), json!(3));
        assert_eq!(schema.validate(&json!(3.0)).unwrap(), json!(3));
        assert!(schema.validate(&json!(3.5)).is_err());
        assert!(schema.validate(&json!("3")).is_err());
    }

    #[test]
    fn test_integer_crop_with_fractional_bound() {
        let schema = Schema::integer().with_bounds(NumericBounds::new(0.5, 9.5).cropped());
        assert_eq!(schema.validate(&json!(-4)).unwrap(), json!(1));
        assert_eq!(schema.validate(&json!(12)).unwrap(), json!(9));
    }

    #[test]
    fn test_large_integers_are_exact() {
        let schema = Schema::integer().with_bounds(NumericBounds::new(0.0, 1e19));
        // 2^53 + 1 has no exact f64 representation
        let big = json!(9_007_199_254_740_993_i64);
        assert_eq!(schema.validate(&big).unwrap(), big);
        let unsigned = json!(18_000_000_000_000_000_000_u64);
        assert!(schema.validate(&unsigned).is_err());
        let in_range = json!(9_999_999_999_999_999_999_u64);
        assert_eq!(schema.validate(&in_range).unwrap(), in_range);

        let capped = Schema::integer().with_bounds(NumericBounds::at_most(1e15).cropped());
        assert_eq!(capped.validate(&json!(i64::MAX)).unwrap(), json!(1_000_000_000_000_000_i64));
        assert_eq!(Schema::integer().validate(&json!(i64::MIN)).unwrap(), json!(i64::MIN));
    }

    #[test]
    fn test_string_choices() {
        let schema = Schema::choices(["A", "B", "EXTERNAL"]);
        assert!(schema.validate(&json!("B")).is_ok());
        let err = schema.validate(&json!("Z")).unwrap_err();
        assert!(err.to_string().contains("not one of"));
    }

    #[test]
    fn test_object_required_and_unknown_fields() {
        let schema = Schema::object()
            .field("timestamp", Schema::string(), true)
            .field("energy", Schema::number(), true);

        assert!(schema
            .validate(&json!({"timestamp": "12:00:00", "energy": 1.2e-3}))
            .is_ok());

        let missing = schema.validate(&json!({"timestamp": "12:00:00"})).unwrap_err();
        assert!(missing.to_string().contains("missing required field 'energy'"));

        let extra = schema
            .validate(&json!({"timestamp": "t", "energy": 1.0, "unit": "J"}))
            .unwrap_err();
        assert!(extra.to_string().contains("value.unit: unexpected field"));

        let open = schema.allow_additional();
        assert!(open
            .validate(&json!({"timestamp": "t", "energy": 1.0, "unit": "J"}))
            .is_ok());
    }

    #[test]
    fn test_nested_validation_reports_path() {
        let schema = Schema::object().field(
            "channels",
            Schema::array_of(Schema::integer().with_bounds(NumericBounds::new(0.0, 3.0))),
            true,
        );
        let err = schema.validate(&json!({"channels": [0, 1, 7]})).unwrap_err();
        assert!(err.to_string().contains("value.channels[2]"));
    }

    #[test]
    fn test_validation_does_not_mutate_input() {
        let schema = Schema::number().with_bounds(NumericBounds::new(0.0, 1.0).cropped());
        let input = json!(5.0);
        let output = schema.validate(&input).unwrap();
        assert_eq!(input, json!(5.0));
        assert_eq!(output, json!(1.0));
    }

    #[test]
    fn test_nullable() {
        let schema = Schema::integer().nullable();
        assert_eq!(schema.validate(&Value::Null).unwrap(), Value::Null);
        assert!(Schema::integer().validate(&Value::Null).is_err());
    }

    #[test]
    fn test_from_json_trigger_schema() {
        let schema = Schema::from_json(&json!({
            "type": "object",
            "properties": {
                "enabled": {"type": "boolean"},
                "channel": {"type": "string", "enum": ["A", "B", "C", "D", "EXTERNAL", "AUX"]},
                "threshold": {"type": "number"},
                "delay": {"type": "integer"},
                "auto_trigger": {"type": "integer", "minimum": 0}
            },
            "required": ["channel"]
        }))
        .unwrap();

        assert!(schema
            .validate(&json!({"enabled": true, "channel": "A", "threshold": 0.5, "auto_trigger": 10}))
            .is_ok());
        assert!(schema.validate(&json!({"channel": "Q"})).is_err());
        assert!(schema
            .validate(&json!({"channel": "A", "auto_trigger": -1}))
            .is_err());
    }

    #[test]
    fn test_from_json_exclusive_and_nullable() {
        let schema = Schema::from_json(&json!({
            "type": ["number", "null"],
            "exclusiveMinimum": 0
        }))
        .unwrap();
        assert!(schema.validate(&Value::Null).is_ok());
        assert!(schema.validate(&json!(0)).is_err());
        assert!(schema.validate(&json!(0.1)).is_ok());
    }

    #[test]
    fn test_schema_serde_roundtrip_shape() {
        let schema = Schema::number().with_bounds(NumericBounds::new(1.0, 2.0));
        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["type"], "number");
        assert_eq!(json["bounds"]["min"], 1.0);
    }
}
