//! Action descriptors and argument normalization.
//!
//! An action is a named server-side operation. Invocation always follows the
//! same sequence, the state gate having been applied by the caller:
//!
//! 1. normalize arguments (positional array or mixed `{"args", "kwargs"}`
//!    payload → keyword object, `null` → `{}`)
//! 2. validate against the input schema
//! 3. run the handler
//! 4. validate the return value against the output schema
//!
//! Handler failures become [`RemoteError::Execution`] with the original message.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{RemoteError, RemoteResult};
use crate::schema::Schema;
use crate::thing::ThingContext;

/// Key holding positional arguments in a mixed payload.
pub const ARGS_KEY: &str = "args";
/// Key holding keyword arguments in a mixed payload.
pub const KWARGS_KEY: &str = "kwargs";

/// Build a payload carrying positional and keyword arguments together.
pub fn mixed_arguments(positional: Vec<Value>, keyword: Map<String, Value>) -> Value {
    let mut payload = Map::new();
    payload.insert(ARGS_KEY.to_string(), Value::Array(positional));
    payload.insert(KWARGS_KEY.to_string(), Value::Object(keyword));
    Value::Object(payload)
}

/// Server-side action body.
pub type ActionHandler = Arc<dyn Fn(&mut ThingContext<'_>, Value) -> anyhow::Result<Value> + Send + Sync>;

/// Immutable declaration of one action.
#[derive(Clone)]
pub struct ActionDescriptor {
    name: String,
    doc: Option<String>,
    parameters: Vec<String>,
    input_schema: Option<Schema>,
    output_schema: Option<Schema>,
    states: Vec<String>,
    oneway_eligible: bool,
    handler: ActionHandler,
}

impl std::fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("states", &self.states)
            .field("oneway_eligible", &self.oneway_eligible)
            .finish()
    }
}

impl ActionDescriptor {
    /// Declare an action with its handler. Oneway-eligible by default.
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(&mut ThingContext<'_>, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            doc: None,
            parameters: Vec::new(),
            input_schema: None,
            output_schema: None,
            states: Vec::new(),
            oneway_eligible: true,
            handler: Arc::new(handler),
        }
    }

    /// Set description
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Declare positional parameter order.
    pub fn parameters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = names.into_iter().map(Into::into).collect();
        self
    }

    /// Validate arguments against `schema`.
    pub fn input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Validate the return value against `schema`.
    pub fn output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Restrict invocation to the given states.
    pub fn states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states = states.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the action may be invoked without a reply.
    pub fn oneway_eligible(mut self, eligible: bool) -> Self {
        self.oneway_eligible = eligible;
        self
    }

    /// Action name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// States declared on the descriptor itself (empty = unrestricted).
    pub fn states_declared(&self) -> &[String] {
        &self.states
    }

    /// Whether oneway invocation is permitted.
    pub fn is_oneway_eligible(&self) -> bool {
        self.oneway_eligible
    }

    /// Map the wire payload onto keyword arguments.
    ///
    /// An array is matched against the declared parameter order. An object
    /// holding only `args` (array) and optionally `kwargs` (object) is a mixed
    /// call, unless the action declares parameters with those names. Surplus
    /// positional arguments and a parameter given both ways are rejected.
    pub fn normalize_arguments(&self, arguments: Value) -> RemoteResult<Value> {
        match arguments {
            Value::Null => Ok(Value::Object(Map::new())),
            Value::Array(items) if !self.parameters.is_empty() => self.bind(items, Map::new()),
            Value::Object(mut fields) if self.is_mixed(&fields) => {
                let positional = match fields.remove(ARGS_KEY) {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                let keyword = match fields.remove(KWARGS_KEY) {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                self.bind(positional, keyword)
            }
            other => Ok(other),
        }
    }

    fn is_mixed(&self, fields: &Map<String, Value>) -> bool {
        !self.parameters.is_empty()
            && !self.parameters.iter().any(|p| p == ARGS_KEY || p == KWARGS_KEY)
            && matches!(fields.get(ARGS_KEY), Some(Value::Array(_)))
            && fields.get(KWARGS_KEY).map_or(true, Value::is_object)
            && fields.keys().all(|k| k == ARGS_KEY || k == KWARGS_KEY)
    }

    fn bind(&self, positional: Vec<Value>, mut keyword: Map<String, Value>) -> RemoteResult<Value> {
        if positional.len() > self.parameters.len() {
            return Err(RemoteError::Validation(format!(
                "{}: takes {} positional arguments but {} were given",
                self.name,
                self.parameters.len(),
                positional.len()
            )));
        }
        for (name, value) in self.parameters.iter().zip(positional) {
            if keyword.contains_key(name) {
                return Err(RemoteError::Validation(format!(
                    "{}: got multiple values for argument '{}'",
                    self.name, name
                )));
            }
            keyword.insert(name.clone(), value);
        }
        Ok(Value::Object(keyword))
    }

    /// Normalize, validate, run and validate the result.
    pub fn invoke(&self, ctx: &mut ThingContext<'_>, arguments: Value) -> RemoteResult<Value> {
        let mut arguments = self.normalize_arguments(arguments)?;
        if let Some(schema) = &self.input_schema {
            arguments = schema.validate_at(&arguments, &self.name)?;
        }

        tracing::debug!("{}: invoking {}", ctx.thing_id(), self.name);
        let result = (self.handler)(ctx, arguments).map_err(RemoteError::from_handler)?;

        match &self.output_schema {
            Some(schema) => schema
                .validate_at(&result, &format!("{}.return", self.name))
                .map_err(|e| RemoteError::Execution(format!("invalid return value: {}", e.message()))),
            None => Ok(result),
        }
    }

    /// Serializable summary used in thing descriptions.
    pub fn info(&self) -> ActionInfo {
        ActionInfo {
            name: self.name.clone(),
            doc: self.doc.clone(),
            parameters: self.parameters.clone(),
            input_schema: self.input_schema.clone(),
            output_schema: self.output_schema.clone(),
            states: self.states.clone(),
            oneway_eligible: self.oneway_eligible,
        }
    }
}

/// Action metadata as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ActionInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Schema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<String>,
    pub oneway_eligible: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn measure() -> ActionDescriptor {
        ActionDescriptor::new("measure", |_ctx, args| Ok(args)).parameters(["samples", "average"])
    }

    #[test]
    fn test_positional_arguments_mapped_to_names() {
        let args = measure().normalize_arguments(json!([10, true])).unwrap();
        assert_eq!(args, json!({"samples": 10, "average": true}));
    }

    #[test]
    fn test_partial_positional_arguments() {
        let args = measure().normalize_arguments(json!([5])).unwrap();
        assert_eq!(args, json!({"samples": 5}));
    }

    #[test]
    fn test_too_many_positional_arguments() {
        let err = measure().normalize_arguments(json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, RemoteError::Validation(_)));
    }

    #[test]
    fn test_null_and_keyword_arguments() {
        let action = measure();
        assert_eq!(action.normalize_arguments(Value::Null).unwrap(), json!({}));
        assert_eq!(
            action.normalize_arguments(json!({"samples": 3})).unwrap(),
            json!({"samples": 3})
        );
    }

    #[test]
    fn test_mixed_positional_and_keyword_arguments() {
        let mut keyword = Map::new();
        keyword.insert("average".to_string(), json!(true));
        let args = measure()
            .normalize_arguments(mixed_arguments(vec![json!(2)], keyword))
            .unwrap();
        assert_eq!(args, json!({"samples": 2, "average": true}));

        let only_positional = measure().normalize_arguments(json!({"args": [4]})).unwrap();
        assert_eq!(only_positional, json!({"samples": 4}));
    }

    #[test]
    fn test_argument_given_twice_is_rejected() {
        let err = measure()
            .normalize_arguments(json!({"args": [2], "kwargs": {"samples": 3}}))
            .unwrap_err();
        assert!(matches!(err, RemoteError::Validation(_)));
        assert!(err.message().contains("samples"));
    }

    #[test]
    fn test_args_parameter_is_not_a_mixed_payload() {
        let action = ActionDescriptor::new("echo", |_ctx, args| Ok(args)).parameters(["args"]);
        let payload = json!({"args": [1, 2]});
        assert_eq!(action.normalize_arguments(payload.clone()).unwrap(), payload);
    }

    #[test]
    fn test_array_passes_through_without_parameter_order() {
        let action = ActionDescriptor::new("sum", |_ctx, args| Ok(args));
        assert_eq!(action.normalize_arguments(json!([1, 2])).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_info() {
        let info = measure().states(["ON"]).oneway_eligible(false).info();
        assert_eq!(info.parameters, vec!["samples", "average"]);
        assert_eq!(info.states, vec!["ON"]);
        assert!(!info.oneway_eligible);
    }
}
