//! Property descriptors - declarative, validated attributes of a thing.
//!
//! A [`PropertyDescriptor`] is immutable once its thing type is defined. It
//! carries everything needed to read and write one named attribute:
//!
//! - the value [`Schema`] (including numeric bounds and cropping),
//! - the access flags `readonly`, `constant` and `allow_none`,
//! - storage scope (`class_member` shares one cell across all instances),
//! - an optional custom getter and setter that replace storage access,
//! - the `observable` flag, which publishes `<name>_change_event` after every
//!   successful write.
//!
//! Writes are split into [`PropertyDescriptor::prepare_write`] (access checks
//! and validation, no side effects) and [`PropertyDescriptor::commit_write`]
//! so that batch writes can validate every entry before touching storage.
//!
//! # Example
//!
//! ```rust,ignore
//! let wavelength = PropertyDescriptor::builder("wavelength")
//!     .doc("calibration wavelength")
//!     .unit("nm")
//!     .schema(Schema::number())
//!     .bounds(NumericBounds::new(190.0, 25000.0))
//!     .default(json!(1064.0))
//!     .observable()
//!     .build()?;
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{RemoteError, RemoteResult};
use crate::schema::{NumericBounds, Schema};
use crate::thing::ThingContext;

/// Custom read hook. Replaces the stored value.
pub type Getter = Arc<dyn Fn(&ThingContext<'_>) -> anyhow::Result<Value> + Send + Sync>;

/// Custom write hook. Receives the validated value and is responsible for its effect.
pub type Setter = Arc<dyn Fn(&mut ThingContext<'_>, Value) -> anyhow::Result<()> + Send + Sync>;

/// Who initiated a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// A request received from a client. Subject to `readonly`.
    Client,
    /// Server-side code, e.g. an action handler. May mutate `readonly` properties.
    Server,
}

/// Name of the implicit event published by an observable property.
pub fn change_event_name(property: &str) -> String {
    format!("{}_change_event", property)
}

/// Immutable declaration of one property.
#[derive(Clone)]
pub struct PropertyDescriptor {
    name: String,
    doc: Option<String>,
    unit: Option<String>,
    schema: Schema,
    default: Value,
    allow_none: bool,
    readonly: bool,
    constant: bool,
    observable: bool,
    class_member: bool,
    states: Vec<String>,
    getter: Option<Getter>,
    setter: Option<Setter>,
}

impl std::fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("readonly", &self.readonly)
            .field("constant", &self.constant)
            .field("class_member", &self.class_member)
            .field("custom_getter", &self.getter.is_some())
            .field("custom_setter", &self.setter.is_some())
            .finish()
    }
}

impl PropertyDescriptor {
    /// Start declaring a property.
    pub fn builder(name: impl Into<String>) -> PropertyBuilder {
        PropertyBuilder::new(name)
    }

    /// Property name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value schema, bounds included.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Default value returned before any write.
    pub fn default_value(&self) -> &Value {
        &self.default
    }

    /// Whether client writes are rejected.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Whether only one non-null write is accepted.
    pub fn is_constant(&self) -> bool {
        self.constant
    }

    /// Whether writes publish a change event.
    pub fn is_observable(&self) -> bool {
        self.observable
    }

    /// Whether storage is shared by all instances of the type.
    pub fn is_class_member(&self) -> bool {
        self.class_member
    }

    /// Whether `null` is an accepted value.
    pub fn allows_none(&self) -> bool {
        self.allow_none
    }

    /// States declared on the descriptor itself (empty = unrestricted).
    pub fn states(&self) -> &[String] {
        &self.states
    }

    /// Read the current value.
    ///
    /// Uses the custom getter when present, otherwise stored value, otherwise
    /// the declared default.
    pub fn get(&self, ctx: &ThingContext<'_>) -> RemoteResult<Value> {
        if let Some(getter) = &self.getter {
            return getter(ctx).map_err(RemoteError::from_handler);
        }
        Ok(ctx.stored_value(self).unwrap_or_else(|| self.default.clone()))
    }

    /// Access checks and validation. No side effects.
    ///
    /// Returns the (possibly cropped) value that [`commit_write`](Self::commit_write)
    /// should apply.
    pub fn prepare_write(&self, ctx: &ThingContext<'_>, value: &Value, origin: WriteOrigin) -> RemoteResult<Value> {
        if self.readonly && origin == WriteOrigin::Client {
            return Err(RemoteError::Access(format!("property '{}' is read-only", self.name)));
        }
        if self.constant && ctx.is_committed(self) {
            return Err(RemoteError::Access(format!(
                "property '{}' is constant and already set",
                self.name
            )));
        }
        if value.is_null() {
            return if self.allow_none {
                Ok(Value::Null)
            } else {
                Err(RemoteError::Validation(format!("{}: None is not allowed", self.name)))
            };
        }
        self.schema.validate_at(value, &self.name)
    }

    /// Apply a value returned by [`prepare_write`](Self::prepare_write).
    ///
    /// A constant property is claimed before the value is applied, in one
    /// step with the committed check, so concurrent writers sharing a class
    /// cell cannot both succeed. A failing setter releases the claim.
    pub fn commit_write(&self, ctx: &mut ThingContext<'_>, value: Value) -> RemoteResult<()> {
        let claims = self.constant && !value.is_null();
        if claims && !ctx.claim_committed(self) {
            return Err(RemoteError::Access(format!(
                "property '{}' is constant and already set",
                self.name
            )));
        }

        match &self.setter {
            Some(setter) => {
                if let Err(e) = setter(ctx, value.clone()) {
                    if claims {
                        ctx.release_committed(self);
                    }
                    return Err(RemoteError::from_handler(e));
                }
            }
            None => ctx.store_value(self, value.clone()),
        }

        if self.observable {
            let event = change_event_name(&self.name);
            if let Err(e) = ctx.emit(&event, value) {
                tracing::warn!("{}: failed to publish {}: {}", ctx.thing_id(), event, e);
            }
        }
        Ok(())
    }

    /// Validate then apply.
    pub fn set(&self, ctx: &mut ThingContext<'_>, value: &Value, origin: WriteOrigin) -> RemoteResult<()> {
        let validated = self.prepare_write(ctx, value, origin)?;
        self.commit_write(ctx, validated)
    }

    /// Serializable summary used in thing descriptions.
    pub fn info(&self) -> PropertyInfo {
        PropertyInfo {
            name: self.name.clone(),
            doc: self.doc.clone(),
            unit: self.unit.clone(),
            schema: self.schema.clone(),
            default: self.default.clone(),
            allow_none: self.allow_none,
            readonly: self.readonly,
            constant: self.constant,
            observable: self.observable,
            class_member: self.class_member,
            states: self.states.clone(),
        }
    }
}

/// Property metadata as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct PropertyInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub schema: Schema,
    #[serde(default)]
    pub default: Value,
    pub allow_none: bool,
    pub readonly: bool,
    pub constant: bool,
    pub observable: bool,
    pub class_member: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<String>,
}

// =============================================================================
// PropertyBuilder
// =============================================================================

/// Fluent builder for [`PropertyDescriptor`].
pub struct PropertyBuilder {
    descriptor: PropertyDescriptor,
    bounds: Option<NumericBounds>,
    crop_to_bounds: bool,
}

impl PropertyBuilder {
    /// Unconstrained property with a `null` default.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: PropertyDescriptor {
                name: name.into(),
                doc: None,
                unit: None,
                schema: Schema::Any,
                default: Value::Null,
                allow_none: false,
                readonly: false,
                constant: false,
                observable: false,
                class_member: false,
                states: Vec::new(),
                getter: None,
                setter: None,
            },
            bounds: None,
            crop_to_bounds: false,
        }
    }

    /// Set description
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.descriptor.doc = Some(doc.into());
        self
    }

    /// Set physical unit
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.descriptor.unit = Some(unit.into());
        self
    }

    /// Set the value schema.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.descriptor.schema = schema;
        self
    }

    /// Attach numeric bounds (the schema must be `number` or `integer`).
    pub fn bounds(mut self, bounds: NumericBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Clamp out-of-range writes to the nearest bound.
    pub fn crop_to_bounds(mut self) -> Self {
        self.crop_to_bounds = true;
        self
    }

    /// Value returned before the first write.
    pub fn default(mut self, value: Value) -> Self {
        self.descriptor.default = value;
        self
    }

    /// Accept `null`.
    pub fn allow_none(mut self) -> Self {
        self.descriptor.allow_none = true;
        self
    }

    /// Reject client writes.
    pub fn readonly(mut self) -> Self {
        self.descriptor.readonly = true;
        self
    }

    /// Accept exactly one non-null write. Requires [`allow_none`](Self::allow_none).
    pub fn constant(mut self) -> Self {
        self.descriptor.constant = true;
        self
    }

    /// Publish `<name>_change_event` after each write.
    pub fn observable(mut self) -> Self {
        self.descriptor.observable = true;
        self
    }

    /// Share storage across every instance of the type.
    pub fn class_member(mut self) -> Self {
        self.descriptor.class_member = true;
        self
    }

    /// Restrict writes to the given states.
    pub fn states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.states = states.into_iter().map(Into::into).collect();
        self
    }

    /// Install a custom getter.
    pub fn getter(mut self, getter: impl Fn(&ThingContext<'_>) -> anyhow::Result<Value> + Send + Sync + 'static) -> Self {
        self.descriptor.getter = Some(Arc::new(getter));
        self
    }

    /// Install a custom setter.
    pub fn setter(
        mut self,
        setter: impl Fn(&mut ThingContext<'_>, Value) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.descriptor.setter = Some(Arc::new(setter));
        self
    }

    /// Finish the declaration, checking flag consistency.
    pub fn build(self) -> RemoteResult<PropertyDescriptor> {
        let PropertyBuilder {
            mut descriptor,
            bounds,
            crop_to_bounds,
        } = self;

        if descriptor.constant && !descriptor.allow_none {
            return Err(RemoteError::Config(format!(
                "constant property '{}' must allow None",
                descriptor.name
            )));
        }

        match (bounds, crop_to_bounds) {
            (Some(bounds), crop) => {
                let bounds = if crop { bounds.cropped() } else { bounds };
                if !matches!(
                    descriptor.schema,
                    Schema::Number { .. } | Schema::Integer { .. } | Schema::Nullable { .. }
                ) {
                    return Err(RemoteError::Config(format!(
                        "bounds on non-numeric property '{}'",
                        descriptor.name
                    )));
                }
                descriptor.schema = descriptor.schema.with_bounds(bounds);
            }
            (None, true) => {
                let cropped = descriptor.schema.bounds().cloned().map(NumericBounds::cropped);
                match cropped {
                    Some(bounds) => descriptor.schema = descriptor.schema.with_bounds(bounds),
                    None => {
                        return Err(RemoteError::Config(format!(
                            "crop_to_bounds on property '{}' without bounds",
                            descriptor.name
                        )))
                    }
                }
            }
            (None, false) => {}
        }

        if !descriptor.default.is_null() {
            descriptor
                .schema
                .validate_at(&descriptor.default, &descriptor.name)
                .map_err(|e| RemoteError::Config(format!("invalid default: {}", e.message())))?;
        }

        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_constant_requires_allow_none() {
        let err = PropertyDescriptor::builder("serial_number")
            .schema(Schema::string())
            .constant()
            .build()
            .unwrap_err();
        assert!(matches!(err, RemoteError::Config(_)));

        let ok = PropertyDescriptor::builder("serial_number")
            .schema(Schema::string())
            .constant()
            .allow_none()
            .build()
            .unwrap();
        assert!(ok.is_constant());
    }

    #[test]
    fn test_crop_flag_applies_to_bounds() {
        let prop = PropertyDescriptor::builder("frame_rate")
            .schema(Schema::number())
            .bounds(NumericBounds::new(0.0, 40.0))
            .crop_to_bounds()
            .build()
            .unwrap();
        assert_eq!(prop.schema().validate(&json!(99.0)).unwrap(), json!(40.0));
    }

    #[test]
    fn test_crop_flag_on_schema_bounds() {
        let prop = PropertyDescriptor::builder("integration_time")
            .schema(Schema::integer().with_bounds(NumericBounds::new(1.0, 1000.0)))
            .crop_to_bounds()
            .build()
            .unwrap();
        assert_eq!(prop.schema().validate(&json!(0)).unwrap(), json!(1));
    }

    #[test]
    fn test_crop_without_bounds_rejected() {
        assert!(PropertyDescriptor::builder("x")
            .schema(Schema::number())
            .crop_to_bounds()
            .build()
            .is_err());
    }

    #[test]
    fn test_invalid_default_rejected() {
        let err = PropertyDescriptor::builder("gain")
            .schema(Schema::number())
            .bounds(NumericBounds::new(0.0, 10.0))
            .default(json!(20.0))
            .build()
            .unwrap_err();
        assert!(err.message().contains("invalid default"));
    }

    #[test]
    fn test_info_reflects_flags() {
        let prop = PropertyDescriptor::builder("last_energy")
            .schema(Schema::number())
            .unit("J")
            .readonly()
            .observable()
            .build()
            .unwrap();
        let info = prop.info();
        assert!(info.readonly);
        assert!(info.observable);
        assert_eq!(info.unit.as_deref(), Some("J"));
        assert_eq!(change_event_name(&info.name), "last_energy_change_event");
    }
}
