//! A minimal schema validator, see the `SchemaValidator` supplement in
//! `SPEC_FULL.md`: `spec.md` excludes a general schema-validator *library*,
//! not the required/type-shape checks the dispatch core needs to perform
//! schema validation on in/out (`spec.md` section 4.4).

use indexmap::IndexMap;

use crate::error::SchemaError;
use crate::value::Value;

/// The shape a single field of an object must have.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    String,
    Buf,
    Array,
    Object,
    Any,
}

impl FieldType {
    fn name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Buf => "buf",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _) => true,
            (Self::Bool, Value::Bool(_)) => true,
            (
                Self::Int,
                Value::Int8(_)
                | Value::Int16(_)
                | Value::Int32(_)
                | Value::Int64(_)
                | Value::UInt8(_)
                | Value::UInt16(_)
                | Value::UInt32(_)
                | Value::UInt64(_),
            ) => true,
            (Self::Float, Value::Float32(_) | Value::Float64(_)) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Buf, Value::Buf(_)) => true,
            (Self::Array, Value::Array(_)) => true,
            (Self::Object, Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// A field-presence and shape requirement for one property tree, e.g. a
/// `cmd_in` or `data_out` schema attached to an extension.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    required: Vec<String>,
    fields: IndexMap<String, FieldType>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `field` as required and constrains its type.
    pub fn field(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        let field = field.into();
        self.required.push(field.clone());
        self.fields.insert(field, ty);
        self
    }

    /// Declares `field`'s type without requiring its presence.
    pub fn optional_field(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        self.fields.insert(field.into(), ty);
        self
    }
}

/// Validates property trees against a [`Schema`], see `spec.md` section 3
/// ("Schema-constrained values must pass validation before being accepted").
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, schema: &Schema, value: &Value) -> Result<(), SchemaError>;
}

/// The bundled [`SchemaValidator`]: checks required-field presence and
/// per-field type shape, nothing more exotic (no regex, no numeric ranges).
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicSchemaValidator;

impl SchemaValidator for BasicSchemaValidator {
    fn validate(&self, schema: &Schema, value: &Value) -> Result<(), SchemaError> {
        let object = value.as_object();

        for required in &schema.required {
            let present = object.and_then(|map| map.get(required)).is_some();
            if !present {
                return Err(SchemaError::MissingRequired(required.clone()));
            }
        }

        if let Some(object) = object {
            for (field, ty) in &schema.fields {
                if let Some(actual) = object.get(field)
                    && !ty.matches(actual)
                {
                    return Err(SchemaError::WrongType {
                        field: field.clone(),
                        expected: ty.name(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_field_is_rejected() {
        let schema = Schema::new().field("k", FieldType::String);
        let value = Value::empty_object();
        assert_eq!(
            BasicSchemaValidator.validate(&schema, &value),
            Err(SchemaError::MissingRequired("k".into()))
        );
    }

    #[test]
    fn wrong_type_is_rejected() {
        let schema = Schema::new().field("k", FieldType::String);
        let mut value = Value::empty_object();
        value.set_path("k", Value::Int64(1)).unwrap();
        assert_eq!(
            BasicSchemaValidator.validate(&schema, &value),
            Err(SchemaError::WrongType {
                field: "k".into(),
                expected: "string"
            })
        );
    }

    #[test]
    fn matching_schema_passes() {
        let schema = Schema::new().field("k", FieldType::String);
        let mut value = Value::empty_object();
        value.set_path("k", Value::String("v".into())).unwrap();
        assert!(BasicSchemaValidator.validate(&schema, &value).is_ok());
    }
}
