//! Narrow helpers over the untyped JSON documents the backends return.
//!
//! The backend schema is external and only a handful of fields are touched,
//! so bodies stay `serde_json::Value`; everything outside this module works
//! with typed resource IDs and controls.

use serde_json::{Map, Value};

use super::DecorationError;

/// Field injected into decorated backend objects.
pub const RESOURCE_ID_FIELD: &str = "ResourceID";

pub(crate) fn as_object(value: &Value) -> Result<&Map<String, Value>, DecorationError> {
    value.as_object().ok_or(DecorationError::NotAnObject)
}

pub(crate) fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, DecorationError> {
    value.as_object_mut().ok_or(DecorationError::NotAnObject)
}

/// A required string field; absence is a malformed-backend-response error,
/// never a policy decision.
pub(crate) fn required_string<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, DecorationError> {
    obj.get(field)
        .and_then(|v| v.as_str())
        .ok_or(DecorationError::MissingField(field))
}

/// The object's `Labels` map, when present and non-null.
pub(crate) fn labels(obj: &Map<String, Value>) -> Option<&Map<String, Value>> {
    obj.get("Labels").and_then(|v| v.as_object())
}

pub(crate) fn decorate(obj: &mut Map<String, Value>, resource_id: &str) {
    obj.insert(
        RESOURCE_ID_FIELD.to_string(),
        Value::String(resource_id.to_string()),
    );
}
