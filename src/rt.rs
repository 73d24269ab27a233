//! Runtime utilities for generated code (Macros).
//! Do not use directly.

use crate::error::{NbinError, Result};
use crate::graph::{StructValue, Value};
use crate::native::NativeValue;
use crate::types::TypeRef;

pub use std::sync::OnceLock;

/// Reads slot `slot` of a derived type as `T`, tagging failures with the field.
pub fn slot<T: NativeValue>(values: &[Value], slot: usize, type_name: &str, field: &str) -> Result<T> {
    let value = values.get(slot).ok_or_else(|| {
        NbinError::Format(format!(
            "{type_name} has {} slots, field {field} expects slot {slot}",
            values.len()
        ))
    })?;
    T::from_value(value).map_err(|e| e.at(format!("{type_name}#{field}")))
}

/// Checks the slot count of a derived object before its fields are read.
pub fn expect_slots(values: &[Value], expected: usize, type_name: &str) -> Result<()> {
    if values.len() != expected {
        return Err(NbinError::Format(format!(
            "{type_name} expects {expected} slots, found {}",
            values.len()
        )));
    }
    Ok(())
}

/// The slots of an inline struct value of the named type.
pub fn struct_slots<'v>(value: &'v Value, type_name: &str) -> Result<&'v [Value]> {
    match value {
        Value::Struct(inner) if inner.ty().name() == type_name => Ok(inner.values()),
        Value::Struct(inner) => Err(NbinError::Format(format!(
            "expected struct {type_name}, found {}",
            inner.ty().name()
        ))),
        other => Err(crate::native::unexpected(type_name, other)),
    }
}

/// Wraps slot values into an inline struct value.
pub fn struct_value(ty: TypeRef, values: Vec<Value>) -> Value {
    Value::Struct(StructValue::new(ty, values))
}

/// The ordinal held by an enum slot.
pub fn enum_ordinal(value: &Value, type_name: &str) -> Result<u32> {
    match value {
        Value::Enum(ordinal) => Ok(*ordinal),
        other => Err(crate::native::unexpected(type_name, other)),
    }
}

/// The error for an ordinal with no matching variant.
pub fn unknown_ordinal(type_name: &str, ordinal: u32) -> NbinError {
    NbinError::UnresolvedEnumValue {
        type_name: type_name.to_string(),
        value: i32::try_from(ordinal).unwrap_or(i32::MAX),
    }
}
