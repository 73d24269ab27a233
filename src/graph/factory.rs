use std::fmt;

use crate::error::Result;
use crate::graph::ObjectInstance;
use crate::types::TypeRef;

/// Hook choosing the placeholder object created for a layout entry on read.
///
/// Returning `Ok(None)` falls back to [`ObjectInstance::default_of`].
/// A returned instance must carry the requested type and one value per
/// declared field; the unmarshaller then overwrites every laid out field.
pub trait InstanceFactory: fmt::Debug {
    /// Creates the placeholder for an object of type `ty`.
    fn instantiate(&self, ty: &TypeRef) -> Result<Option<ObjectInstance>>;
}

/// Always falls back to default construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFactory;

impl InstanceFactory for DefaultFactory {
    fn instantiate(&self, _ty: &TypeRef) -> Result<Option<ObjectInstance>> {
        Ok(None)
    }
}

/// Runs `factory`, falling back to default construction.
pub(crate) fn create_object(
    factory: &dyn InstanceFactory,
    ty: &TypeRef,
) -> Result<ObjectInstance> {
    match factory.instantiate(ty)? {
        Some(object) if object.ty().name() == ty.name() && object.values().len() == ty.slot_count() => {
            Ok(object)
        }
        Some(object) => Err(crate::error::NbinError::Format(format!(
            "instance factory returned {} with {} slots for {}",
            object.ty().name(),
            object.values().len(),
            ty.name()
        ))),
        None => ObjectInstance::default_of(ty),
    }
}
