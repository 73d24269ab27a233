//! Writing a graph into its planned layout.
//!
//! Every entry is written independently, in layout order, into its own
//! window of the allocation:
//!
//! - objects start with their 8 byte type id tag, followed by their fields;
//! - primitive arrays are bulk copied in the allocation's byte order;
//! - enum values are the 4 byte native-mapped integer of the constant;
//! - struct arrays are packed, each element aligned to the struct alignment;
//! - references are addresses resolved through the [`InstanceSet`] chain, 0 for null.
//!
//! Failures carry the [`FieldPath`] of the value being written.

use crate::error::{NbinError, Result};
use crate::graph::{ArrayInstance, Heap, Instance, InstanceId, Value};
use crate::instances::InstanceSet;
use crate::layout::Layout;
use crate::memory::{MemoryAllocation, MemorySliceMut};
use crate::path::FieldPath;
use crate::registry::{align_up, FieldLayout, TypeDescriptor, TypeRegistry};
use crate::types::{PrimitiveKind, ENUM_SIZE};

/// Writes object graphs into memory allocations.
#[derive(Debug, Clone, Copy)]
pub struct Marshaller<'r> {
    registry: &'r TypeRegistry,
}

impl<'r> Marshaller<'r> {
    /// Creates a marshaller over `registry`.
    pub fn new(registry: &'r TypeRegistry) -> Self {
        Self { registry }
    }

    /// Binds `layout` to `allocation` (as a child of `parent` if given) and
    /// writes every entry.
    ///
    /// On failure the new set is released before the error is returned.
    pub fn marshall(
        &self,
        heap: &Heap,
        layout: Layout,
        allocation: Box<dyn MemoryAllocation>,
        parent: Option<&InstanceSet>,
    ) -> Result<InstanceSet> {
        let set = match parent {
            Some(parent) => parent.create_child(layout, allocation)?,
            None => InstanceSet::new(layout, allocation)?,
        };
        if let Err(e) = self.write_set(heap, &set) {
            if let Err(release_error) = set.release() {
                log::warn!("releasing instance set {} failed: {release_error}", set.id());
            }
            return Err(e);
        }
        Ok(set)
    }

    /// Writes every entry of `set` into its allocation.
    pub fn write_set(&self, heap: &Heap, set: &InstanceSet) -> Result<()> {
        let mut allocation = set.allocation_mut()?;
        let mut path = FieldPath::new();
        for entry in set.layout().entries() {
            let instance = heap.get(entry.instance())?;
            path.reset(instance.type_name());
            let mut slice = allocation
                .slice_mut(entry.offset(), entry.size())
                .map_err(|e| e.at(&path))?;
            let mut writer = EntryWriter {
                registry: self.registry,
                set,
                path: &mut path,
            };
            match instance {
                Instance::Object(object) => {
                    let descriptor = self.registry.get_or_create(object.ty())?;
                    slice
                        .write_i64(0, i64::from(descriptor.type_id()))
                        .map_err(|e| e.at(&writer.path))?;
                    writer.write_fields(&mut slice, 0, &descriptor, object.values())?;
                }
                Instance::Array(array) => writer.write_array(&mut slice, array)?,
            }
        }
        log::debug!(
            "marshalled {} entries ({} bytes) into instance set {}",
            set.layout().len(),
            set.layout().size(),
            set.id()
        );
        Ok(())
    }
}

struct EntryWriter<'a> {
    registry: &'a TypeRegistry,
    set: &'a InstanceSet,
    path: &'a mut FieldPath,
}

impl EntryWriter<'_> {
    fn address_of(&self, target: Option<InstanceId>) -> Result<u64> {
        let Some(id) = target else {
            return Ok(0);
        };
        self.set
            .try_address_of(id)
            .ok_or_else(|| NbinError::MissingLayoutEntry(format!("instance {id}")))
    }

    fn write_array(&mut self, slice: &mut MemorySliceMut<'_>, array: &ArrayInstance) -> Result<()> {
        let written = match array {
            ArrayInstance::Byte(v) => slice.write_i8s(0, v),
            ArrayInstance::Short(v) => slice.write_i16s(0, v),
            ArrayInstance::Int(v) => slice.write_i32s(0, v),
            ArrayInstance::Long(v) => slice.write_i64s(0, v),
            ArrayInstance::Float(v) => slice.write_f32s(0, v),
            ArrayInstance::Double(v) => slice.write_f64s(0, v),
            ArrayInstance::Boolean(v) => slice.write_bools(0, v),
            ArrayInstance::Enum { ty, ordinals } => {
                for (index, &ordinal) in ordinals.iter().enumerate() {
                    self.path.push_index(index);
                    let value = ty.mapped_value(ordinal).ok_or_else(|| {
                        NbinError::UnresolvedEnumValue {
                            type_name: ty.name().to_string(),
                            value: ordinal as i32,
                        }
                    });
                    value
                        .and_then(|value| slice.write_i32(index as u32 * ENUM_SIZE, value))
                        .map_err(|e| e.at(&self.path))?;
                    self.path.pop();
                }
                Ok(())
            }
            ArrayInstance::Struct { ty, elements } => {
                let descriptor = self.registry.get_or_create(ty)?;
                let mut offset = 0u32;
                for (index, element) in elements.iter().enumerate() {
                    self.path.push_index(index);
                    offset = align_up(u64::from(offset), u64::from(descriptor.alignment())) as u32;
                    let Some(element) = element else {
                        return Err(NbinError::NullStructElement.at(&self.path));
                    };
                    self.write_fields(slice, offset, &descriptor, element.values())?;
                    offset += descriptor.size();
                    self.path.pop();
                }
                Ok(())
            }
            ArrayInstance::Reference { values, .. } => {
                let mut addresses = Vec::with_capacity(values.len());
                for (index, target) in values.iter().enumerate() {
                    self.path.push_index(index);
                    addresses.push(self.address_of(*target).map_err(|e| e.at(&self.path))?);
                    self.path.pop();
                }
                slice.write_u64s(0, &addresses)
            }
        };
        written.map_err(|e| e.at(&self.path))
    }

    fn write_fields(
        &mut self,
        slice: &mut MemorySliceMut<'_>,
        base: u32,
        descriptor: &TypeDescriptor,
        values: &[Value],
    ) -> Result<()> {
        for field in descriptor.fields() {
            self.path.push_field(field.name());
            let offset = base + field.offset();
            let value = values.get(field.slot()).ok_or_else(|| {
                NbinError::Internal(format!(
                    "{} value has no slot {}",
                    descriptor.name(),
                    field.slot()
                ))
            });
            let written = value.and_then(|value| match (field.layout(), value) {
                (FieldLayout::Primitive(kind), value) => {
                    write_primitive(slice, offset, *kind, value)
                }
                (FieldLayout::Enum(nested), Value::Enum(ordinal)) => {
                    let mapped = nested.def().mapped_value(*ordinal).ok_or_else(|| {
                        NbinError::UnresolvedEnumValue {
                            type_name: nested.name().to_string(),
                            value: *ordinal as i32,
                        }
                    })?;
                    slice.write_i32(offset, mapped)
                }
                (FieldLayout::Struct(nested), Value::Struct(inner)) => {
                    self.write_fields(slice, offset, nested, inner.values())
                }
                (FieldLayout::Reference(_), Value::Ref(target)) => {
                    let address = self.address_of(*target)?;
                    slice.write_u64(offset, address)
                }
                (FieldLayout::Enum(_), other) => Err(mismatch("enum", other)),
                (FieldLayout::Struct(_), other) => Err(mismatch("struct", other)),
                (FieldLayout::Reference(_), other) => Err(mismatch("reference", other)),
            });
            written.map_err(|e| e.at(&self.path))?;
            self.path.pop();
        }
        Ok(())
    }
}

fn mismatch(expected: &str, found: &Value) -> NbinError {
    NbinError::UnsupportedType(format!(
        "expected a {expected} value, found a {}",
        found.kind_name()
    ))
}

fn write_primitive(
    slice: &mut MemorySliceMut<'_>,
    offset: u32,
    kind: PrimitiveKind,
    value: &Value,
) -> Result<()> {
    match (kind, value) {
        (PrimitiveKind::Byte, Value::Byte(v)) => slice.write_i8(offset, *v),
        (PrimitiveKind::Short, Value::Short(v)) => slice.write_i16(offset, *v),
        (PrimitiveKind::Int, Value::Int(v)) => slice.write_i32(offset, *v),
        (PrimitiveKind::Long, Value::Long(v)) => slice.write_i64(offset, *v),
        (PrimitiveKind::Float, Value::Float(v)) => slice.write_f32(offset, *v),
        (PrimitiveKind::Double, Value::Double(v)) => slice.write_f64(offset, *v),
        (PrimitiveKind::Boolean, Value::Boolean(v)) => slice.write_bool(offset, *v),
        (kind, other) => Err(mismatch(kind.name(), other)),
    }
}
