//! Reading a graph back from an [`InstanceSet`].
//!
//! The unmarshaller walks the entries reachable from a root with a work
//! queue and a visited set keyed by (owning set, entry offset). An entry is
//! marked visited before it is read, which is what makes shared references
//! and cycles resolve to one shared instance.
//!
//! Every entry must already have an instance of the right shape in the heap
//! (the reader creates placeholders); the unmarshaller only overwrites
//! values.

use std::collections::{HashSet, VecDeque};

use crate::error::{NbinError, Result};
use crate::graph::{ArrayInstance, Heap, Instance, InstanceId, StructValue, Value};
use crate::instances::InstanceSet;
use crate::layout::LayoutEntry;
use crate::memory::MemorySlice;
use crate::path::FieldPath;
use crate::registry::{align_up, FieldLayout, TypeDescriptor, TypeRegistry};
use crate::types::{PrimitiveKind, TypeDef, ENUM_SIZE};

/// Reads object graphs out of instance sets.
#[derive(Debug, Clone, Copy)]
pub struct Unmarshaller<'r> {
    registry: &'r TypeRegistry,
}

type VisitKey = (u64, u64);

impl<'r> Unmarshaller<'r> {
    /// Creates an unmarshaller over `registry`.
    pub fn new(registry: &'r TypeRegistry) -> Self {
        Self { registry }
    }

    /// Reads the graph rooted at the first entry of `set`. Returns the root,
    /// or `None` for an empty layout.
    pub fn unmarshall(&self, heap: &mut Heap, set: &InstanceSet) -> Result<Option<InstanceId>> {
        let Some(root) = set.layout().root().map(|e| e.instance()) else {
            return Ok(None);
        };
        self.unmarshall_from(heap, set, root)?;
        Ok(Some(root))
    }

    /// Reads the graph reachable from `root`, which must be placed in `set`
    /// or one of its ancestors.
    pub fn unmarshall_from(&self, heap: &mut Heap, set: &InstanceSet, root: InstanceId) -> Result<()> {
        let (owner, entry) = set
            .locate(root)
            .ok_or_else(|| NbinError::MissingLayoutEntry(format!("instance {root}")))?;

        let mut queue = VecDeque::from([(owner.clone(), entry)]);
        let mut visited: HashSet<VisitKey> = HashSet::new();
        let mut path = FieldPath::new();

        while let Some((owner, entry)) = queue.pop_front() {
            if !visited.insert((owner.id(), entry.offset())) {
                continue;
            }
            let instance = heap.get_mut(entry.instance())?;
            path.reset(instance.type_name());

            let allocation = owner.allocation()?;
            let slice = allocation
                .slice(entry.offset(), entry.size())
                .map_err(|e| e.at(&path))?;
            let mut reader = EntryReader {
                registry: self.registry,
                set,
                queue: &mut queue,
                visited: &visited,
                path: &mut path,
            };
            match instance {
                Instance::Object(object) => {
                    let descriptor = self.registry.get_or_create(object.ty())?;
                    let tag = slice.read_i64(0).map_err(|e| e.at(&reader.path))?;
                    if tag != i64::from(descriptor.type_id()) {
                        return Err(NbinError::Format(format!(
                            "type tag {tag} does not match {} (id {})",
                            descriptor.name(),
                            descriptor.type_id()
                        ))
                        .at(&reader.path));
                    }
                    reader.read_fields(&slice, 0, &descriptor, object.values_mut())?;
                }
                Instance::Array(array) => reader.read_array(&slice, &entry, array)?,
            }
        }

        log::debug!(
            "unmarshalled {} entries from instance set {}",
            visited.len(),
            set.id()
        );
        Ok(())
    }
}

struct EntryReader<'a> {
    registry: &'a TypeRegistry,
    set: &'a InstanceSet,
    queue: &'a mut VecDeque<(InstanceSet, LayoutEntry)>,
    visited: &'a HashSet<VisitKey>,
    path: &'a mut FieldPath,
}

impl EntryReader<'_> {
    /// Maps an address back to its instance, queueing the target entry.
    fn resolve(&mut self, address: u64) -> Result<Option<InstanceId>> {
        if address == 0 {
            return Ok(None);
        }
        let (owner, entry) = self
            .set
            .entry_at(address)
            .ok_or_else(|| NbinError::MissingLayoutEntry(format!("address {address:#x}")))?;
        if !self.visited.contains(&(owner.id(), entry.offset())) {
            self.queue.push_back((owner.clone(), entry));
        }
        Ok(Some(entry.instance()))
    }

    fn read_array(
        &mut self,
        slice: &MemorySlice<'_>,
        entry: &LayoutEntry,
        array: &mut ArrayInstance,
    ) -> Result<()> {
        if !entry.is_array() || array.len() != entry.length() as usize {
            return Err(NbinError::Format(format!(
                "entry of {} elements does not match an array of {}",
                entry.length(),
                array.len()
            ))
            .at(&self.path));
        }
        let read = match array {
            ArrayInstance::Byte(v) => slice.read_i8s(0, v),
            ArrayInstance::Short(v) => slice.read_i16s(0, v),
            ArrayInstance::Int(v) => slice.read_i32s(0, v),
            ArrayInstance::Long(v) => slice.read_i64s(0, v),
            ArrayInstance::Float(v) => slice.read_f32s(0, v),
            ArrayInstance::Double(v) => slice.read_f64s(0, v),
            ArrayInstance::Boolean(v) => slice.read_bools(0, v),
            ArrayInstance::Enum { ty, ordinals } => {
                for (index, ordinal) in ordinals.iter_mut().enumerate() {
                    self.path.push_index(index);
                    *ordinal = slice
                        .read_i32(index as u32 * ENUM_SIZE)
                        .and_then(|raw| enum_ordinal(ty, raw))
                        .map_err(|e| e.at(&self.path))?;
                    self.path.pop();
                }
                Ok(())
            }
            ArrayInstance::Struct { ty, elements } => {
                let descriptor = self.registry.get_or_create(ty)?;
                let mut offset = 0u32;
                for (index, element) in elements.iter_mut().enumerate() {
                    self.path.push_index(index);
                    offset = align_up(u64::from(offset), u64::from(descriptor.alignment())) as u32;
                    if element.is_none() {
                        *element = Some(StructValue::default_of(ty).map_err(|e| e.at(&self.path))?);
                    }
                    if let Some(element) = element {
                        self.read_fields(slice, offset, &descriptor, element.values_mut())?;
                    }
                    offset += descriptor.size();
                    self.path.pop();
                }
                Ok(())
            }
            ArrayInstance::Reference { values, .. } => {
                let mut addresses = vec![0u64; values.len()];
                slice
                    .read_u64s(0, &mut addresses)
                    .map_err(|e| e.at(&self.path))?;
                for (index, (slot, address)) in values.iter_mut().zip(addresses).enumerate() {
                    self.path.push_index(index);
                    *slot = self.resolve(address).map_err(|e| e.at(&self.path))?;
                    self.path.pop();
                }
                Ok(())
            }
        };
        read.map_err(|e| e.at(&self.path))
    }

    fn read_fields(
        &mut self,
        slice: &MemorySlice<'_>,
        base: u32,
        descriptor: &TypeDescriptor,
        values: &mut [Value],
    ) -> Result<()> {
        for field in descriptor.fields() {
            self.path.push_field(field.name());
            let offset = base + field.offset();
            let Some(value) = values.get_mut(field.slot()) else {
                return Err(NbinError::Internal(format!(
                    "{} value has no slot {}",
                    descriptor.name(),
                    field.slot()
                ))
                .at(&self.path));
            };
            let read = match field.layout() {
                FieldLayout::Primitive(kind) => {
                    read_primitive(slice, offset, *kind).map(|read| *value = read)
                }
                FieldLayout::Enum(nested) => slice
                    .read_i32(offset)
                    .and_then(|raw| enum_ordinal(nested.def(), raw))
                    .map(|ordinal| *value = Value::Enum(ordinal)),
                FieldLayout::Struct(nested) => {
                    if !matches!(value, Value::Struct(inner) if inner.ty().name() == nested.name())
                    {
                        *value = Value::Struct(
                            StructValue::default_of(nested.def()).map_err(|e| e.at(&self.path))?,
                        );
                    }
                    match value {
                        Value::Struct(inner) => {
                            self.read_fields(slice, offset, nested, inner.values_mut())
                        }
                        _ => Err(NbinError::Internal("struct slot was just set".into())),
                    }
                }
                FieldLayout::Reference(_) => slice
                    .read_u64(offset)
                    .and_then(|address| self.resolve(address))
                    .map(|target| *value = Value::Ref(target)),
            };
            read.map_err(|e| e.at(&self.path))?;
            self.path.pop();
        }
        Ok(())
    }
}

fn enum_ordinal(ty: &TypeDef, raw: i32) -> Result<u32> {
    ty.ordinal_of(raw).ok_or_else(|| NbinError::UnresolvedEnumValue {
        type_name: ty.name().to_string(),
        value: raw,
    })
}

fn read_primitive(slice: &MemorySlice<'_>, offset: u32, kind: PrimitiveKind) -> Result<Value> {
    Ok(match kind {
        PrimitiveKind::Byte => Value::Byte(slice.read_i8(offset)?),
        PrimitiveKind::Short => Value::Short(slice.read_i16(offset)?),
        PrimitiveKind::Int => Value::Int(slice.read_i32(offset)?),
        PrimitiveKind::Long => Value::Long(slice.read_i64(offset)?),
        PrimitiveKind::Float => Value::Float(slice.read_f32(offset)?),
        PrimitiveKind::Double => Value::Double(slice.read_f64(offset)?),
        PrimitiveKind::Boolean => Value::Boolean(slice.read_bool(offset)?),
    })
}
