//! Layout planning: assigning every distinct reachable instance a byte
//! offset in one linear region.
//!
//! The [`LayoutPlanner`] walks the graph depth first, pre-order. An instance
//! is appended to the [`Layout`] *before* its children are visited, so a
//! self-referencing or cyclic graph terminates, and an instance reached
//! through several paths gets exactly one entry.

use std::cell::OnceCell;
use std::collections::HashMap;
use std::fmt;

use crate::error::{NbinError, Result};
use crate::graph::{ArrayInstance, Heap, Instance, InstanceId, Value};
use crate::instances::InstanceSet;
use crate::registry::{align_up, FieldLayout, TypeDescriptor, TypeRegistry};
use crate::types::{TypeKind, ValueType};

/// Default entry alignment: the pointer width.
pub const DEFAULT_ALIGNMENT: u32 = 8;

/// One instance placed in a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEntry {
    instance: InstanceId,
    offset: u64,
    size: u32,
    array_length: Option<u32>,
}

impl LayoutEntry {
    /// The placed instance.
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Byte offset from the start of the region.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Byte size. For arrays, element size times length.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// True for array entries.
    pub fn is_array(&self) -> bool {
        self.array_length.is_some()
    }

    /// Element count of an array entry, 1 for an object.
    pub fn length(&self) -> u32 {
        self.array_length.unwrap_or(1)
    }

    /// Bytes reserved for the entry. An empty array still reserves one byte
    /// so that no two entries share an offset.
    fn footprint(&self) -> u64 {
        u64::from(self.size.max(1))
    }
}

impl fmt::Display for LayoutEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.array_length {
            Some(length) => write!(
                f,
                "{} @ {} [{} bytes, {} elements]",
                self.instance, self.offset, self.size, length
            ),
            None => write!(f, "{} @ {} [{} bytes]", self.instance, self.offset, self.size),
        }
    }
}

/// Ordered entries plus instance and offset indices.
///
/// The first entry is the root. Offsets are monotonic and multiples of the
/// layout alignment.
#[derive(Debug, Clone)]
pub struct Layout {
    alignment: u32,
    entries: Vec<LayoutEntry>,
    by_instance: HashMap<InstanceId, usize>,
    /// Built on first lookup, dropped on append.
    by_offset: OnceCell<HashMap<u64, usize>>,
}

impl Layout {
    /// An empty layout. `alignment` must be a power of two.
    pub fn new(alignment: u32) -> Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(NbinError::UnsupportedType(format!(
                "layout alignment {alignment} is not a power of two"
            )));
        }
        Ok(Self {
            alignment,
            entries: Vec::new(),
            by_instance: HashMap::new(),
            by_offset: OnceCell::new(),
        })
    }

    /// Entry alignment.
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Entries in placement order.
    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True for the layout of a null root.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The root entry.
    pub fn root(&self) -> Option<&LayoutEntry> {
        self.entries.first()
    }

    /// Offset right after the last entry, before alignment.
    fn end(&self) -> u64 {
        self.entries
            .last()
            .map_or(0, |last| last.offset + last.footprint())
    }

    /// Total region size: the end of the last entry rounded up to the alignment.
    pub fn size(&self) -> u64 {
        align_up(self.end(), u64::from(self.alignment))
    }

    /// Appends an entry at the next aligned offset.
    pub fn append(
        &mut self,
        instance: InstanceId,
        size: u32,
        array_length: Option<u32>,
    ) -> Result<LayoutEntry> {
        let offset = align_up(self.end(), u64::from(self.alignment));
        self.insert(instance, offset, size, array_length)
    }

    /// Appends an entry at an explicit offset, as recorded in a file.
    ///
    /// The offset must be aligned and must not overlap the previous entry.
    pub fn insert(
        &mut self,
        instance: InstanceId,
        offset: u64,
        size: u32,
        array_length: Option<u32>,
    ) -> Result<LayoutEntry> {
        if self.by_instance.contains_key(&instance) {
            return Err(NbinError::Internal(format!(
                "instance {instance} is already laid out"
            )));
        }
        if offset % u64::from(self.alignment) != 0 || offset < self.end() {
            return Err(NbinError::Format(format!(
                "entry offset {offset} is misaligned or overlaps the previous entry"
            )));
        }
        let entry = LayoutEntry {
            instance,
            offset,
            size,
            array_length,
        };
        self.by_instance.insert(instance, self.entries.len());
        self.entries.push(entry);
        self.by_offset = OnceCell::new();
        log::trace!("layout entry {entry}");
        Ok(entry)
    }

    /// The entry of an instance.
    pub fn entry_of(&self, instance: InstanceId) -> Option<&LayoutEntry> {
        self.by_instance
            .get(&instance)
            .and_then(|&index| self.entries.get(index))
    }

    /// True if the instance has an entry.
    pub fn contains(&self, instance: InstanceId) -> bool {
        self.by_instance.contains_key(&instance)
    }

    /// The entry starting exactly at `offset`.
    pub fn entry_at(&self, offset: u64) -> Option<&LayoutEntry> {
        let index = self.by_offset.get_or_init(|| {
            self.entries
                .iter()
                .enumerate()
                .map(|(index, entry)| (entry.offset, index))
                .collect()
        });
        index.get(&offset).and_then(|&i| self.entries.get(i))
    }
}

/// Builds [`Layout`]s from object graphs.
#[derive(Debug, Clone, Copy)]
pub struct LayoutPlanner<'r> {
    registry: &'r TypeRegistry,
    alignment: u32,
}

impl<'r> LayoutPlanner<'r> {
    /// A planner with the default alignment of 8 bytes.
    pub fn new(registry: &'r TypeRegistry) -> Self {
        Self {
            registry,
            alignment: DEFAULT_ALIGNMENT,
        }
    }

    /// Overrides the entry alignment. Must be a power of two.
    pub fn with_alignment(mut self, alignment: u32) -> Result<Self> {
        Layout::new(alignment)?;
        self.alignment = alignment;
        Ok(self)
    }

    /// The entry alignment.
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Lays out everything reachable from `root`.
    ///
    /// Instances already placed in `parent` or one of its ancestors are
    /// skipped: they keep their address there. A `None` root yields an empty
    /// layout.
    pub fn create_layout(
        &self,
        heap: &Heap,
        root: Option<InstanceId>,
        parent: Option<&InstanceSet>,
    ) -> Result<Layout> {
        let mut layout = Layout::new(self.alignment)?;
        let Some(root) = root else {
            return Ok(layout);
        };

        let mut pending = vec![root];
        let mut children = Vec::new();
        while let Some(id) = pending.pop() {
            if parent.is_some_and(|p| p.contains(id)) || layout.contains(id) {
                continue;
            }
            let instance = heap.get(id)?;
            let (size, array_length) = self.size_of(instance)?;
            layout.append(id, size, array_length)?;

            children.clear();
            self.collect_children(instance, &mut children)?;
            // Reversed, so that the first child is visited first.
            pending.extend(children.iter().rev());
        }

        log::debug!(
            "planned layout: {} entries, {} bytes, alignment {}",
            layout.len(),
            layout.size(),
            self.alignment
        );
        Ok(layout)
    }

    /// Byte size of a standalone instance, and its length if it is an array.
    pub fn size_of(&self, instance: &Instance) -> Result<(u32, Option<u32>)> {
        match instance {
            Instance::Object(object) => {
                if object.ty().kind() != TypeKind::Object {
                    return Err(NbinError::CannotAllocateValueType(
                        object.ty().name().to_string(),
                    ));
                }
                let descriptor = self.registry.get_or_create(object.ty())?;
                Ok((descriptor.size(), None))
            }
            Instance::Array(array) => {
                let length = u32::try_from(array.len()).map_err(|_| {
                    NbinError::UnsupportedType(format!("array of {} elements", array.len()))
                })?;
                let element = self.registry.shallow_size(&array.element_type())?;
                let size = element.checked_mul(length).ok_or_else(|| {
                    NbinError::UnsupportedType(format!(
                        "array of {length} x {element} bytes exceeds 4 GiB"
                    ))
                })?;
                Ok((size, Some(length)))
            }
        }
    }

    fn collect_children(&self, instance: &Instance, out: &mut Vec<InstanceId>) -> Result<()> {
        match instance {
            Instance::Object(object) => {
                let descriptor = self.registry.get_or_create(object.ty())?;
                collect_field_refs(&descriptor, object.values(), out);
            }
            Instance::Array(ArrayInstance::Reference { values, .. }) => {
                out.extend(values.iter().flatten());
            }
            Instance::Array(ArrayInstance::Struct { ty, elements }) => {
                if carries_references(&ValueType::Struct(ty.clone())) {
                    let descriptor = self.registry.get_or_create(ty)?;
                    for element in elements.iter().flatten() {
                        collect_field_refs(&descriptor, element.values(), out);
                    }
                }
            }
            Instance::Array(_) => {}
        }
        Ok(())
    }
}

/// References held by laid out fields, inline structs included.
fn collect_field_refs(descriptor: &TypeDescriptor, values: &[Value], out: &mut Vec<InstanceId>) {
    for field in descriptor.fields() {
        match (field.layout(), values.get(field.slot())) {
            (FieldLayout::Reference(_), Some(value)) => out.extend(value.as_ref_id()),
            (FieldLayout::Struct(nested), Some(Value::Struct(inner))) => {
                collect_field_refs(nested, inner.values(), out);
            }
            _ => {}
        }
    }
}

/// True if a struct type holds a reference field, directly or through nested structs.
fn carries_references(ty: &ValueType) -> bool {
    match ty {
        ValueType::Reference(_) => true,
        ValueType::Struct(def) => def
            .declared_fields()
            .iter()
            .any(|(_, field)| carries_references(field.ty())),
        ValueType::Primitive(_) | ValueType::Enum(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldDef, PrimitiveKind, TypeDef, TypeRef};

    fn node() -> TypeRef {
        TypeDef::object("demo::Node")
            .field(FieldDef::new("value", ValueType::Primitive(PrimitiveKind::Int)))
            .field(FieldDef::new("left", ValueType::object("demo::Node")))
            .field(FieldDef::new("right", ValueType::object("demo::Node")))
            .build()
    }

    #[test]
    fn null_root_is_empty() -> Result<()> {
        let registry = TypeRegistry::new();
        let layout = LayoutPlanner::new(&registry).create_layout(&Heap::new(), None, None)?;
        assert!(layout.is_empty());
        assert_eq!(layout.size(), 0);
        Ok(())
    }

    #[test]
    fn pre_order_with_sharing_and_cycles() -> Result<()> {
        let ty = node();
        let mut heap = Heap::new();
        let root = heap.alloc_object(&ty)?;
        let a = heap.alloc_object(&ty)?;
        let b = heap.alloc_object(&ty)?;
        heap.set_field(root, "left", Value::Ref(Some(a)))?;
        heap.set_field(root, "right", Value::Ref(Some(b)))?;
        heap.set_field(a, "left", Value::Ref(Some(b)))?;
        heap.set_field(a, "right", Value::Ref(Some(root)))?;
        heap.set_field(b, "left", Value::Ref(Some(b)))?;

        let registry = TypeRegistry::new();
        let layout = LayoutPlanner::new(&registry).create_layout(&heap, Some(root), None)?;
        let order: Vec<_> = layout.entries().iter().map(|e| e.instance()).collect();
        assert_eq!(order, vec![root, a, b]);
        // tag + int + 2 refs = 32 bytes
        let offsets: Vec<_> = layout.entries().iter().map(|e| e.offset()).collect();
        assert_eq!(offsets, vec![0, 32, 64]);
        assert_eq!(layout.size(), 96);
        assert_eq!(layout.entry_at(32).map(|e| e.instance()), Some(a));
        assert_eq!(layout.entry_at(33), None);
        Ok(())
    }

    #[test]
    fn arrays_and_alignment() -> Result<()> {
        let mut heap = Heap::new();
        let bytes = heap.insert_array(ArrayInstance::Byte(vec![1, 2, 3]));
        let empty = heap.insert_array(ArrayInstance::Int(Vec::new()));
        let refs = heap.insert_array(ArrayInstance::Reference {
            element: crate::types::RefType::Any,
            values: vec![Some(bytes), Some(empty), Some(bytes)],
        });

        let registry = TypeRegistry::new();
        for alignment in [1, 4, 8, 16] {
            let layout = LayoutPlanner::new(&registry)
                .with_alignment(alignment)?
                .create_layout(&heap, Some(refs), None)?;
            assert_eq!(layout.len(), 3);
            let root = layout.entries()[0];
            assert_eq!((root.size(), root.length()), (24, 3));
            for entry in layout.entries() {
                assert_eq!(entry.offset() % u64::from(alignment), 0);
                assert!(entry.is_array());
            }
            assert_eq!(layout.size() % u64::from(alignment), 0);
            let offsets: std::collections::HashSet<_> =
                layout.entries().iter().map(|e| e.offset()).collect();
            assert_eq!(offsets.len(), 3);
        }
        assert!(LayoutPlanner::new(&registry).with_alignment(3).is_err());
        Ok(())
    }

    #[test]
    fn value_types_cannot_be_roots() -> Result<()> {
        let point = TypeDef::structure("demo::Point")
            .field(FieldDef::new("x", ValueType::Primitive(PrimitiveKind::Int)))
            .build();
        let mut heap = Heap::new();
        let id = heap.alloc_object(&point)?;
        let registry = TypeRegistry::new();
        let err = LayoutPlanner::new(&registry)
            .create_layout(&heap, Some(id), None)
            .unwrap_err();
        assert!(matches!(err, NbinError::CannotAllocateValueType(_)));
        Ok(())
    }

    #[test]
    fn insert_rejects_overlap() -> Result<()> {
        let mut heap = Heap::new();
        let a = heap.insert_array(ArrayInstance::Long(vec![1, 2]));
        let b = heap.insert_array(ArrayInstance::Long(vec![3]));
        let mut layout = Layout::new(8)?;
        layout.insert(a, 0, 16, Some(2))?;
        assert!(matches!(
            layout.insert(b, 8, 8, Some(1)),
            Err(NbinError::Format(_))
        ));
        layout.insert(b, 16, 8, Some(1))?;
        assert_eq!(layout.size(), 24);
        Ok(())
    }
}
