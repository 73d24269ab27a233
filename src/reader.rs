//! The Read-Side Engine.
//!
//! Decodes the tables of a file, checks them against the types known to the
//! reader, builds one placeholder instance per layout entry and binds the
//! resulting layout to the instance region (memory-mapped for files).

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::error::{NbinError, Result};
use crate::format::{FieldRecord, FileTables, LayoutRecord, Members, TypeRecord};
use crate::graph::factory::create_object;
use crate::graph::{ArrayInstance, DefaultFactory, Heap, Instance, InstanceFactory, InstanceId};
use crate::instances::InstanceSet;
use crate::introspect::TypeIntrospector;
use crate::io::ByteReader;
use crate::layout::Layout;
use crate::memory::{HeapAllocation, MappedAllocation, MemoryAllocation};
use crate::native::NativeObject;
use crate::registry::{FieldLayout, TypeRegistry};
use crate::types::{
    PrimitiveKind, RefType, TypeCatalog, TypeDef, TypeKind, TypeRef, ValueType, ANY_TYPE_NAME,
};
use crate::unmarshal::Unmarshaller;

/// Configurable file reader.
#[derive(Debug, Clone)]
pub struct NbinReader {
    catalog: TypeCatalog,
    introspector: Option<Arc<dyn TypeIntrospector>>,
    factory: Arc<dyn InstanceFactory>,
}

impl Default for NbinReader {
    fn default() -> Self {
        Self {
            catalog: TypeCatalog::new(),
            introspector: None,
            factory: Arc::new(DefaultFactory),
        }
    }
}

impl NbinReader {
    /// A reader with an empty catalog, declared-order introspection and
    /// default construction.
    pub fn builder() -> Self {
        Self::default()
    }

    /// Types that type names of the file resolve to.
    pub fn catalog(mut self, catalog: TypeCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Field introspection strategy. Must match the writer's.
    pub fn introspector(mut self, introspector: impl TypeIntrospector + 'static) -> Self {
        self.introspector = Some(Arc::new(introspector));
        self
    }

    /// Placeholder construction hook.
    pub fn instance_factory(mut self, factory: impl InstanceFactory + 'static) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    /// Opens a file and maps its instance region read-only.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<NbinFile> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let tables = FileTables::read_from(&mut ByteReader::new(BufReader::new(&file)))?;

        let allocation: Box<dyn MemoryAllocation> = if tables.region_size == 0 {
            Box::new(HeapAllocation::new(0))
        } else {
            Box::new(MappedAllocation::open(
                &file,
                tables.region_offset,
                tables.region_size,
            )?)
        };
        log::debug!("opened {}", path.display());
        self.assemble(&tables, allocation)
    }

    /// Reads a file image held in memory. The region is kept in the buffer.
    pub fn open_bytes(&self, mut bytes: Vec<u8>) -> Result<NbinFile> {
        let tables = FileTables::read_from(&mut ByteReader::new(&bytes[..]))?;
        let available = bytes.len() as u64 - tables.region_offset;
        if available < tables.region_size {
            return Err(NbinError::UnexpectedEof(format!(
                "instance region needs {} bytes, {available} available",
                tables.region_size
            )));
        }
        // Both bounds fit in the buffer length, checked above.
        let end = (tables.region_offset + tables.region_size) as usize;
        bytes.truncate(end);
        bytes.drain(..tables.region_offset as usize);
        self.assemble(&tables, Box::new(HeapAllocation::from_bytes(bytes)))
    }

    fn assemble(&self, tables: &FileTables, allocation: Box<dyn MemoryAllocation>) -> Result<NbinFile> {
        let mut by_id: HashMap<i32, &TypeRecord> = HashMap::with_capacity(tables.types.len());
        let mut ids: HashMap<String, i32> = HashMap::with_capacity(tables.types.len());
        for record in &tables.types {
            if by_id.insert(record.type_id, record).is_some() || ids.contains_key(&record.name) {
                return Err(NbinError::Format(format!(
                    "type table repeats {} (id {})",
                    record.name, record.type_id
                )));
            }
            ids.insert(record.name.clone(), record.type_id);
        }

        let builder = TypeRegistry::builder()
            .catalog(self.catalog.clone())
            .type_ids(move |def: &TypeDef| ids.get(def.name()).copied());
        let registry = match &self.introspector {
            Some(introspector) => builder.shared_introspector(introspector.clone()),
            None => builder,
        }
        .build();

        for record in &tables.types {
            match self.catalog.get(&record.name) {
                Some(def) => validate(&registry, &by_id, def, record)?,
                None => log::debug!("type {} is not known to the reader", record.name),
            }
        }

        let mut heap = Heap::new();
        let mut layout = Layout::new(1)?;
        for record in &tables.entries {
            let offset = u64::try_from(record.offset)
                .map_err(|_| NbinError::Format(format!("negative entry offset {}", record.offset)))?;
            let end = offset.checked_add(u64::from(record.byte_size()));
            if end.is_none_or(|end| end > tables.region_size) {
                return Err(NbinError::UnexpectedEof(format!(
                    "entry of {} bytes at offset {offset} runs past the {} byte instance region",
                    record.byte_size(),
                    tables.region_size
                )));
            }
            let (instance, length) = self.placeholder(&registry, &by_id, record)?;
            let id = heap.add(instance);
            layout.insert(id, offset, record.byte_size(), length)?;
        }

        let set = InstanceSet::new(layout, allocation)?;
        log::debug!(
            "assembled {} entries over {} types into instance set {}",
            tables.entries.len(),
            tables.types.len(),
            set.id()
        );
        Ok(NbinFile {
            heap,
            registry,
            set,
        })
    }

    /// The instance standing for one layout record, before its values are read.
    fn placeholder(
        &self,
        registry: &TypeRegistry,
        by_id: &HashMap<i32, &TypeRecord>,
        record: &LayoutRecord,
    ) -> Result<(Instance, Option<u32>)> {
        let length = u32::try_from(record.length)
            .map_err(|_| NbinError::Format(format!("negative entry length {}", record.length)))?;

        if record.is_array() {
            let element = element_type(registry, by_id, record.type_id)?;
            let expected = u64::from(registry.shallow_size(&element)?) * u64::from(length);
            if expected != u64::from(record.byte_size()) {
                return Err(NbinError::Format(format!(
                    "{element}[{length}] needs {expected} bytes, entry has {}",
                    record.byte_size()
                )));
            }
            let array = ArrayInstance::with_len(&element, length as usize)?;
            return Ok((Instance::Array(array), Some(length)));
        }

        let def = resolve_id(registry, by_id, record.type_id)?;
        if def.kind() != TypeKind::Object || length != 1 {
            return Err(NbinError::Format(format!(
                "{} is not a valid object entry",
                def.name()
            )));
        }
        let descriptor = registry.get_or_create(&def)?;
        if descriptor.size() != record.byte_size() {
            return Err(NbinError::Format(format!(
                "{} is {} bytes for the reader, {} in the file",
                def.name(),
                descriptor.size(),
                record.byte_size()
            )));
        }
        let object = create_object(self.factory.as_ref(), &def)?;
        Ok((Instance::Object(object), None))
    }
}

fn resolve_id(
    registry: &TypeRegistry,
    by_id: &HashMap<i32, &TypeRecord>,
    type_id: i32,
) -> Result<TypeRef> {
    let record = by_id
        .get(&type_id)
        .ok_or(NbinError::UnresolvedTypeId(type_id))?;
    registry.resolve(&record.name)
}

/// The array element type stored under `type_id`.
fn element_type(
    registry: &TypeRegistry,
    by_id: &HashMap<i32, &TypeRecord>,
    type_id: i32,
) -> Result<ValueType> {
    if type_id < 0 {
        return PrimitiveKind::from_code(type_id)
            .map(ValueType::Primitive)
            .ok_or_else(|| NbinError::Format(format!("unknown primitive code {type_id}")));
    }
    let def = resolve_id(registry, by_id, type_id)?;
    Ok(match def.kind() {
        TypeKind::Enum => ValueType::Enum(def),
        TypeKind::Struct => ValueType::Struct(def),
        TypeKind::Object if def.name() == ANY_TYPE_NAME => ValueType::Reference(RefType::Any),
        TypeKind::Object => ValueType::object(def.name()),
    })
}

/// Name of the innermost member type stored in a field record.
fn stored_member(by_id: &HashMap<i32, &TypeRecord>, field: &FieldRecord) -> Result<String> {
    if field.type_id < 0 {
        return field
            .primitive()
            .map(|kind| kind.name().to_string())
            .ok_or_else(|| NbinError::Format(format!("unknown primitive code {}", field.type_id)));
    }
    by_id
        .get(&field.type_id)
        .map(|record| record.name.clone())
        .ok_or(NbinError::UnresolvedTypeId(field.type_id))
}

/// True if a stored member matches the reader's field layout.
///
/// Object references may have been stored as `object` by a writer that did
/// not know their target.
fn member_matches(layout: &FieldLayout, dims: i32, stored: &str) -> bool {
    match layout {
        FieldLayout::Primitive(kind) => dims == 0 && stored == kind.name(),
        FieldLayout::Enum(nested) | FieldLayout::Struct(nested) => {
            dims == 0 && stored == nested.name()
        }
        FieldLayout::Reference(target) => {
            let ty = ValueType::Reference(target.clone());
            let (expected_dims, component) = ty.array_dims();
            if u32::try_from(dims).ok() != Some(expected_dims) {
                return false;
            }
            match component {
                ValueType::Reference(RefType::Object(name)) => {
                    stored == name.as_str() || stored == ANY_TYPE_NAME
                }
                ValueType::Reference(RefType::Any | RefType::Array(_)) => stored == ANY_TYPE_NAME,
                other => stored == other.to_string(),
            }
        }
    }
}

/// Checks a type record against the reader's own declaration of that name.
fn validate(
    registry: &TypeRegistry,
    by_id: &HashMap<i32, &TypeRecord>,
    def: &TypeRef,
    record: &TypeRecord,
) -> Result<()> {
    let mismatch = |what: String| {
        NbinError::Format(format!("type {} does not match the reader: {what}", record.name))
    };
    if def.kind() != record.kind {
        return Err(mismatch(format!(
            "kind {:?} in the file, {:?} expected",
            record.kind,
            def.kind()
        )));
    }
    match &record.members {
        Members::Constants(constants) => {
            let expected: Vec<(&str, Option<i32>)> = def
                .constants()
                .iter()
                .enumerate()
                .map(|(ordinal, c)| (c.name.as_str(), def.mapped_value(ordinal as u32)))
                .collect();
            let found: Vec<(&str, Option<i32>)> = constants
                .iter()
                .map(|c| (c.name.as_str(), Some(c.value)))
                .collect();
            if expected != found {
                return Err(mismatch(format!("constants {found:?}, expected {expected:?}")));
            }
        }
        Members::Fields(fields) => {
            let descriptor = registry.get_or_create(def)?;
            let expected: Vec<&str> = descriptor.fields().iter().map(|f| f.name()).collect();
            let found: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
            if expected != found {
                return Err(mismatch(format!("fields {found:?}, expected {expected:?}")));
            }
            for (field, stored) in descriptor.fields().iter().zip(fields) {
                let member = stored_member(by_id, stored)?;
                if !member_matches(field.layout(), stored.dims, &member) {
                    return Err(mismatch(format!(
                        "field {} is {member} with {} dims in the file",
                        field.name(),
                        stored.dims
                    )));
                }
            }
        }
    }
    Ok(())
}

/// An opened file: the placeholders, the reader-side registry and the
/// instance set bound to the region.
#[derive(Debug)]
pub struct NbinFile {
    heap: Heap,
    registry: TypeRegistry,
    set: InstanceSet,
}

impl NbinFile {
    /// Reads the region into the heap. Returns the root, or `None` for an
    /// empty file.
    pub fn unmarshall(&mut self) -> Result<Option<InstanceId>> {
        Unmarshaller::new(&self.registry).unmarshall(&mut self.heap, &self.set)
    }

    /// Reads the region and extracts the root as a derived Rust type.
    pub fn load<T: NativeObject>(&mut self) -> Result<T> {
        let root = self
            .unmarshall()?
            .ok_or_else(|| NbinError::Format("file has no root instance".into()))?;
        self.heap.extract(root)
    }

    /// The heap holding one instance per layout entry.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The reader-side registry, with the type ids of the file.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// The set bound to the instance region.
    pub fn instance_set(&self) -> &InstanceSet {
        &self.set
    }

    /// Releases the region. The heap stays usable.
    pub fn release(&self) -> Result<()> {
        self.set.release()
    }

    /// Releases the region and gives the heap back.
    pub fn into_heap(self) -> Result<Heap> {
        self.set.release()?;
        Ok(self.heap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Nbin;
    use crate::graph::Value;
    use crate::types::FieldDef;

    fn int() -> ValueType {
        ValueType::Primitive(PrimitiveKind::Int)
    }

    fn pair(second: &str) -> TypeRef {
        TypeDef::object("demo::Pair")
            .field(FieldDef::new("first", int()))
            .field(FieldDef::new(second, int()))
            .build()
    }

    fn image_of(ty: &TypeRef) -> Result<Vec<u8>> {
        let mut heap = Heap::new();
        let root = heap.alloc_object(ty)?;
        heap.set_field(root, "first", Value::Int(7))?;
        let mut bytes = Vec::new();
        Nbin::write(&mut bytes, &heap, Some(root))?;
        Ok(bytes)
    }

    #[test]
    fn reads_back_from_bytes() -> Result<()> {
        let ty = pair("second");
        let bytes = image_of(&ty)?;
        let mut catalog = TypeCatalog::new();
        catalog.register(&ty);

        let mut file = Nbin::open_bytes(bytes, catalog)?;
        let root = file.unmarshall()?.ok_or_else(|| NbinError::Internal("no root".into()))?;
        assert_eq!(file.heap().field(root, "first")?, &Value::Int(7));
        let heap = file.into_heap()?;
        assert_eq!(heap.len(), 1);
        Ok(())
    }

    #[test]
    fn renamed_field_is_a_format_error() -> Result<()> {
        let bytes = image_of(&pair("second"))?;
        let mut catalog = TypeCatalog::new();
        catalog.register(&pair("other"));
        assert!(matches!(
            Nbin::open_bytes(bytes, catalog),
            Err(NbinError::Format(_))
        ));
        Ok(())
    }

    #[test]
    fn retyped_field_is_a_format_error() -> Result<()> {
        let bytes = image_of(&pair("second"))?;
        // Same names and sizes, but `first` is now a float.
        let retyped = TypeDef::object("demo::Pair")
            .field(FieldDef::new("first", ValueType::Primitive(PrimitiveKind::Float)))
            .field(FieldDef::new("second", int()))
            .build();
        let mut catalog = TypeCatalog::new();
        catalog.register(&retyped);
        let err = Nbin::open_bytes(bytes, catalog).unwrap_err();
        assert!(matches!(&err, NbinError::Format(message) if message.contains("first")));
        Ok(())
    }

    #[test]
    fn entry_past_the_region_is_eof() -> Result<()> {
        let record = LayoutRecord {
            type_id: PrimitiveKind::Long.code(),
            offset: 0,
            size: -8_000_000,
            length: 1_000_000,
        };
        let mut bytes = b"NBIN".to_vec();
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&record.to_bytes());
        bytes.extend_from_slice(&0i64.to_le_bytes());

        assert!(matches!(
            Nbin::open_bytes(bytes, TypeCatalog::new()),
            Err(NbinError::UnexpectedEof(_))
        ));
        Ok(())
    }

    #[test]
    fn unknown_type_name_fails() -> Result<()> {
        let bytes = image_of(&pair("second"))?;
        assert!(matches!(
            Nbin::open_bytes(bytes, TypeCatalog::new()),
            Err(NbinError::UnresolvedTypeName(name)) if name == "demo::Pair"
        ));
        Ok(())
    }

    #[test]
    fn truncated_region_fails() -> Result<()> {
        let ty = pair("second");
        let mut bytes = image_of(&ty)?;
        bytes.truncate(bytes.len() - 1);
        let mut catalog = TypeCatalog::new();
        catalog.register(&ty);
        assert!(matches!(
            Nbin::open_bytes(bytes, catalog),
            Err(NbinError::UnexpectedEof(_))
        ));
        Ok(())
    }

    #[test]
    fn enum_values_are_checked() -> Result<()> {
        let written = TypeDef::enumeration("demo::Level")
            .native_constant("Low", 1)
            .native_constant("High", 2)
            .build();
        let holder = |level: &TypeRef| {
            TypeDef::object("demo::Holder")
                .field(FieldDef::new("level", ValueType::Enum(level.clone())))
                .build()
        };
        let bytes = image_of_holder(&holder(&written))?;

        let changed = TypeDef::enumeration("demo::Level")
            .native_constant("Low", 1)
            .native_constant("High", 3)
            .build();
        let mut catalog = TypeCatalog::new();
        catalog.register(&holder(&changed));
        assert!(matches!(
            Nbin::open_bytes(bytes, catalog),
            Err(NbinError::Format(_))
        ));
        Ok(())
    }

    fn image_of_holder(ty: &TypeRef) -> Result<Vec<u8>> {
        let mut heap = Heap::new();
        let root = heap.alloc_object(ty)?;
        let mut bytes = Vec::new();
        Nbin::write(&mut bytes, &heap, Some(root))?;
        Ok(bytes)
    }
}
