//! The high-level facade: saving graphs to nbin files and opening them again.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::error::{NbinError, Result};
use crate::format::{
    count, ConstantRecord, FieldRecord, LayoutRecord, Members, TypeRecord, MAGIC_BYTES,
};
use crate::graph::{Heap, Instance, InstanceId};
use crate::inspector::{DebugReport, NbinInspector};
use crate::introspect::TypeIntrospector;
use crate::io::SeqWriter;
use crate::layout::{Layout, LayoutPlanner, DEFAULT_ALIGNMENT};
use crate::marshal::Marshaller;
use crate::memory::{HeapAllocation, MappedAllocation, MemoryAllocation};
use crate::reader::{NbinFile, NbinReader};
use crate::registry::{FieldLayout, TypeDescriptor, TypeRegistry};
use crate::types::{RefType, TypeCatalog, TypeDef, TypeKind, ValueType};

/// The main entry point for saving and loading graphs.
#[derive(Debug)]
pub struct Nbin;

impl Nbin {
    /// Starts configuring a writer.
    pub fn builder() -> NbinWriter {
        NbinWriter::default()
    }

    /// Saves the graph reachable from `root` to a file, with default settings.
    pub fn save<P: AsRef<Path>>(path: P, heap: &Heap, root: Option<InstanceId>) -> Result<()> {
        Self::builder().save(path, heap, root)
    }

    /// Streams the graph reachable from `root` into `writer`. Returns the
    /// number of bytes written.
    pub fn write<W: Write>(writer: &mut W, heap: &Heap, root: Option<InstanceId>) -> Result<u64> {
        Self::builder().write(writer, heap, root)
    }

    /// Opens a file, resolving its type names through `catalog`.
    pub fn open<P: AsRef<Path>>(path: P, catalog: TypeCatalog) -> Result<NbinFile> {
        NbinReader::builder().catalog(catalog).open(path)
    }

    /// Reads a file image held in memory.
    pub fn open_bytes(bytes: Vec<u8>, catalog: TypeCatalog) -> Result<NbinFile> {
        NbinReader::builder().catalog(catalog).open_bytes(bytes)
    }

    /// Opens a file, reads the whole graph and releases the mapping.
    pub fn load<P: AsRef<Path>>(
        path: P,
        catalog: TypeCatalog,
    ) -> Result<(Heap, Option<InstanceId>)> {
        let mut file = Self::open(path, catalog)?;
        let root = file.unmarshall()?;
        Ok((file.into_heap()?, root))
    }

    /// Decodes the tables of a file without any catalog.
    pub fn inspect<P: AsRef<Path>>(path: P) -> Result<DebugReport> {
        NbinInspector::inspect(path)
    }
}

/// Configurable file writer.
#[derive(Debug, Clone)]
pub struct NbinWriter {
    introspector: Option<Arc<dyn TypeIntrospector>>,
    alignment: u32,
    catalog: Option<TypeCatalog>,
}

impl Default for NbinWriter {
    fn default() -> Self {
        Self {
            introspector: None,
            alignment: DEFAULT_ALIGNMENT,
            catalog: None,
        }
    }
}

impl NbinWriter {
    /// Field introspection strategy. Readers must use the same one.
    pub fn introspector(mut self, introspector: impl TypeIntrospector + 'static) -> Self {
        self.introspector = Some(Arc::new(introspector));
        self
    }

    /// Entry alignment, a power of two.
    pub fn alignment(mut self, alignment: u32) -> Self {
        self.alignment = alignment;
        self
    }

    /// Extra types for resolving reference targets that have no instance in the heap.
    pub fn catalog(mut self, catalog: TypeCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Every object type of the heap joins the catalog, so that reference
    /// targets resolve to their real type.
    fn registry(&self, heap: &Heap) -> TypeRegistry {
        let mut catalog = self.catalog.clone().unwrap_or_default();
        for (_, instance) in heap.iter() {
            if let Instance::Object(object) = instance {
                catalog.register(object.ty());
            }
        }
        let builder = TypeRegistry::builder().catalog(catalog);
        let builder = match &self.introspector {
            Some(introspector) => builder.shared_introspector(introspector.clone()),
            None => builder,
        };
        builder.build()
    }

    fn plan(&self, registry: &TypeRegistry, heap: &Heap, root: Option<InstanceId>) -> Result<Layout> {
        LayoutPlanner::new(registry)
            .with_alignment(self.alignment)?
            .create_layout(heap, root, None)
    }

    /// Saves the graph reachable from `root` to `path`.
    ///
    /// The tables are written sequentially, then the instance region is
    /// mapped read-write right behind them and marshalled in place. If
    /// writing fails once the file is created, the partial file is removed.
    pub fn save<P: AsRef<Path>>(&self, path: P, heap: &Heap, root: Option<InstanceId>) -> Result<()> {
        let path = path.as_ref();
        let registry = self.registry(heap);
        let layout = self.plan(&registry, heap, root)?;

        let result = save_layout(path, &registry, heap, layout);
        if let Err(e) = &result {
            log::debug!("removing partial file {}: {e}", path.display());
            if let Err(remove) = std::fs::remove_file(path) {
                log::warn!("could not remove partial file {}: {remove}", path.display());
            }
        }
        result
    }

    /// Marshals into memory and streams the whole file image into `writer`.
    pub fn write<W: Write>(&self, writer: &mut W, heap: &Heap, root: Option<InstanceId>) -> Result<u64> {
        let registry = self.registry(heap);
        let layout = self.plan(&registry, heap, root)?;
        let region_size = usize::try_from(layout.size())
            .map_err(|_| NbinError::Format(format!("region of {} bytes", layout.size())))?;

        let set = Marshaller::new(&registry).marshall(
            heap,
            layout,
            Box::new(HeapAllocation::new(region_size)),
            None,
        )?;

        let mut out = SeqWriter::new(writer);
        let result = write_tables(&mut out, &registry, heap, set.layout())
            .and_then(|()| out.write_all(set.allocation()?.bytes()?))
            .and_then(|_| out.flush());
        set.release()?;
        result?;
        Ok(out.current_offset())
    }
}

fn save_layout(path: &Path, registry: &TypeRegistry, heap: &Heap, layout: Layout) -> Result<()> {
    let region_size = layout.size();
    let mut writer = SeqWriter::create(path)?;
    write_tables(&mut writer, registry, heap, &layout)?;
    let region_offset = writer.current_offset();
    let file = writer.into_inner()?;

    let allocation: Box<dyn MemoryAllocation> = if region_size == 0 {
        Box::new(HeapAllocation::new(0))
    } else {
        Box::new(MappedAllocation::create(&file, region_offset, region_size)?)
    };
    let set = Marshaller::new(registry).marshall(heap, layout, allocation, None)?;
    set.release()?;
    file.sync_all()?;

    log::debug!(
        "saved {} ({region_offset} bytes of tables, {region_size} bytes of instances)",
        path.display()
    );
    Ok(())
}

/// Writes magic, type table, layout table and region size.
fn write_tables<W: Write>(
    writer: &mut SeqWriter<W>,
    registry: &TypeRegistry,
    heap: &Heap,
    layout: &Layout,
) -> Result<()> {
    let mut table = TypeTable::new(registry)?;
    let mut entries = Vec::with_capacity(layout.len());
    for entry in layout.entries() {
        let size = i32::try_from(entry.size())
            .map_err(|_| NbinError::Format(format!("entry of {} bytes", entry.size())))?;
        let record = match heap.get(entry.instance())? {
            Instance::Object(object) => {
                let descriptor = registry.get_or_create(object.ty())?;
                table.include(&descriptor);
                LayoutRecord {
                    type_id: descriptor.type_id(),
                    offset: offset_of(entry.offset())?,
                    size,
                    length: 1,
                }
            }
            Instance::Array(array) => LayoutRecord {
                type_id: table.element_id(&array.element_type())?,
                offset: offset_of(entry.offset())?,
                size: -size,
                length: count(array.len())?,
            },
        };
        entries.push(record);
    }
    let types = table.finish()?;

    writer.write_all(&MAGIC_BYTES)?;
    writer.write_i32(count(types.len())?)?;
    for record in &types {
        writer.write_all(&record.to_bytes()?)?;
    }
    writer.write_i32(count(entries.len())?)?;
    for record in &entries {
        writer.write_all(&record.to_bytes())?;
    }
    writer.write_i64(offset_of(layout.size())?)?;

    log::debug!(
        "wrote {} types and {} layout entries ({} bytes of tables)",
        types.len(),
        entries.len(),
        writer.current_offset()
    );
    Ok(())
}

fn offset_of(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| NbinError::Format(format!("offset {value} exceeds i64")))
}

/// Collects the closed set of types named by the layout and by their members.
struct TypeTable<'r> {
    registry: &'r TypeRegistry,
    any: Arc<TypeDescriptor>,
    seen: HashSet<i32>,
    pending: Vec<Arc<TypeDescriptor>>,
}

impl<'r> TypeTable<'r> {
    fn new(registry: &'r TypeRegistry) -> Result<Self> {
        Ok(Self {
            registry,
            any: registry.get_or_create(&TypeDef::any())?,
            seen: HashSet::new(),
            pending: Vec::new(),
        })
    }

    fn include(&mut self, descriptor: &Arc<TypeDescriptor>) {
        if self.seen.insert(descriptor.type_id()) {
            self.pending.push(descriptor.clone());
        }
    }

    /// The id stored for an array element type or innermost member type.
    ///
    /// Untyped, nested-array and unresolvable reference targets use `object`.
    fn element_id(&mut self, element: &ValueType) -> Result<i32> {
        let descriptor = match element {
            ValueType::Primitive(kind) => return Ok(kind.code()),
            ValueType::Enum(def) | ValueType::Struct(def) => self.registry.get_or_create(def)?,
            ValueType::Reference(RefType::Object(name)) => match self.registry.resolve(name) {
                Ok(def) => self.registry.get_or_create(&def)?,
                Err(NbinError::UnresolvedTypeName(_)) => {
                    log::debug!("reference target {name} is unknown, stored as object");
                    self.any.clone()
                }
                Err(e) => return Err(e),
            },
            ValueType::Reference(RefType::Any | RefType::Array(_)) => self.any.clone(),
        };
        self.include(&descriptor);
        Ok(descriptor.type_id())
    }

    fn member(&mut self, layout: &FieldLayout) -> Result<(i32, i32)> {
        let ty = match layout {
            FieldLayout::Primitive(kind) => return Ok((0, kind.code())),
            FieldLayout::Enum(nested) | FieldLayout::Struct(nested) => {
                self.include(nested);
                return Ok((0, nested.type_id()));
            }
            FieldLayout::Reference(target) => ValueType::Reference(target.clone()),
        };
        let (dims, component) = ty.array_dims();
        let dims = i32::try_from(dims)
            .map_err(|_| NbinError::Format(format!("{dims} array dimensions")))?;
        Ok((dims, self.element_id(component)?))
    }

    fn record(&mut self, descriptor: &TypeDescriptor) -> Result<TypeRecord> {
        let members = if descriptor.kind() == TypeKind::Enum {
            let def = descriptor.def();
            let constants = def
                .constants()
                .iter()
                .enumerate()
                .map(|(ordinal, constant)| ConstantRecord {
                    name: constant.name.clone(),
                    value: constant
                        .native_value
                        .unwrap_or_else(|| i32::try_from(ordinal).unwrap_or(i32::MAX)),
                })
                .collect();
            Members::Constants(constants)
        } else {
            let mut fields = Vec::with_capacity(descriptor.fields().len());
            for field in descriptor.fields() {
                let (dims, type_id) = self.member(field.layout())?;
                fields.push(FieldRecord {
                    name: field.name().to_string(),
                    dims,
                    type_id,
                });
            }
            Members::Fields(fields)
        };
        Ok(TypeRecord {
            type_id: descriptor.type_id(),
            name: descriptor.name().to_string(),
            kind: descriptor.kind(),
            members,
        })
    }

    /// Drains the worklist; member types discovered on the way are added.
    fn finish(mut self) -> Result<Vec<TypeRecord>> {
        let mut records = Vec::new();
        while let Some(descriptor) = self.pending.pop() {
            records.push(self.record(&descriptor)?);
        }
        records.sort_by_key(|record| record.type_id);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FileTables;
    use crate::io::ByteReader;
    use crate::types::{FieldDef, PrimitiveKind};

    #[test]
    fn failed_save_leaves_no_file() -> Result<()> {
        let point = TypeDef::structure("demo::Point")
            .field(FieldDef::new("x", ValueType::Primitive(PrimitiveKind::Int)))
            .build();
        let mut heap = Heap::new();
        let root = heap.insert_array(crate::graph::ArrayInstance::Struct {
            ty: point,
            elements: vec![None],
        });

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.nbin");
        let err = Nbin::save(&path, &heap, Some(root)).unwrap_err();
        assert!(matches!(err.root_cause(), NbinError::NullStructElement));
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn type_table_is_closed() -> Result<()> {
        let mode = TypeDef::enumeration("demo::Mode")
            .native_constant("Off", 5)
            .native_constant("On", 10)
            .build();
        let point = TypeDef::structure("demo::Point")
            .field(FieldDef::new("x", ValueType::Primitive(PrimitiveKind::Int)))
            .field(FieldDef::new("mode", ValueType::Enum(mode)))
            .build();
        let holder = TypeDef::object("demo::Holder")
            .field(FieldDef::new("at", ValueType::Struct(point)))
            .field(FieldDef::new("other", ValueType::object("demo::Missing")))
            .field(FieldDef::new(
                "grid",
                ValueType::array_of(ValueType::array_of(ValueType::Primitive(PrimitiveKind::Long))),
            ))
            .build();

        let mut heap = Heap::new();
        let root = heap.alloc_object(&holder)?;
        let mut bytes = Vec::new();
        let written = Nbin::write(&mut bytes, &heap, Some(root))?;
        assert_eq!(written, bytes.len() as u64);

        let tables = FileTables::read_from(&mut ByteReader::new(&bytes[..]))?;
        let names: Vec<_> = tables.types.iter().map(|t| t.name.as_str()).collect();
        for name in ["demo::Holder", "demo::Point", "demo::Mode", "object"] {
            assert!(names.contains(&name), "{name} missing from {names:?}");
        }
        let ids: HashSet<_> = tables.types.iter().map(|t| t.type_id).collect();
        for record in &tables.types {
            if let Members::Fields(fields) = &record.members {
                for field in fields {
                    assert!(field.type_id < 0 || ids.contains(&field.type_id));
                }
            }
        }

        let holder_record = tables
            .types
            .iter()
            .find(|t| t.name == "demo::Holder")
            .ok_or_else(|| NbinError::Internal("no holder".into()))?;
        let Members::Fields(fields) = &holder_record.members else {
            panic!("holder has fields");
        };
        assert_eq!(fields[2].dims, 2);
        assert_eq!(fields[2].type_id, PrimitiveKind::Long.code());

        assert_eq!(tables.entries.len(), 1);
        assert_eq!(tables.region_offset + tables.region_size, bytes.len() as u64);
        Ok(())
    }

    #[test]
    fn empty_graph_writes_empty_tables() -> Result<()> {
        let mut bytes = Vec::new();
        Nbin::write(&mut bytes, &Heap::new(), None)?;
        let tables = FileTables::read_from(&mut ByteReader::new(&bytes[..]))?;
        assert!(tables.types.is_empty());
        assert!(tables.entries.is_empty());
        assert_eq!(tables.region_size, 0);
        Ok(())
    }

    #[test]
    fn bad_alignment_is_rejected() {
        let mut bytes = Vec::new();
        let result = Nbin::builder().alignment(6).write(&mut bytes, &Heap::new(), None);
        assert!(matches!(result, Err(NbinError::UnsupportedType(_))));
    }
}
