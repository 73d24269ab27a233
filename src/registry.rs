//! The Type Registry: derives and caches native size, alignment and field
//! offsets per type, and assigns type ids.
//!
//! ## Sizing rule
//!
//! | Storage                | Size                   | Alignment             |
//! |------------------------|------------------------|-----------------------|
//! | primitive              | fixed width            | same as size          |
//! | enum                   | 4                      | 4                     |
//! | struct                 | nested descriptor size | nested alignment      |
//! | reference (incl. array)| 8                      | 8                     |
//!
//! Offsets accumulate in introspection order, each rounded up to the field's
//! alignment. Object types reserve a leading 8 byte slot for their type id
//! tag, which forces an alignment of at least 8. The final size is rounded up
//! to the type's alignment.
//!
//! ## Concurrency
//!
//! All derivation happens under one registry-wide mutex. Nested derivation
//! (a struct field triggering its struct type) recurses on the already locked
//! state, so there is no reentrant locking and no half-built descriptor is
//! ever visible to another thread.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{NbinError, Result};
use crate::introspect::{DeclaredOrder, FieldSlot, TypeIntrospector};
use crate::types::{
    PrimitiveKind, RefType, TypeCatalog, TypeDef, TypeKind, TypeRef, ValueType, ENUM_SIZE,
    POINTER_SIZE,
};

/// External type-id assignment.
pub type TypeIdFn = Arc<dyn Fn(&TypeDef) -> Option<i32> + Send + Sync>;

/// Rounds `value` up to the next multiple of `alignment` (a power of two, or 0/1 for none).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Derived native metadata of one type.
#[derive(Debug)]
pub struct TypeDescriptor {
    def: TypeRef,
    type_id: i32,
    size: u32,
    alignment: u32,
    fields: Vec<FieldDescriptor>,
}

impl TypeDescriptor {
    /// The declaration this descriptor was derived from.
    pub fn def(&self) -> &TypeRef {
        &self.def
    }

    /// Type name.
    pub fn name(&self) -> &str {
        self.def.name()
    }

    /// Declared kind.
    pub fn kind(&self) -> TypeKind {
        self.def.kind()
    }

    /// Assigned type id.
    pub fn type_id(&self) -> i32 {
        self.type_id
    }

    /// Native byte size, tag included for objects.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Required alignment.
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Laid out fields, in offset order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (id {}, size {}, align {})",
            self.def.name(),
            self.type_id,
            self.size,
            self.alignment
        )
    }
}

/// How a field is stored.
#[derive(Debug, Clone)]
pub enum FieldLayout {
    /// Inline primitive.
    Primitive(PrimitiveKind),
    /// Inline 4 byte enum; the descriptor carries the constants.
    Enum(Arc<TypeDescriptor>),
    /// Inline struct.
    Struct(Arc<TypeDescriptor>),
    /// An 8 byte address.
    Reference(RefType),
}

impl FieldLayout {
    fn size_and_alignment(&self) -> (u32, u32) {
        match self {
            Self::Primitive(kind) => (kind.size(), kind.size()),
            Self::Enum(_) => (ENUM_SIZE, ENUM_SIZE),
            Self::Struct(nested) => (nested.size(), nested.alignment()),
            Self::Reference(_) => (POINTER_SIZE, POINTER_SIZE),
        }
    }
}

/// A laid out field: where it lives, and which value slot feeds it.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    name: String,
    layout: FieldLayout,
    offset: u32,
    size: u32,
    alignment: u32,
    slot: usize,
}

impl FieldDescriptor {
    /// Field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage class.
    pub fn layout(&self) -> &FieldLayout {
        &self.layout
    }

    /// Byte offset within the owning type.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Byte size.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Required alignment.
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Index of the value in the owning instance.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    by_name: HashMap<String, Arc<TypeDescriptor>>,
    /// Built on demand by `get`, dropped whenever a descriptor is added.
    by_id: Option<HashMap<i32, Arc<TypeDescriptor>>>,
    in_progress: HashSet<String>,
    next_id: i32,
}

/// Process-scoped cache of [`TypeDescriptor`]s. No eviction.
pub struct TypeRegistry {
    state: Mutex<RegistryState>,
    introspector: Arc<dyn TypeIntrospector>,
    type_ids: Option<TypeIdFn>,
    catalog: TypeCatalog,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("introspector", &self.introspector)
            .field("external_ids", &self.type_ids.is_some())
            .field("catalog", &self.catalog.len())
            .finish_non_exhaustive()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// A registry with [`DeclaredOrder`] introspection and counter ids.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts configuring a registry.
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| NbinError::Internal("TypeRegistry Mutex poisoned".into()))
    }

    /// Returns the descriptor of `ty`, deriving it on first access.
    pub fn get_or_create(&self, ty: &TypeRef) -> Result<Arc<TypeDescriptor>> {
        let mut state = self.lock()?;
        self.derive(&mut state, ty)
    }

    /// Returns the descriptor standing behind a storage type.
    ///
    /// Primitives and arrays are not independently registrable and fail with
    /// [`NbinError::UnsupportedType`]. A named reference target is resolved
    /// through [`resolve`](Self::resolve), an untyped one maps to `object`.
    pub fn descriptor_for(&self, ty: &ValueType) -> Result<Arc<TypeDescriptor>> {
        match ty {
            ValueType::Primitive(kind) => Err(NbinError::UnsupportedType(kind.name().into())),
            ValueType::Reference(RefType::Array(_)) => {
                Err(NbinError::UnsupportedType(ty.to_string()))
            }
            ValueType::Enum(def) | ValueType::Struct(def) => self.get_or_create(def),
            ValueType::Reference(RefType::Object(name)) => {
                let def = self.resolve(name)?;
                self.get_or_create(&def)
            }
            ValueType::Reference(RefType::Any) => self.get_or_create(&TypeDef::any()),
        }
    }

    /// Looks a descriptor up by type id.
    pub fn get(&self, type_id: i32) -> Result<Arc<TypeDescriptor>> {
        let mut state = self.lock()?;
        if state.by_id.is_none() {
            let index = state
                .by_name
                .values()
                .map(|d| (d.type_id, d.clone()))
                .collect();
            state.by_id = Some(index);
        }
        state
            .by_id
            .as_ref()
            .and_then(|index| index.get(&type_id))
            .cloned()
            .ok_or(NbinError::UnresolvedTypeId(type_id))
    }

    /// Looks a registered descriptor up by type name.
    pub fn get_by_name(&self, name: &str) -> Result<Option<Arc<TypeDescriptor>>> {
        Ok(self.lock()?.by_name.get(name).cloned())
    }

    /// Resolves a type name to a live type: registered types first, then the catalog.
    pub fn resolve(&self, name: &str) -> Result<TypeRef> {
        if let Some(descriptor) = self.lock()?.by_name.get(name) {
            return Ok(descriptor.def.clone());
        }
        self.catalog.resolve(name)
    }

    /// True if a descriptor exists for this name.
    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.lock()?.by_name.contains_key(name))
    }

    /// True if a descriptor exists for this id.
    pub fn contains_id(&self, type_id: i32) -> Result<bool> {
        match self.get(type_id) {
            Ok(_) => Ok(true),
            Err(NbinError::UnresolvedTypeId(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every registered descriptor, by ascending type id.
    pub fn descriptors(&self) -> Result<Vec<Arc<TypeDescriptor>>> {
        let mut all: Vec<_> = self.lock()?.by_name.values().cloned().collect();
        all.sort_by_key(|d| d.type_id);
        Ok(all)
    }

    /// The catalog used by [`resolve`](Self::resolve).
    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    /// Inline storage size of a value of type `ty`.
    pub fn shallow_size(&self, ty: &ValueType) -> Result<u32> {
        Ok(self.size_and_alignment(ty)?.0)
    }

    /// Alignment of a value of type `ty`.
    pub fn alignment_of(&self, ty: &ValueType) -> Result<u32> {
        Ok(self.size_and_alignment(ty)?.1)
    }

    fn size_and_alignment(&self, ty: &ValueType) -> Result<(u32, u32)> {
        match ty {
            ValueType::Primitive(kind) => Ok((kind.size(), kind.size())),
            ValueType::Enum(_) => Ok((ENUM_SIZE, ENUM_SIZE)),
            ValueType::Struct(def) => {
                let nested = self.get_or_create(def)?;
                Ok((nested.size, nested.alignment))
            }
            ValueType::Reference(_) => Ok((POINTER_SIZE, POINTER_SIZE)),
        }
    }

    fn derive(&self, state: &mut RegistryState, def: &TypeRef) -> Result<Arc<TypeDescriptor>> {
        if let Some(found) = state.by_name.get(def.name()) {
            return Ok(found.clone());
        }
        if !state.in_progress.insert(def.name().to_string()) {
            return Err(NbinError::UnsupportedType(format!(
                "{} contains itself inline",
                def.name()
            )));
        }
        let built = self.build(state, def);
        state.in_progress.remove(def.name());
        let descriptor = Arc::new(built?);

        log::trace!("registered {descriptor}");
        state
            .by_name
            .insert(def.name().to_string(), descriptor.clone());
        state.by_id = None;
        Ok(descriptor)
    }

    fn assign_id(&self, state: &mut RegistryState, def: &TypeDef) -> Result<i32> {
        let type_id = match &self.type_ids {
            Some(type_ids) => {
                type_ids(def).ok_or_else(|| NbinError::MissingTypeId(def.name().to_string()))?
            }
            None => {
                let id = state.next_id;
                state.next_id += 1;
                id
            }
        };
        if let Some(clash) = state.by_name.values().find(|d| d.type_id == type_id) {
            return Err(NbinError::UnsupportedType(format!(
                "type id {type_id} of {} already belongs to {}",
                def.name(),
                clash.name()
            )));
        }
        Ok(type_id)
    }

    fn build(&self, state: &mut RegistryState, def: &TypeRef) -> Result<TypeDescriptor> {
        let type_id = self.assign_id(state, def)?;

        if def.is_enum() {
            return Ok(TypeDescriptor {
                def: def.clone(),
                type_id,
                size: ENUM_SIZE,
                alignment: ENUM_SIZE,
                fields: Vec::new(),
            });
        }

        let is_object = def.kind() == TypeKind::Object;
        let (mut offset, mut alignment) = if is_object {
            (u64::from(POINTER_SIZE), POINTER_SIZE)
        } else {
            (0, 1)
        };

        let field_slots = self.introspector.fields(def);
        let mut fields = Vec::with_capacity(field_slots.len());
        for FieldSlot { slot, field } in field_slots {
            let layout = match field.ty() {
                ValueType::Primitive(kind) => FieldLayout::Primitive(*kind),
                ValueType::Enum(nested) if nested.is_enum() => {
                    FieldLayout::Enum(self.derive(state, nested)?)
                }
                ValueType::Struct(nested) if nested.is_struct() => {
                    FieldLayout::Struct(self.derive(state, nested)?)
                }
                ValueType::Enum(nested) | ValueType::Struct(nested) => {
                    return Err(NbinError::UnsupportedType(format!(
                        "{}#{}: {} is not a value type",
                        def.name(),
                        field.name(),
                        nested.name()
                    )));
                }
                ValueType::Reference(target) => FieldLayout::Reference(target.clone()),
            };
            let (size, field_alignment) = layout.size_and_alignment();
            offset = align_up(offset, u64::from(field_alignment));
            let field_offset = u32::try_from(offset).map_err(|_| {
                NbinError::UnsupportedType(format!("{} exceeds 4 GiB", def.name()))
            })?;
            fields.push(FieldDescriptor {
                name: field.name().to_string(),
                layout,
                offset: field_offset,
                size,
                alignment: field_alignment,
                slot,
            });
            offset += u64::from(size);
            alignment = alignment.max(field_alignment);
        }

        let size = u32::try_from(align_up(offset, u64::from(alignment)))
            .map_err(|_| NbinError::UnsupportedType(format!("{} exceeds 4 GiB", def.name())))?;

        Ok(TypeDescriptor {
            def: def.clone(),
            type_id,
            size,
            alignment,
            fields,
        })
    }
}

/// Builder for [`TypeRegistry`].
#[derive(Default)]
pub struct TypeRegistryBuilder {
    introspector: Option<Arc<dyn TypeIntrospector>>,
    type_ids: Option<TypeIdFn>,
    catalog: Option<TypeCatalog>,
}

impl TypeRegistryBuilder {
    /// Field introspection strategy. Defaults to [`DeclaredOrder`].
    pub fn introspector(mut self, introspector: impl TypeIntrospector + 'static) -> Self {
        self.introspector = Some(Arc::new(introspector));
        self
    }

    /// Shared field introspection strategy.
    pub fn shared_introspector(mut self, introspector: Arc<dyn TypeIntrospector>) -> Self {
        self.introspector = Some(introspector);
        self
    }

    /// External type-id function. Defaults to a counter starting at 0.
    pub fn type_ids<F>(mut self, type_ids: F) -> Self
    where
        F: Fn(&TypeDef) -> Option<i32> + Send + Sync + 'static,
    {
        self.type_ids = Some(Arc::new(type_ids));
        self
    }

    /// Catalog used to resolve reference target names.
    pub fn catalog(mut self, catalog: TypeCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Builds the registry.
    pub fn build(self) -> TypeRegistry {
        TypeRegistry {
            state: Mutex::new(RegistryState::default()),
            introspector: self
                .introspector
                .unwrap_or_else(|| Arc::new(DeclaredOrder)),
            type_ids: self.type_ids,
            catalog: self.catalog.unwrap_or_default(),
        }
    }
}
