//! Type declarations: the field-introspection contract of the engine.
//!
//! A [`TypeDef`] is the *declared* shape of a type: its name, its kind, its
//! ordered fields (or enum constants) and an optional supertype. It says
//! nothing about sizes or offsets; that is derived later by the
//! [`TypeRegistry`](crate::registry::TypeRegistry).
//!
//! Struct and enum fields embed the [`TypeRef`] of their type, because those
//! types are sized inline. Reference fields only *name* their target
//! ([`RefType::Object`]), which is what lets a type point to itself.
//!
//! ```rust
//! use nbin::types::{FieldDef, PrimitiveKind, RefType, TypeDef, ValueType};
//!
//! let node = TypeDef::object("demo::Node")
//!     .field(FieldDef::new("value", ValueType::Primitive(PrimitiveKind::Int)))
//!     .field(FieldDef::new("next", ValueType::Reference(RefType::Object("demo::Node".into()))))
//!     .build();
//! assert_eq!(node.fields().len(), 2);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::{NbinError, Result};

/// Shared handle to an immutable type declaration.
pub type TypeRef = Arc<TypeDef>;

/// Name of the built-in type standing for an untyped reference target.
pub const ANY_TYPE_NAME: &str = "object";

/// Storage size of a reference (pointer width) and of an object's type tag.
pub const POINTER_SIZE: u32 = 8;

/// Storage size of an enum value.
pub const ENUM_SIZE: u32 = 4;

/// The primitive kinds that can be stored inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    /// Signed 8 bit integer.
    Byte,
    /// Signed 16 bit integer.
    Short,
    /// Signed 32 bit integer.
    Int,
    /// Signed 64 bit integer.
    Long,
    /// 32 bit IEEE float.
    Float,
    /// 64 bit IEEE float.
    Double,
    /// One byte, 0 or 1.
    Boolean,
}

impl PrimitiveKind {
    /// All kinds, in primitive-code order.
    pub const ALL: [PrimitiveKind; 7] = [
        Self::Byte,
        Self::Short,
        Self::Int,
        Self::Long,
        Self::Float,
        Self::Double,
        Self::Boolean,
    ];

    /// Fixed storage width in bytes.
    pub fn size(self) -> u32 {
        match self {
            Self::Byte | Self::Boolean => 1,
            Self::Short => 2,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double => 8,
        }
    }

    /// The negative code used for primitives in the file format.
    pub fn code(self) -> i32 {
        match self {
            Self::Byte => -1,
            Self::Short => -2,
            Self::Int => -3,
            Self::Long => -4,
            Self::Float => -5,
            Self::Double => -6,
            Self::Boolean => -7,
        }
    }

    /// Decodes a primitive code.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    /// Lower-case name, as shown by the inspector.
    pub fn name(self) -> &'static str {
        match self {
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Boolean => "boolean",
        }
    }
}

/// What kind of type a [`TypeDef`] declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// A heap object: addressed, tagged with its type id.
    Object,
    /// A value type packed inline into its owner.
    Struct,
    /// A 4 byte enum value.
    Enum,
}

impl TypeKind {
    /// The kind byte used in the type table.
    pub fn code(self) -> u8 {
        match self {
            Self::Object => 0,
            Self::Struct => 1,
            Self::Enum => 2,
        }
    }

    /// Decodes a kind byte.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Object),
            1 => Some(Self::Struct),
            2 => Some(Self::Enum),
            _ => None,
        }
    }
}

/// The declared target of a reference.
#[derive(Debug, Clone, PartialEq)]
pub enum RefType {
    /// Any heap instance.
    Any,
    /// An object of the named type.
    Object(String),
    /// An array of the given element type.
    Array(Box<ValueType>),
}

/// The storage class of a field or array element.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueType {
    /// Inline primitive.
    Primitive(PrimitiveKind),
    /// Inline 4 byte enum.
    Enum(TypeRef),
    /// Inline struct.
    Struct(TypeRef),
    /// Pointer to another heap instance.
    Reference(RefType),
}

impl ValueType {
    /// Shorthand for an array reference.
    pub fn array_of(element: ValueType) -> Self {
        Self::Reference(RefType::Array(Box::new(element)))
    }

    /// Shorthand for a reference to a named object type.
    pub fn object(name: impl Into<String>) -> Self {
        Self::Reference(RefType::Object(name.into()))
    }

    /// True for primitives, enums and structs, which are never addressed on their own.
    pub fn is_value(&self) -> bool {
        !matches!(self, Self::Reference(_))
    }

    /// Number of array dimensions, and the innermost element type.
    ///
    /// `int[][]` yields `(2, Primitive(Int))`; a non-array yields `(0, self)`.
    pub fn array_dims(&self) -> (u32, &ValueType) {
        match self {
            Self::Reference(RefType::Array(element)) => {
                let (dims, component) = element.array_dims();
                (dims + 1, component)
            }
            other => (0, other),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(kind) => f.write_str(kind.name()),
            Self::Enum(ty) | Self::Struct(ty) => f.write_str(ty.name()),
            Self::Reference(RefType::Any) => f.write_str(ANY_TYPE_NAME),
            Self::Reference(RefType::Object(name)) => f.write_str(name),
            Self::Reference(RefType::Array(element)) => write!(f, "{element}[]"),
        }
    }
}

/// Field modifier flags, filtered by the introspection strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FieldModifiers(u8);

impl FieldModifiers {
    /// No modifier.
    pub const NONE: Self = Self(0);
    /// A type-level field, not part of instances.
    pub const STATIC: Self = Self(0b0000_0001);
    /// Excluded from marshalling.
    pub const TRANSIENT: Self = Self(0b0000_0010);
    /// Cannot be written back on unmarshal.
    pub const IMMUTABLE: Self = Self(0b0000_0100);

    /// Combines two flag sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns true if every flag of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any flag of `other` is set.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for FieldModifiers {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A declared field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    name: String,
    ty: ValueType,
    order: Option<i32>,
    modifiers: FieldModifiers,
}

impl FieldDef {
    /// Creates a plain field.
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
            order: None,
            modifiers: FieldModifiers::NONE,
        }
    }

    /// Sets the explicit native order hint.
    pub fn order(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }

    /// Adds modifier flags.
    pub fn modifiers(mut self, modifiers: FieldModifiers) -> Self {
        self.modifiers = self.modifiers | modifiers;
        self
    }

    /// Marks the field transient.
    pub fn transient(self) -> Self {
        self.modifiers(FieldModifiers::TRANSIENT)
    }

    /// The field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared storage type.
    pub fn ty(&self) -> &ValueType {
        &self.ty
    }

    /// The native order hint, if any.
    pub fn order_hint(&self) -> Option<i32> {
        self.order
    }

    /// The modifier flags.
    pub fn field_modifiers(&self) -> FieldModifiers {
        self.modifiers
    }
}

/// One constant of an enum type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumConstant {
    /// Constant name.
    pub name: String,
    /// Explicit native integer, if the enum is native-mapped.
    pub native_value: Option<i32>,
}

/// An immutable type declaration.
#[derive(Debug, Clone)]
pub struct TypeDef {
    name: String,
    kind: TypeKind,
    supertype: Option<TypeRef>,
    fields: Vec<FieldDef>,
    constants: Vec<EnumConstant>,
}

impl TypeDef {
    /// Starts declaring an object type.
    pub fn object(name: impl Into<String>) -> TypeDefBuilder {
        TypeDefBuilder::new(name.into(), TypeKind::Object)
    }

    /// Starts declaring a struct (inline value) type.
    pub fn structure(name: impl Into<String>) -> TypeDefBuilder {
        TypeDefBuilder::new(name.into(), TypeKind::Struct)
    }

    /// Starts declaring an enum type.
    pub fn enumeration(name: impl Into<String>) -> TypeDefBuilder {
        TypeDefBuilder::new(name.into(), TypeKind::Enum)
    }

    /// The built-in untyped object: no fields, just a type tag.
    pub fn any() -> TypeRef {
        static ANY: OnceLock<TypeRef> = OnceLock::new();
        ANY.get_or_init(|| TypeDef::object(ANY_TYPE_NAME).build())
            .clone()
    }

    /// Type name, also its identity.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared kind.
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// True for struct types.
    pub fn is_struct(&self) -> bool {
        self.kind == TypeKind::Struct
    }

    /// True for enum types.
    pub fn is_enum(&self) -> bool {
        self.kind == TypeKind::Enum
    }

    /// Optional supertype whose fields come first.
    pub fn supertype(&self) -> Option<&TypeRef> {
        self.supertype.as_ref()
    }

    /// Own fields, in declaration order (supertype fields excluded).
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Enum constants, in declaration order.
    pub fn constants(&self) -> &[EnumConstant] {
        &self.constants
    }

    /// Number of value slots an instance of this type carries:
    /// every declared field, supertype chain included.
    pub fn slot_count(&self) -> usize {
        self.supertype.as_ref().map_or(0, |s| s.slot_count()) + self.fields.len()
    }

    /// All declared fields with their slot index, supertype fields first.
    pub fn declared_fields(&self) -> Vec<(usize, &FieldDef)> {
        let mut out = Vec::with_capacity(self.slot_count());
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<(usize, &'a FieldDef)>) {
        if let Some(supertype) = &self.supertype {
            supertype.collect_fields(out);
        }
        for field in &self.fields {
            out.push((out.len(), field));
        }
    }

    /// Slot index of a declared field, looked up by name.
    pub fn slot_of(&self, field_name: &str) -> Option<usize> {
        self.declared_fields()
            .into_iter()
            .find(|(_, f)| f.name() == field_name)
            .map(|(slot, _)| slot)
    }

    /// The integer stored for the constant at `ordinal`: its native value if
    /// declared, the ordinal otherwise.
    pub fn mapped_value(&self, ordinal: u32) -> Option<i32> {
        let constant = self.constants.get(ordinal as usize)?;
        Some(constant.native_value.unwrap_or(ordinal as i32))
    }

    /// Reverse of [`mapped_value`](Self::mapped_value).
    pub fn ordinal_of(&self, value: i32) -> Option<u32> {
        self.constants
            .iter()
            .enumerate()
            .find(|(ordinal, c)| c.native_value.unwrap_or(*ordinal as i32) == value)
            .map(|(ordinal, _)| ordinal as u32)
    }
}

impl PartialEq for TypeDef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.kind == other.kind
    }
}

impl fmt::Display for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Builder returned by [`TypeDef::object`], [`TypeDef::structure`] and [`TypeDef::enumeration`].
#[derive(Debug)]
pub struct TypeDefBuilder {
    def: TypeDef,
}

impl TypeDefBuilder {
    fn new(name: String, kind: TypeKind) -> Self {
        Self {
            def: TypeDef {
                name,
                kind,
                supertype: None,
                fields: Vec::new(),
                constants: Vec::new(),
            },
        }
    }

    /// Appends a field.
    pub fn field(mut self, field: FieldDef) -> Self {
        self.def.fields.push(field);
        self
    }

    /// Sets the supertype.
    pub fn extends(mut self, supertype: TypeRef) -> Self {
        self.def.supertype = Some(supertype);
        self
    }

    /// Appends an enum constant mapped by ordinal.
    pub fn constant(mut self, name: impl Into<String>) -> Self {
        self.def.constants.push(EnumConstant {
            name: name.into(),
            native_value: None,
        });
        self
    }

    /// Appends an enum constant with an explicit native value.
    pub fn native_constant(mut self, name: impl Into<String>, value: i32) -> Self {
        self.def.constants.push(EnumConstant {
            name: name.into(),
            native_value: Some(value),
        });
        self
    }

    /// Freezes the declaration.
    pub fn build(self) -> TypeRef {
        Arc::new(self.def)
    }
}

/// Name → live type lookup.
///
/// This is everything a reader needs to know about the types of a file: the
/// type table only stores names.
#[derive(Debug, Clone)]
pub struct TypeCatalog {
    types: HashMap<String, TypeRef>,
}

impl TypeCatalog {
    /// Creates a catalog holding only the built-in `object` type.
    pub fn new() -> Self {
        let mut types = HashMap::new();
        let any = TypeDef::any();
        types.insert(any.name().to_string(), any);
        Self { types }
    }

    /// Registers a type, its supertype chain and the struct/enum types of its
    /// fields. Reference targets are only named and must be registered on their own.
    pub fn register(&mut self, ty: &TypeRef) -> &mut Self {
        if self.types.contains_key(ty.name()) {
            return self;
        }
        self.types.insert(ty.name().to_string(), ty.clone());
        if let Some(supertype) = ty.supertype() {
            self.register(supertype);
        }
        for field in ty.fields() {
            let (_, component) = field.ty().array_dims();
            if let ValueType::Enum(nested) | ValueType::Struct(nested) = component {
                self.register(nested);
            }
        }
        self
    }

    /// Registers a type declared through [`NativeType`](crate::native::NativeType).
    pub fn register_type<T: crate::native::NativeType>(&mut self) -> &mut Self {
        self.register(&T::type_def())
    }

    /// Looks a type up by name.
    pub fn get(&self, name: &str) -> Option<&TypeRef> {
        self.types.get(name)
    }

    /// Looks a type up by name, failing with [`NbinError::UnresolvedTypeName`].
    pub fn resolve(&self, name: &str) -> Result<TypeRef> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| NbinError::UnresolvedTypeName(name.to_string()))
    }

    /// True if the name is known.
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Number of known types, built-ins included.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Always false: the built-in `object` type is always present.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for TypeCatalog {
    fn default() -> Self {
        Self::new()
    }
}
