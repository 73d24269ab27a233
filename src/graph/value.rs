use crate::error::{NbinError, Result};
use crate::graph::InstanceId;
use crate::types::{PrimitiveKind, TypeDef, TypeRef, ValueType};

/// The value held by one field slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `byte`
    Byte(i8),
    /// `short`
    Short(i16),
    /// `int`
    Int(i32),
    /// `long`
    Long(i64),
    /// `float`
    Float(f32),
    /// `double`
    Double(f64),
    /// `boolean`
    Boolean(bool),
    /// Enum constant, by ordinal.
    Enum(u32),
    /// Inline struct.
    Struct(StructValue),
    /// Reference to a heap instance, or null.
    Ref(Option<InstanceId>),
}

impl Value {
    /// The default value of a storage type: zero, `false`, the first enum
    /// constant, a recursively defaulted struct, or null.
    pub fn default_for(ty: &ValueType) -> Result<Self> {
        Ok(match ty {
            ValueType::Primitive(kind) => Self::zero(*kind),
            ValueType::Enum(def) => {
                if def.constants().is_empty() {
                    return Err(NbinError::UnsupportedType(format!(
                        "{} has no constant to default to",
                        def.name()
                    )));
                }
                Self::Enum(0)
            }
            ValueType::Struct(def) => Self::Struct(StructValue::default_of(def)?),
            ValueType::Reference(_) => Self::Ref(None),
        })
    }

    /// The zero of a primitive kind.
    pub fn zero(kind: PrimitiveKind) -> Self {
        match kind {
            PrimitiveKind::Byte => Self::Byte(0),
            PrimitiveKind::Short => Self::Short(0),
            PrimitiveKind::Int => Self::Int(0),
            PrimitiveKind::Long => Self::Long(0),
            PrimitiveKind::Float => Self::Float(0.0),
            PrimitiveKind::Double => Self::Double(0.0),
            PrimitiveKind::Boolean => Self::Boolean(false),
        }
    }

    /// Short name of the variant, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Byte(_) => "byte",
            Self::Short(_) => "short",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Boolean(_) => "boolean",
            Self::Enum(_) => "enum",
            Self::Struct(_) => "struct",
            Self::Ref(_) => "reference",
        }
    }

    /// The referenced instance, if this is a non-null reference.
    pub fn as_ref_id(&self) -> Option<InstanceId> {
        match self {
            Self::Ref(id) => *id,
            _ => None,
        }
    }
}

/// Default values for every declared slot of `def`.
pub(crate) fn default_values(def: &TypeDef) -> Result<Vec<Value>> {
    def.declared_fields()
        .into_iter()
        .map(|(_, field)| Value::default_for(field.ty()))
        .collect()
}

/// An inline struct value.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    ty: TypeRef,
    values: Vec<Value>,
}

impl StructValue {
    /// Wraps the slot values of a struct. `values` must follow the declared fields of `ty`.
    pub fn new(ty: TypeRef, values: Vec<Value>) -> Self {
        Self { ty, values }
    }

    /// A struct with every slot defaulted.
    pub fn default_of(ty: &TypeRef) -> Result<Self> {
        Ok(Self {
            ty: ty.clone(),
            values: default_values(ty)?,
        })
    }

    /// The struct type.
    pub fn ty(&self) -> &TypeRef {
        &self.ty
    }

    /// Slot values.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Mutable slot values.
    pub fn values_mut(&mut self) -> &mut [Value] {
        &mut self.values
    }

    /// The value of a field, by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.ty.slot_of(name).and_then(|slot| self.values.get(slot))
    }
}
