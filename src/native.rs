//! Bridges between plain Rust types and the dynamic object graph.
//!
//! `#[derive(NbinType)]` implements these traits; they can also be written
//! by hand for types the derive cannot describe.

use std::fmt;
use std::marker::PhantomData;

use crate::error::{NbinError, Result};
use crate::graph::{InstanceId, Value};
use crate::types::{PrimitiveKind, RefType, TypeRef, ValueType};

/// A Rust type with a [`TypeDef`](crate::types::TypeDef).
pub trait NativeType {
    /// Fully qualified type name, as written into files.
    const TYPE_NAME: &'static str;

    /// The type declaration. Called often: implementations should cache it.
    fn type_def() -> TypeRef;
}

/// A Rust type storable in a field slot or an array element.
pub trait NativeValue: Sized {
    /// Storage type of the value.
    fn value_type() -> ValueType;

    /// Converts into a slot value.
    fn to_value(&self) -> Value;

    /// Converts back from a slot value.
    fn from_value(value: &Value) -> Result<Self>;
}

/// A Rust type mapped to a heap object.
pub trait NativeObject: NativeType + Sized {
    /// One value per declared field, in declaration order.
    fn to_values(&self) -> Vec<Value>;

    /// Rebuilds the object from its declared field values.
    fn from_values(values: &[Value]) -> Result<Self>;
}

/// The error for a slot holding the wrong kind of value.
pub(crate) fn unexpected(expected: &str, found: &Value) -> NbinError {
    NbinError::Format(format!("expected {expected}, found {}", found.kind_name()))
}

macro_rules! native_primitive {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl NativeValue for $ty {
                fn value_type() -> ValueType {
                    ValueType::Primitive(PrimitiveKind::$kind)
                }

                fn to_value(&self) -> Value {
                    Value::$kind(*self)
                }

                fn from_value(value: &Value) -> Result<Self> {
                    match value {
                        Value::$kind(v) => Ok(*v),
                        other => Err(unexpected(PrimitiveKind::$kind.name(), other)),
                    }
                }
            }
        )*
    };
}

native_primitive!(
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    bool => Boolean,
);

/// A typed, nullable reference to a heap object of type `T`.
pub struct Ref<T> {
    id: Option<InstanceId>,
    _target: PhantomData<fn() -> T>,
}

impl<T> Ref<T> {
    /// A reference to `id`.
    pub fn new(id: InstanceId) -> Self {
        Self::from_id(Some(id))
    }

    /// The null reference.
    pub fn null() -> Self {
        Self::from_id(None)
    }

    /// A reference to `id`, or null.
    pub fn from_id(id: Option<InstanceId>) -> Self {
        Self {
            id,
            _target: PhantomData,
        }
    }

    /// The target, or `None` for null.
    pub fn id(&self) -> Option<InstanceId> {
        self.id
    }

    /// True for the null reference.
    pub fn is_null(&self) -> bool {
        self.id.is_none()
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Ref<T> {}

impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Ref<T> {}

impl<T> Default for Ref<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "Ref({id})"),
            None => f.write_str("Ref(null)"),
        }
    }
}

impl<T: NativeType> NativeValue for Ref<T> {
    fn value_type() -> ValueType {
        ValueType::object(T::TYPE_NAME)
    }

    fn to_value(&self) -> Value {
        Value::Ref(self.id)
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Ref(id) => Ok(Self::from_id(*id)),
            other => Err(unexpected(T::TYPE_NAME, other)),
        }
    }
}

/// A nullable reference to an array whose elements are `E`.
pub struct ArrayRef<E> {
    id: Option<InstanceId>,
    _element: PhantomData<fn() -> E>,
}

impl<E> ArrayRef<E> {
    /// A reference to the array `id`.
    pub fn new(id: InstanceId) -> Self {
        Self::from_id(Some(id))
    }

    /// The null reference.
    pub fn null() -> Self {
        Self::from_id(None)
    }

    /// A reference to `id`, or null.
    pub fn from_id(id: Option<InstanceId>) -> Self {
        Self {
            id,
            _element: PhantomData,
        }
    }

    /// The target array, or `None` for null.
    pub fn id(&self) -> Option<InstanceId> {
        self.id
    }

    /// True for the null reference.
    pub fn is_null(&self) -> bool {
        self.id.is_none()
    }
}

impl<E> Clone for ArrayRef<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for ArrayRef<E> {}

impl<E> PartialEq for ArrayRef<E> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<E> Eq for ArrayRef<E> {}

impl<E> Default for ArrayRef<E> {
    fn default() -> Self {
        Self::null()
    }
}

impl<E> fmt::Debug for ArrayRef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "ArrayRef({id})"),
            None => f.write_str("ArrayRef(null)"),
        }
    }
}

impl<E: NativeValue> NativeValue for ArrayRef<E> {
    fn value_type() -> ValueType {
        ValueType::array_of(E::value_type())
    }

    fn to_value(&self) -> Value {
        Value::Ref(self.id)
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Ref(id) => Ok(Self::from_id(*id)),
            other => Err(unexpected("array reference", other)),
        }
    }
}

/// An untyped nullable reference, stored with the `object` target type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnyRef(pub Option<InstanceId>);

impl NativeValue for AnyRef {
    fn value_type() -> ValueType {
        ValueType::Reference(RefType::Any)
    }

    fn to_value(&self) -> Value {
        Value::Ref(self.0)
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Ref(id) => Ok(Self(*id)),
            other => Err(unexpected("reference", other)),
        }
    }
}
