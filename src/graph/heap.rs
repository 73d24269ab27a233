use crate::error::{NbinError, Result};
use crate::graph::value::default_values;
use crate::graph::{InstanceId, StructValue, Value};
use crate::native::{NativeObject, NativeValue};
use crate::types::{PrimitiveKind, RefType, TypeRef, ValueType};

/// A heap object: its type and one value per declared field.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInstance {
    ty: TypeRef,
    values: Vec<Value>,
}

impl ObjectInstance {
    /// Wraps slot values. `values` must follow the declared fields of `ty`.
    pub fn new(ty: TypeRef, values: Vec<Value>) -> Self {
        Self { ty, values }
    }

    /// An object with every slot defaulted.
    pub fn default_of(ty: &TypeRef) -> Result<Self> {
        Ok(Self {
            ty: ty.clone(),
            values: default_values(ty)?,
        })
    }

    /// The object type.
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

    /// Replaces the value of a field, by name.
    pub fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        let slot = self.ty.slot_of(name).ok_or_else(|| {
            NbinError::UnresolvedTypeName(format!("{}#{name}", self.ty.name()))
        })?;
        let target = self.values.get_mut(slot).ok_or_else(|| {
            NbinError::Internal(format!("{} has no slot {slot}", self.ty.name()))
        })?;
        *target = value;
        Ok(())
    }
}

/// A heap array. The variant fixes the element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayInstance {
    /// `byte[]`
    Byte(Vec<i8>),
    /// `short[]`
    Short(Vec<i16>),
    /// `int[]`
    Int(Vec<i32>),
    /// `long[]`
    Long(Vec<i64>),
    /// `float[]`
    Float(Vec<f32>),
    /// `double[]`
    Double(Vec<f64>),
    /// `boolean[]`
    Boolean(Vec<bool>),
    /// Enum array, by ordinal.
    Enum {
        /// Enum type.
        ty: TypeRef,
        /// Constant ordinals.
        ordinals: Vec<u32>,
    },
    /// Struct array, packed inline. `None` is a null element.
    Struct {
        /// Struct type.
        ty: TypeRef,
        /// Elements.
        elements: Vec<Option<StructValue>>,
    },
    /// Array of references.
    Reference {
        /// Declared element target.
        element: RefType,
        /// Referenced instances.
        values: Vec<Option<InstanceId>>,
    },
}

impl ArrayInstance {
    /// A defaulted array of `len` elements of type `element`.
    pub fn with_len(element: &ValueType, len: usize) -> Result<Self> {
        Ok(match element {
            ValueType::Primitive(kind) => match kind {
                PrimitiveKind::Byte => Self::Byte(vec![0; len]),
                PrimitiveKind::Short => Self::Short(vec![0; len]),
                PrimitiveKind::Int => Self::Int(vec![0; len]),
                PrimitiveKind::Long => Self::Long(vec![0; len]),
                PrimitiveKind::Float => Self::Float(vec![0.0; len]),
                PrimitiveKind::Double => Self::Double(vec![0.0; len]),
                PrimitiveKind::Boolean => Self::Boolean(vec![false; len]),
            },
            ValueType::Enum(ty) => {
                if len > 0 && ty.constants().is_empty() {
                    return Err(NbinError::UnsupportedType(format!(
                        "{} has no constant to default to",
                        ty.name()
                    )));
                }
                Self::Enum {
                    ty: ty.clone(),
                    ordinals: vec![0; len],
                }
            }
            ValueType::Struct(ty) => {
                let element = StructValue::default_of(ty)?;
                Self::Struct {
                    ty: ty.clone(),
                    elements: vec![Some(element); len],
                }
            }
            ValueType::Reference(target) => Self::Reference {
                element: target.clone(),
                values: vec![None; len],
            },
        })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Self::Byte(v) => v.len(),
            Self::Short(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Long(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Double(v) => v.len(),
            Self::Boolean(v) => v.len(),
            Self::Enum { ordinals, .. } => ordinals.len(),
            Self::Struct { elements, .. } => elements.len(),
            Self::Reference { values, .. } => values.len(),
        }
    }

    /// True if the array has no element.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The element storage type.
    pub fn element_type(&self) -> ValueType {
        let primitive = |kind| ValueType::Primitive(kind);
        match self {
            Self::Byte(_) => primitive(PrimitiveKind::Byte),
            Self::Short(_) => primitive(PrimitiveKind::Short),
            Self::Int(_) => primitive(PrimitiveKind::Int),
            Self::Long(_) => primitive(PrimitiveKind::Long),
            Self::Float(_) => primitive(PrimitiveKind::Float),
            Self::Double(_) => primitive(PrimitiveKind::Double),
            Self::Boolean(_) => primitive(PrimitiveKind::Boolean),
            Self::Enum { ty, .. } => ValueType::Enum(ty.clone()),
            Self::Struct { ty, .. } => ValueType::Struct(ty.clone()),
            Self::Reference { element, .. } => ValueType::Reference(element.clone()),
        }
    }

    /// The element at `index` as a slot value. `None` when out of range or
    /// for a null struct element.
    pub fn element(&self, index: usize) -> Option<Value> {
        Some(match self {
            Self::Byte(v) => Value::Byte(*v.get(index)?),
            Self::Short(v) => Value::Short(*v.get(index)?),
            Self::Int(v) => Value::Int(*v.get(index)?),
            Self::Long(v) => Value::Long(*v.get(index)?),
            Self::Float(v) => Value::Float(*v.get(index)?),
            Self::Double(v) => Value::Double(*v.get(index)?),
            Self::Boolean(v) => Value::Boolean(*v.get(index)?),
            Self::Enum { ordinals, .. } => Value::Enum(*ordinals.get(index)?),
            Self::Struct { elements, .. } => Value::Struct(elements.get(index)?.clone()?),
            Self::Reference { values, .. } => Value::Ref(*values.get(index)?),
        })
    }

    /// Replaces the element at `index`. The value must match the element storage.
    pub fn set_element(&mut self, index: usize, value: Value) -> Result<()> {
        let len = self.len();
        let out_of_range = || NbinError::Format(format!("index {index} out of {len} elements"));
        match (self, value) {
            (Self::Byte(v), Value::Byte(x)) => *v.get_mut(index).ok_or_else(out_of_range)? = x,
            (Self::Short(v), Value::Short(x)) => *v.get_mut(index).ok_or_else(out_of_range)? = x,
            (Self::Int(v), Value::Int(x)) => *v.get_mut(index).ok_or_else(out_of_range)? = x,
            (Self::Long(v), Value::Long(x)) => *v.get_mut(index).ok_or_else(out_of_range)? = x,
            (Self::Float(v), Value::Float(x)) => *v.get_mut(index).ok_or_else(out_of_range)? = x,
            (Self::Double(v), Value::Double(x)) => *v.get_mut(index).ok_or_else(out_of_range)? = x,
            (Self::Boolean(v), Value::Boolean(x)) => {
                *v.get_mut(index).ok_or_else(out_of_range)? = x;
            }
            (Self::Enum { ty, ordinals }, Value::Enum(x)) => {
                if x as usize >= ty.constants().len() {
                    return Err(NbinError::UnresolvedEnumValue {
                        type_name: ty.name().to_string(),
                        value: i32::try_from(x).unwrap_or(i32::MAX),
                    });
                }
                *ordinals.get_mut(index).ok_or_else(out_of_range)? = x;
            }
            (Self::Struct { ty, elements }, Value::Struct(x)) if x.ty().name() == ty.name() => {
                *elements.get_mut(index).ok_or_else(out_of_range)? = Some(x);
            }
            (Self::Reference { values, .. }, Value::Ref(x)) => {
                *values.get_mut(index).ok_or_else(out_of_range)? = x;
            }
            (array, value) => {
                return Err(NbinError::Format(format!(
                    "cannot store {} in {}[]",
                    value.kind_name(),
                    array.element_type()
                )));
            }
        }
        Ok(())
    }

    /// An array holding `items`.
    pub fn from_native<E: NativeValue>(items: &[E]) -> Result<Self> {
        let mut array = Self::with_len(&E::value_type(), items.len())?;
        for (index, item) in items.iter().enumerate() {
            array.set_element(index, item.to_value())?;
        }
        Ok(array)
    }

    /// Converts every element back to `E`.
    pub fn to_native<E: NativeValue>(&self) -> Result<Vec<E>> {
        (0..self.len())
            .map(|index| {
                let value = self.element(index).ok_or(NbinError::NullStructElement)?;
                E::from_value(&value).map_err(|e| e.at(format!("{}[{index}]", self.element_type())))
            })
            .collect()
    }
}

/// A heap instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Instance {
    /// An object with fields.
    Object(ObjectInstance),
    /// An array.
    Array(ArrayInstance),
}

impl Instance {
    /// Name of the instance type, e.g. `demo::Node` or `int[]`.
    pub fn type_name(&self) -> String {
        match self {
            Self::Object(object) => object.ty().name().to_string(),
            Self::Array(array) => format!("{}[]", array.element_type()),
        }
    }
}

/// Arena owning every instance of an object graph.
///
/// Instances never move or disappear, so an [`InstanceId`] stays valid for the
/// lifetime of its heap. References between instances are ids, which is what
/// makes shared references and cycles plain data.
#[derive(Debug, Default, Clone)]
pub struct Heap {
    instances: Vec<Instance>,
}

impl Heap {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True if the heap holds nothing.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Adds an instance and returns its identity.
    pub fn add(&mut self, instance: Instance) -> InstanceId {
        let id = InstanceId::new(self.instances.len() as u32);
        self.instances.push(instance);
        id
    }

    /// Adds a default-constructed object of type `ty`.
    pub fn alloc_object(&mut self, ty: &TypeRef) -> Result<InstanceId> {
        Ok(self.add(Instance::Object(ObjectInstance::default_of(ty)?)))
    }

    /// Adds a default-constructed array.
    pub fn alloc_array(&mut self, element: &ValueType, len: usize) -> Result<InstanceId> {
        Ok(self.add(Instance::Array(ArrayInstance::with_len(element, len)?)))
    }

    /// Adds an array.
    pub fn insert_array(&mut self, array: ArrayInstance) -> InstanceId {
        self.add(Instance::Array(array))
    }

    /// Adds a derived Rust object.
    pub fn insert<T: NativeObject>(&mut self, object: &T) -> InstanceId {
        self.add(Instance::Object(ObjectInstance::new(
            T::type_def(),
            object.to_values(),
        )))
    }

    /// Overwrites the object at `id` with the values of `object`.
    pub fn replace<T: NativeObject>(&mut self, id: InstanceId, object: &T) -> Result<()> {
        let target = self.object_mut(id)?;
        if target.ty().name() != T::TYPE_NAME {
            return Err(type_mismatch(id, target.ty().name(), T::TYPE_NAME));
        }
        *target = ObjectInstance::new(T::type_def(), object.to_values());
        Ok(())
    }

    /// Rebuilds a derived Rust object from the instance at `id`.
    pub fn extract<T: NativeObject>(&self, id: InstanceId) -> Result<T> {
        let object = self.object(id)?;
        if object.ty().name() != T::TYPE_NAME {
            return Err(type_mismatch(id, object.ty().name(), T::TYPE_NAME));
        }
        T::from_values(object.values())
    }

    /// Borrows an instance.
    pub fn get(&self, id: InstanceId) -> Result<&Instance> {
        self.instances
            .get(id.index())
            .ok_or_else(|| NbinError::Internal(format!("no instance {id} in heap")))
    }

    /// Mutably borrows an instance.
    pub fn get_mut(&mut self, id: InstanceId) -> Result<&mut Instance> {
        self.instances
            .get_mut(id.index())
            .ok_or_else(|| NbinError::Internal(format!("no instance {id} in heap")))
    }

    /// Borrows an object instance.
    pub fn object(&self, id: InstanceId) -> Result<&ObjectInstance> {
        match self.get(id)? {
            Instance::Object(object) => Ok(object),
            Instance::Array(array) => Err(type_mismatch(
                id,
                &format!("{}[]", array.element_type()),
                "an object",
            )),
        }
    }

    /// Mutably borrows an object instance.
    pub fn object_mut(&mut self, id: InstanceId) -> Result<&mut ObjectInstance> {
        match self.get_mut(id)? {
            Instance::Object(object) => Ok(object),
            Instance::Array(array) => Err(type_mismatch(
                id,
                &format!("{}[]", array.element_type()),
                "an object",
            )),
        }
    }

    /// Borrows an array instance.
    pub fn array(&self, id: InstanceId) -> Result<&ArrayInstance> {
        match self.get(id)? {
            Instance::Array(array) => Ok(array),
            Instance::Object(object) => Err(type_mismatch(id, object.ty().name(), "an array")),
        }
    }

    /// Mutably borrows an array instance.
    pub fn array_mut(&mut self, id: InstanceId) -> Result<&mut ArrayInstance> {
        match self.get_mut(id)? {
            Instance::Array(array) => Ok(array),
            Instance::Object(object) => Err(type_mismatch(id, object.ty().name(), "an array")),
        }
    }

    /// Reads a field of the object at `id`.
    pub fn field(&self, id: InstanceId, name: &str) -> Result<&Value> {
        let object = self.object(id)?;
        object.field(name).ok_or_else(|| {
            NbinError::UnresolvedTypeName(format!("{}#{name}", object.ty().name()))
        })
    }

    /// Writes a field of the object at `id`.
    pub fn set_field(&mut self, id: InstanceId, name: &str, value: Value) -> Result<()> {
        self.object_mut(id)?.set_field(name, value)
    }

    /// Iterates over every instance with its id.
    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, &Instance)> {
        self.instances
            .iter()
            .enumerate()
            .map(|(index, instance)| (InstanceId::new(index as u32), instance))
    }
}

fn type_mismatch(id: InstanceId, actual: &str, expected: &str) -> NbinError {
    NbinError::Format(format!("instance {id} is {actual}, not {expected}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldDef, TypeDef};

    fn node() -> TypeRef {
        TypeDef::object("demo::Node")
            .field(FieldDef::new("value", ValueType::Primitive(PrimitiveKind::Int)))
            .field(FieldDef::new("next", ValueType::object("demo::Node")))
            .build()
    }

    #[test]
    fn ids_are_identity() -> Result<()> {
        let mut heap = Heap::new();
        let ty = node();
        let a = heap.alloc_object(&ty)?;
        let b = heap.alloc_object(&ty)?;
        assert_ne!(a, b);
        assert_eq!(heap.get(a)?, heap.get(b)?);
        Ok(())
    }

    #[test]
    fn cycles_are_plain_ids() -> Result<()> {
        let mut heap = Heap::new();
        let ty = node();
        let a = heap.alloc_object(&ty)?;
        let b = heap.alloc_object(&ty)?;
        heap.set_field(a, "next", Value::Ref(Some(b)))?;
        heap.set_field(b, "next", Value::Ref(Some(a)))?;
        assert_eq!(heap.field(a, "next")?.as_ref_id(), Some(b));
        assert_eq!(heap.field(b, "next")?.as_ref_id(), Some(a));
        assert!(heap.set_field(a, "missing", Value::Int(1)).is_err());
        Ok(())
    }

    #[test]
    fn arrays_default_by_element() -> Result<()> {
        let mut heap = Heap::new();
        let doubles = heap.alloc_array(&ValueType::Primitive(PrimitiveKind::Double), 3)?;
        assert_eq!(heap.array(doubles)?, &ArrayInstance::Double(vec![0.0; 3]));
        let refs = heap.alloc_array(&ValueType::object("demo::Node"), 2)?;
        assert_eq!(heap.array(refs)?.len(), 2);
        assert_eq!(
            heap.get(refs)?.type_name(),
            "demo::Node[]".to_string()
        );
        assert!(heap.object(refs).is_err());
        Ok(())
    }
}
