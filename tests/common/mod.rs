#![allow(dead_code)]

use std::collections::{HashMap, HashSet};

use nbin::graph::StructValue;
use nbin::{
    AnyRef, ArrayInstance, ArrayRef, Heap, Instance, InstanceId, NativeType, NativeValue, NbinType,
    Ref, TypeCatalog, Value,
};

#[derive(NbinType, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestEnum {
    A,
    #[default]
    B,
    C,
    D,
}

#[derive(NbinType, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestNativeEnum {
    #[nbin(value = 5)]
    A,
    #[nbin(value = 10)]
    B,
    #[default]
    #[nbin(value = 20)]
    C,
    #[nbin(value = 42)]
    D,
}

// alignment 4 size 12
#[derive(NbinType, Debug, Clone, PartialEq, Default)]
#[nbin(kind = "struct")]
pub struct TestStruct {
    #[nbin(order = 0)]
    pub an_int: i32,
    #[nbin(order = 2)]
    pub a_float: f32,
    #[nbin(order = 3)]
    pub a_native_enum: TestNativeEnum,
}

// alignment 8 size 88, type tag included
#[derive(NbinType, Debug, Clone, PartialEq, Default)]
pub struct TestObject {
    #[nbin(order = 1)]
    pub a_byte: i8,
    #[nbin(order = 2)]
    pub a_short: i16,
    #[nbin(order = 3)]
    pub an_int: i32,
    #[nbin(order = 4)]
    pub a_long: i64,
    #[nbin(order = 5)]
    pub a_float: f32,
    #[nbin(order = 6)]
    pub a_double: f64,
    #[nbin(order = 7)]
    pub a_boolean: bool,
    #[nbin(order = 8)]
    pub an_enum: TestEnum,
    #[nbin(order = 9)]
    pub a_float_array: ArrayRef<f32>,
    #[nbin(order = 10)]
    pub a_struct: TestStruct,
    #[nbin(order = 11)]
    pub object_with_arrays: Ref<TestObjectWithArrays>,
    #[nbin(order = 12)]
    pub a_test_object: Ref<TestObject>,
}

// alignment 8 size 88, type tag included
#[derive(NbinType, Debug, Clone, PartialEq, Default)]
pub struct TestObjectWithArrays {
    #[nbin(order = 0)]
    pub a_byte_array: ArrayRef<i8>,
    #[nbin(order = 1)]
    pub a_short_array: ArrayRef<i16>,
    #[nbin(order = 2)]
    pub an_int_array: ArrayRef<i32>,
    #[nbin(order = 3)]
    pub a_long_array: ArrayRef<i64>,
    #[nbin(order = 4)]
    pub a_float_array: ArrayRef<f32>,
    #[nbin(order = 5)]
    pub a_double_array: ArrayRef<f64>,
    #[nbin(order = 6)]
    pub a_boolean_array: ArrayRef<bool>,
    #[nbin(order = 7)]
    pub an_enum_array: ArrayRef<TestEnum>,
    #[nbin(order = 8)]
    pub a_struct_array: ArrayRef<TestStruct>,
    #[nbin(order = 9)]
    pub a_reference_array: ArrayRef<AnyRef>,
}

/// Every test type, as a reader needs them.
pub fn catalog() -> TypeCatalog {
    let mut catalog = TypeCatalog::new();
    catalog
        .register_type::<TestObject>()
        .register_type::<TestObjectWithArrays>();
    catalog
}

pub fn random_struct(rng: &mut fastrand::Rng) -> TestStruct {
    TestStruct {
        an_int: rng.i32(..),
        a_float: rng.f32(),
        a_native_enum: [
            TestNativeEnum::A,
            TestNativeEnum::B,
            TestNativeEnum::C,
            TestNativeEnum::D,
        ][rng.usize(..4)],
    }
}

pub fn random_object(rng: &mut fastrand::Rng) -> TestObject {
    TestObject {
        a_byte: rng.i8(..),
        a_short: rng.i16(..),
        an_int: rng.i32(..),
        a_long: rng.i64(..),
        a_float: rng.f32(),
        a_double: rng.f64(),
        a_boolean: rng.bool(),
        an_enum: [TestEnum::A, TestEnum::B, TestEnum::C, TestEnum::D][rng.usize(..4)],
        a_struct: random_struct(rng),
        ..TestObject::default()
    }
}

/// A test object owning a float array of 10, pointing at `with_arrays`.
pub fn create_test_object(
    heap: &mut Heap,
    rng: &mut fastrand::Rng,
    with_arrays: Option<InstanceId>,
) -> nbin::Result<InstanceId> {
    let floats: Vec<f32> = (0..10).map(|_| rng.f32()).collect();
    let floats = heap.insert_array(ArrayInstance::from_native(&floats)?);
    Ok(heap.insert(&TestObject {
        a_float_array: ArrayRef::new(floats),
        object_with_arrays: Ref::from_id(with_arrays),
        ..random_object(rng)
    }))
}

/// A holder of one array of 5 per element kind. The reference array is left null.
pub fn create_test_object_with_arrays(
    heap: &mut Heap,
    rng: &mut fastrand::Rng,
) -> nbin::Result<InstanceId> {
    const LEN: usize = 5;
    let bytes: Vec<i8> = (0..LEN).map(|_| rng.i8(..)).collect();
    let shorts: Vec<i16> = (0..LEN).map(|_| rng.i16(..)).collect();
    let ints: Vec<i32> = (0..LEN).map(|_| rng.i32(..)).collect();
    let longs: Vec<i64> = (0..LEN).map(|_| rng.i64(..)).collect();
    let floats: Vec<f32> = (0..LEN).map(|_| rng.f32()).collect();
    let doubles: Vec<f64> = (0..LEN).map(|_| rng.f64()).collect();
    let booleans: Vec<bool> = (0..LEN).map(|_| rng.bool()).collect();
    let enums = vec![TestEnum::D, TestEnum::A, TestEnum::C, TestEnum::B, TestEnum::A];
    let structs: Vec<TestStruct> = (0..LEN).map(|_| random_struct(rng)).collect();

    let holder = TestObjectWithArrays {
        a_byte_array: ArrayRef::new(heap.insert_array(ArrayInstance::from_native(&bytes)?)),
        a_short_array: ArrayRef::new(heap.insert_array(ArrayInstance::from_native(&shorts)?)),
        an_int_array: ArrayRef::new(heap.insert_array(ArrayInstance::from_native(&ints)?)),
        a_long_array: ArrayRef::new(heap.insert_array(ArrayInstance::from_native(&longs)?)),
        a_float_array: ArrayRef::new(heap.insert_array(ArrayInstance::from_native(&floats)?)),
        a_double_array: ArrayRef::new(heap.insert_array(ArrayInstance::from_native(&doubles)?)),
        a_boolean_array: ArrayRef::new(heap.insert_array(ArrayInstance::from_native(&booleans)?)),
        an_enum_array: ArrayRef::new(heap.insert_array(ArrayInstance::from_native(&enums)?)),
        a_struct_array: ArrayRef::new(heap.insert_array(ArrayInstance::from_native(&structs)?)),
        a_reference_array: ArrayRef::null(),
    };
    Ok(heap.insert(&holder))
}

/// Points the reference array of `holder` at `targets`.
pub fn set_reference_array(
    heap: &mut Heap,
    holder: InstanceId,
    targets: &[InstanceId],
) -> nbin::Result<InstanceId> {
    let refs: Vec<AnyRef> = targets.iter().map(|&id| AnyRef(Some(id))).collect();
    let array = heap.insert_array(ArrayInstance::from_native(&refs)?);
    heap.set_field(holder, "a_reference_array", Value::Ref(Some(array)))?;
    Ok(array)
}

/// Unwraps the struct value of a derived struct.
pub fn struct_value(value: &TestStruct) -> StructValue {
    match value.to_value() {
        Value::Struct(inner) => inner,
        other => panic!("{} is not a struct: {other:?}", TestStruct::TYPE_NAME),
    }
}

/// Walks two graphs side by side and checks they hold the same values and
/// the same pointer topology: every instance on the left maps to exactly
/// one instance on the right, and the other way around.
pub fn assert_same_graph(left: &Heap, left_root: InstanceId, right: &Heap, right_root: InstanceId) {
    let mut mapping: HashMap<InstanceId, InstanceId> = HashMap::new();
    let mut pending = vec![(left_root, right_root)];
    while let Some((l, r)) = pending.pop() {
        if let Some(&seen) = mapping.get(&l) {
            assert_eq!(seen, r, "{l} is reached as two different instances");
            continue;
        }
        mapping.insert(l, r);
        match (left.get(l).unwrap(), right.get(r).unwrap()) {
            (Instance::Object(a), Instance::Object(b)) => {
                assert_eq!(a.ty().name(), b.ty().name());
                assert_eq!(a.values().len(), b.values().len());
                for (va, vb) in a.values().iter().zip(b.values()) {
                    same_value(va, vb, &mut pending);
                }
            }
            (Instance::Array(a), Instance::Array(b)) => {
                assert_eq!(a.len(), b.len(), "length of {l}");
                for index in 0..a.len() {
                    match (a.element(index), b.element(index)) {
                        (Some(va), Some(vb)) => same_value(&va, &vb, &mut pending),
                        (None, None) => {}
                        (va, vb) => panic!("{l}[{index}]: {va:?} vs {vb:?}"),
                    }
                }
            }
            (a, b) => panic!("{l} is {} but {r} is {}", a.type_name(), b.type_name()),
        }
    }
    let distinct: HashSet<_> = mapping.values().collect();
    assert_eq!(distinct.len(), mapping.len(), "two instances collapsed into one");
}

fn same_value(a: &Value, b: &Value, pending: &mut Vec<(InstanceId, InstanceId)>) {
    match (a, b) {
        (Value::Ref(Some(x)), Value::Ref(Some(y))) => pending.push((*x, *y)),
        (Value::Struct(x), Value::Struct(y)) => {
            assert_eq!(x.ty().name(), y.ty().name());
            for (vx, vy) in x.values().iter().zip(y.values()) {
                same_value(vx, vy, pending);
            }
        }
        _ => assert_eq!(a, b),
    }
}

/// Number of instances reachable from `root`.
pub fn reachable(heap: &Heap, root: InstanceId) -> usize {
    let mut seen = HashSet::new();
    let mut pending = vec![root];
    while let Some(id) = pending.pop() {
        if !seen.insert(id) {
            continue;
        }
        match heap.get(id).unwrap() {
            Instance::Object(object) => {
                collect_refs(object.values(), &mut pending);
            }
            Instance::Array(array) => {
                let values: Vec<Value> = (0..array.len()).filter_map(|i| array.element(i)).collect();
                collect_refs(&values, &mut pending);
            }
        }
    }
    seen.len()
}

fn collect_refs(values: &[Value], out: &mut Vec<InstanceId>) {
    for value in values {
        match value {
            Value::Ref(Some(id)) => out.push(*id),
            Value::Struct(inner) => collect_refs(inner.values(), out),
            _ => {}
        }
    }
}
