#![allow(missing_docs)]

mod common;

use common::*;
use nbin::memory::{ByteOrder, HeapAllocation};
use nbin::{
    AnyRef, ArrayInstance, Heap, InstanceId, LayoutPlanner, Marshaller, Nbin, NbinError,
    TypeRegistry, Unmarshaller, Value,
};

/// A graph using every field kind: shared holder, a cycle through
/// `a_test_object`, and a reference array pointing back into the graph.
fn full_graph(rng: &mut fastrand::Rng) -> nbin::Result<(Heap, InstanceId)> {
    let mut heap = Heap::new();
    let with_arrays = create_test_object_with_arrays(&mut heap, rng)?;
    let to0 = create_test_object(&mut heap, rng, Some(with_arrays))?;
    let to1 = create_test_object(&mut heap, rng, Some(with_arrays))?;
    let to2 = create_test_object(&mut heap, rng, None)?;
    heap.set_field(to0, "a_test_object", Value::Ref(Some(to1)))?;
    heap.set_field(to1, "a_test_object", Value::Ref(Some(to0)))?;
    set_reference_array(&mut heap, with_arrays, &[to2, to0, with_arrays])?;
    Ok((heap, to0))
}

#[test]
fn in_memory_roundtrip() -> nbin::Result<()> {
    let mut rng = fastrand::Rng::with_seed(12345);
    let (heap, root) = full_graph(&mut rng)?;
    let registry = TypeRegistry::builder().catalog(catalog()).build();

    let layout = LayoutPlanner::new(&registry).create_layout(&heap, Some(root), None)?;
    let size = layout.size() as usize;
    let set = Marshaller::new(&registry).marshall(
        &heap,
        layout,
        Box::new(HeapAllocation::new(size)),
        None,
    )?;

    // Wipe every object, then read them back.
    let mut copy = heap.clone();
    for entry in set.layout().entries() {
        let id = entry.instance();
        if copy.object(id).is_ok() {
            let name = copy.object(id)?.ty().name().to_string();
            if name == <TestObject as nbin::NativeType>::TYPE_NAME {
                copy.replace(id, &TestObject::default())?;
            } else {
                copy.replace(id, &TestObjectWithArrays::default())?;
            }
        }
    }
    assert_ne!(copy.extract::<TestObject>(root)?, heap.extract::<TestObject>(root)?);

    let read_root = Unmarshaller::new(&registry).unmarshall(&mut copy, &set)?;
    assert_eq!(read_root, Some(root));
    assert_same_graph(&heap, root, &copy, root);
    set.release()?;
    Ok(())
}

#[test]
fn big_endian_region() -> nbin::Result<()> {
    let mut rng = fastrand::Rng::with_seed(12345);
    let (heap, root) = full_graph(&mut rng)?;
    let registry = TypeRegistry::builder().catalog(catalog()).build();

    let layout = LayoutPlanner::new(&registry).create_layout(&heap, Some(root), None)?;
    let size = layout.size() as usize;
    let allocation = HeapAllocation::new(size).with_order(ByteOrder::Big);
    let set = Marshaller::new(&registry).marshall(&heap, layout, Box::new(allocation), None)?;

    let expected = heap.extract::<TestObject>(root)?;
    let allocation = set.allocation()?;
    let slice = allocation.slice(0, 88)?;
    assert_eq!(slice.read_i32(12)?, expected.an_int);
    assert_eq!(slice.as_bytes()[12..16], expected.an_int.to_be_bytes());
    drop(allocation);

    let mut copy = heap.clone();
    copy.replace(root, &TestObject::default())?;
    Unmarshaller::new(&registry).unmarshall(&mut copy, &set)?;
    assert_same_graph(&heap, root, &copy, root);
    set.release()?;
    Ok(())
}

#[test]
fn bytes_roundtrip_preserves_topology() -> nbin::Result<()> {
    let mut rng = fastrand::Rng::with_seed(12345);
    let (heap, root) = full_graph(&mut rng)?;

    let mut bytes = Vec::new();
    let written = Nbin::write(&mut bytes, &heap, Some(root))?;
    assert_eq!(written, bytes.len() as u64);

    let mut file = Nbin::open_bytes(bytes, catalog())?;
    let read_root = file.unmarshall()?.ok_or_else(|| NbinError::Internal("no root".into()))?;
    assert_same_graph(&heap, root, file.heap(), read_root);
    assert_eq!(file.heap().len(), reachable(&heap, root));

    // Derived access on the read graph.
    let original: TestObject = heap.extract(root)?;
    let read: TestObject = file.heap().extract(read_root)?;
    assert_eq!(read.a_long, original.a_long);
    assert_eq!(read.a_struct, original.a_struct);
    assert_eq!(read.an_enum, original.an_enum);

    let holder_id = read
        .object_with_arrays
        .id()
        .ok_or_else(|| NbinError::Internal("null holder".into()))?;
    let holder: TestObjectWithArrays = file.heap().extract(holder_id)?;
    let structs: Vec<TestStruct> = file
        .heap()
        .array(holder.a_struct_array.id().ok_or(NbinError::NullStructElement)?)?
        .to_native()?;
    let original_holder: TestObjectWithArrays = heap.extract(
        original.object_with_arrays.id().ok_or(NbinError::NullStructElement)?,
    )?;
    let original_structs: Vec<TestStruct> = heap
        .array(original_holder.a_struct_array.id().ok_or(NbinError::NullStructElement)?)?
        .to_native()?;
    assert_eq!(structs, original_structs);

    let enums: Vec<TestEnum> = file
        .heap()
        .array(holder.an_enum_array.id().ok_or(NbinError::NullStructElement)?)?
        .to_native()?;
    assert_eq!(enums, vec![TestEnum::D, TestEnum::A, TestEnum::C, TestEnum::B, TestEnum::A]);

    // The reference array closes a loop on its own holder.
    let refs: Vec<AnyRef> = file
        .heap()
        .array(holder.a_reference_array.id().ok_or(NbinError::NullStructElement)?)?
        .to_native()?;
    assert_eq!(refs.len(), 3);
    assert_eq!(refs[1], AnyRef(Some(read_root)));
    assert_eq!(refs[2], AnyRef(Some(holder_id)));

    file.release()?;
    Ok(())
}

#[test]
fn native_enum_values_are_stored() -> nbin::Result<()> {
    let mut heap = Heap::new();
    let root = heap.insert(&TestObject {
        a_struct: TestStruct {
            an_int: 7,
            a_float: 1.5,
            a_native_enum: TestNativeEnum::D,
        },
        an_enum: TestEnum::C,
        ..TestObject::default()
    });
    let registry = TypeRegistry::builder().catalog(catalog()).build();
    let layout = LayoutPlanner::new(&registry).create_layout(&heap, Some(root), None)?;
    let set = Marshaller::new(&registry).marshall(
        &heap,
        layout,
        Box::new(HeapAllocation::new(88)),
        None,
    )?;
    {
        let allocation = set.allocation()?;
        let slice = allocation.slice(0, 88)?;
        // Plain enums store their ordinal.
        assert_eq!(slice.read_i32(44)?, 2);
        // The struct starts at 56: int, float, then the mapped enum value.
        assert_eq!(slice.read_i32(56)?, 7);
        assert_eq!(slice.read_f32(60)?, 1.5);
        assert_eq!(slice.read_i32(64)?, 42);
    }

    // An integer no constant maps to is rejected on read.
    set.allocation_mut()?.slice_mut(0, 88)?.write_i32(64, 43)?;
    let mut copy = heap.clone();
    let err = Unmarshaller::new(&registry)
        .unmarshall(&mut copy, &set)
        .unwrap_err();
    assert!(matches!(
        err.root_cause(),
        NbinError::UnresolvedEnumValue { value: 43, .. }
    ));
    assert!(err.path().is_some_and(|p| p.contains("a_native_enum")));
    set.release()?;
    Ok(())
}

#[test]
fn dangling_reference_is_reported_with_path() -> nbin::Result<()> {
    let mut heap = Heap::new();
    let root = heap.insert(&TestObject::default());
    let floats = heap.insert_array(ArrayInstance::Float(vec![1.0]));
    let registry = TypeRegistry::builder().catalog(catalog()).build();
    let layout = LayoutPlanner::new(&registry).create_layout(&heap, Some(root), None)?;

    // Point at an instance the layout never saw.
    heap.set_field(root, "a_float_array", Value::Ref(Some(floats)))?;
    let err = Marshaller::new(&registry)
        .marshall(&heap, layout, Box::new(HeapAllocation::new(88)), None)
        .unwrap_err();
    assert!(matches!(err.root_cause(), NbinError::MissingLayoutEntry(_)));
    assert!(err.path().is_some_and(|p| p.contains("a_float_array")));
    Ok(())
}

#[test]
fn null_root_writes_an_empty_region() -> nbin::Result<()> {
    let heap = Heap::new();
    let mut bytes = Vec::new();
    Nbin::write(&mut bytes, &heap, None)?;

    let mut file = Nbin::open_bytes(bytes, catalog())?;
    assert!(file.instance_set().layout().is_empty());
    assert_eq!(file.unmarshall()?, None);
    assert!(matches!(
        file.load::<TestObject>(),
        Err(NbinError::Format(_))
    ));
    file.release()?;
    Ok(())
}
