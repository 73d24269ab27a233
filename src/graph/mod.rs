//! The in-memory object graph.
//!
//! Instances live in a [`Heap`] arena and point to each other through
//! [`InstanceId`]s, never through Rust references, so shared references and
//! cycles need no special ownership handling.

/// Defines the `InstanceFactory` hook used on read.
pub mod factory;
/// Defines the `Heap`, `Instance`, `ObjectInstance` and `ArrayInstance` structures.
pub mod heap;
/// Defines the `InstanceId` type.
pub mod id;
/// Defines the `Value` and `StructValue` types.
pub mod value;

pub use factory::{DefaultFactory, InstanceFactory};
pub use heap::{ArrayInstance, Heap, Instance, ObjectInstance};
pub use id::InstanceId;
pub use value::{StructValue, Value};
