//! # nbin
//!
//! Deterministic, C-compatible memory layouts for object graphs, and a
//! self-describing binary container to persist them.
//!
//! ## Overview
//!
//! nbin takes an object graph (objects, arrays, inline structs and enums,
//! with shared references and cycles) and lays it out into a flat byte
//! region where every reference is an 8 byte address. The region can live
//! in an owned buffer, in a memory-mapped file, or at a declared native
//! address, so that native code can walk the same graph. Reading the region
//! back rebuilds the graph with its pointer topology intact: two references
//! to the same instance come back as the same instance.
//!
//! ### Key Features
//!
//! *   **Deterministic Layout:** entries are placed in depth-first discovery
//!     order, each at the next aligned offset. Fields follow C struct rules:
//!     every field aligned to its own size, the whole padded to its widest
//!     member.
//! *   **Shared References and Cycles:** an instance gets one entry no matter
//!     how many references point at it.
//! *   **Nested Instance Sets:** a child set resolves addresses of instances
//!     already placed in its ancestors, so graphs can be marshalled in
//!     increments.
//! *   **Self-Describing Files:** an nbin file carries its type table, so a
//!     reader checks it against its own declarations and the inspector can
//!     show a file without knowing its types.
//!
//! ## Architecture
//!
//! ### The Graph Model
//!
//! Instances live in a [`Heap`] arena and refer to each other through
//! [`InstanceId`]s. Each object holds one [`Value`] per declared field of its
//! [`types::TypeDef`].
//!
//! ### Registry and Layout
//!
//! The [`TypeRegistry`] derives a [`registry::TypeDescriptor`] (size,
//! alignment, field offsets, type id) for each type on first use. The
//! [`LayoutPlanner`] walks a graph from its root and produces a [`Layout`]:
//! the offset and size of every reachable instance.
//!
//! ### Memory
//!
//! A [`memory::MemoryAllocation`] is a byte region with a base address and a
//! byte order. An [`InstanceSet`] binds a layout to an allocation; the
//! [`Marshaller`] writes into it and the [`Unmarshaller`] reads from it.
//!
//! ### File Format
//!
//! ```text
//! [Magic "NBIN"] [Type Table] [Layout Table] [i64 Region Size] [Instance Region]
//! ```
//!
//! See [`format`] for the exact records.
//!
//! ## Usage Patterns
//!
//! ```no_run
//! use nbin::{ArrayRef, Heap, Nbin, NbinType, Ref, TypeCatalog};
//!
//! #[derive(NbinType, Debug, Default)]
//! struct Node {
//!     value: i32,
//!     next: Ref<Node>,
//!     data: ArrayRef<f64>,
//! }
//!
//! # fn main() -> nbin::Result<()> {
//! let mut heap = Heap::new();
//! let tail = heap.insert(&Node::default());
//! let head = heap.insert(&Node { value: 1, next: Ref::new(tail), ..Default::default() });
//! Nbin::save("graph.nbin", &heap, Some(head))?;
//!
//! let mut catalog = TypeCatalog::new();
//! catalog.register_type::<Node>();
//! let mut file = Nbin::open("graph.nbin", catalog)?;
//! let node: Node = file.load()?;
//! assert_eq!(node.value, 1);
//! file.release()?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Safety and Error Handling
//!
//! * **Encapsulated Unsafe:** `unsafe` is limited to the two memory-mapping
//!   calls of [`memory::MappedAllocation`].
//! * **No Panics:** No `unwrap()` or `panic!()` calls in the library (enforced by clippy lints).
//! * **Comprehensive Errors:** All failures correspond to a [`NbinError`] type;
//!   transcoding failures carry the path of the field being processed.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::panic))]

// --- PUBLIC API MODULES ---
pub mod api;
pub mod error;
pub mod format;
pub mod graph;
pub mod inspector;
pub mod instances;
pub mod introspect;
pub mod layout;
pub mod marshal;
pub mod memory;
pub mod native;
pub mod path;
pub mod reader;
pub mod registry;
pub mod types;
pub mod unmarshal;

// --- INTERNAL IMPLEMENTATION MODULES (Hidden from Docs) ---
#[doc(hidden)]
pub mod io;

// --- MACRO SUPPORT MODULES ---

/// Runtime utilities used by the derived code.
#[doc(hidden)]
pub mod rt;

// --- RE-EXPORTS ---

pub use api::{Nbin, NbinWriter};
pub use error::{NbinError, Result};
pub use graph::{ArrayInstance, Heap, Instance, InstanceId, ObjectInstance, StructValue, Value};
pub use inspector::{DebugReport, NbinInspector};
pub use instances::InstanceSet;
pub use layout::{Layout, LayoutEntry, LayoutPlanner};
pub use marshal::Marshaller;
pub use native::{AnyRef, ArrayRef, NativeObject, NativeType, NativeValue, Ref};
pub use reader::{NbinFile, NbinReader};
pub use registry::TypeRegistry;
pub use types::{TypeCatalog, TypeDef, ValueType};
pub use unmarshal::Unmarshaller;

// Re-export the derive macro so it is accessible as `nbin::NbinType`
pub use nbin_derive::NbinType;
