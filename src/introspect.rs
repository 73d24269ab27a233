//! Field introspection strategies.
//!
//! The registry never looks at a [`TypeDef`] directly: it asks a
//! [`TypeIntrospector`] for the ordered list of fields that take part in the
//! native layout. The slot index travels with each field so that the
//! marshaller can find the field's value in an
//! [`ObjectInstance`](crate::graph::ObjectInstance).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::types::{FieldDef, FieldModifiers, TypeDef};

/// A field selected for layout, with its value slot in the owning instance.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSlot {
    /// Index into [`ObjectInstance::values`](crate::graph::ObjectInstance) / [`StructValue`](crate::graph::StructValue).
    pub slot: usize,
    /// The declared field.
    pub field: FieldDef,
}

/// Strategy returning the stable, ordered field list of a type.
pub trait TypeIntrospector: Send + Sync + fmt::Debug {
    /// Returns the fields of `ty` that are laid out, in layout order.
    fn fields(&self, ty: &TypeDef) -> Vec<FieldSlot>;
}

/// Default strategy: supertype fields first, then own fields in declaration
/// order. Static, transient and immutable fields are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredOrder;

impl DeclaredOrder {
    const EXCLUDED: FieldModifiers = FieldModifiers::STATIC
        .union(FieldModifiers::TRANSIENT)
        .union(FieldModifiers::IMMUTABLE);
}

impl TypeIntrospector for DeclaredOrder {
    fn fields(&self, ty: &TypeDef) -> Vec<FieldSlot> {
        ty.declared_fields()
            .into_iter()
            .filter(|(_, f)| !f.field_modifiers().intersects(Self::EXCLUDED))
            .map(|(slot, f)| FieldSlot {
                slot,
                field: f.clone(),
            })
            .collect()
    }
}

/// Keeps only the fields carrying an explicit order hint, sorted by it.
///
/// Ties keep declaration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeOrder;

impl TypeIntrospector for NativeOrder {
    fn fields(&self, ty: &TypeDef) -> Vec<FieldSlot> {
        let mut fields: Vec<(i32, FieldSlot)> = ty
            .declared_fields()
            .into_iter()
            .filter_map(|(slot, f)| {
                f.order_hint().map(|order| {
                    (
                        order,
                        FieldSlot {
                            slot,
                            field: f.clone(),
                        },
                    )
                })
            })
            .collect();
        fields.sort_by_key(|(order, _)| *order);
        fields.into_iter().map(|(_, f)| f).collect()
    }
}

/// Memoizes another strategy per type name.
#[derive(Debug)]
pub struct CachingIntrospector<I> {
    delegate: I,
    cache: Mutex<HashMap<String, Arc<Vec<FieldSlot>>>>,
}

impl<I: TypeIntrospector> CachingIntrospector<I> {
    /// Wraps `delegate`.
    pub fn new(delegate: I) -> Self {
        Self {
            delegate,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of memoized types.
    pub fn cached(&self) -> usize {
        self.cache.lock().map_or(0, |c| c.len())
    }
}

impl<I: TypeIntrospector> TypeIntrospector for CachingIntrospector<I> {
    fn fields(&self, ty: &TypeDef) -> Vec<FieldSlot> {
        // A poisoned cache only loses memoization.
        let Ok(mut cache) = self.cache.lock() else {
            return self.delegate.fields(ty);
        };
        if let Some(hit) = cache.get(ty.name()) {
            return hit.as_ref().clone();
        }
        let fields = Arc::new(self.delegate.fields(ty));
        cache.insert(ty.name().to_string(), fields.clone());
        fields.as_ref().clone()
    }
}

impl<T: TypeIntrospector + ?Sized> TypeIntrospector for Arc<T> {
    fn fields(&self, ty: &TypeDef) -> Vec<FieldSlot> {
        self.as_ref().fields(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PrimitiveKind, ValueType};

    fn int() -> ValueType {
        ValueType::Primitive(PrimitiveKind::Int)
    }

    fn sample() -> crate::types::TypeRef {
        let base = TypeDef::object("demo::Base")
            .field(FieldDef::new("a", int()).order(3))
            .field(FieldDef::new("cache", int()).transient())
            .build();
        TypeDef::object("demo::Sample")
            .extends(base)
            .field(FieldDef::new("b", int()).order(1))
            .field(FieldDef::new("c", int()))
            .field(FieldDef::new("COUNT", int()).modifiers(FieldModifiers::STATIC))
            .field(FieldDef::new("d", int()).order(1))
            .build()
    }

    fn names(fields: &[FieldSlot]) -> Vec<(usize, &str)> {
        fields.iter().map(|f| (f.slot, f.field.name())).collect()
    }

    #[test]
    fn declared_order_skips_modifiers() {
        let fields = DeclaredOrder.fields(&sample());
        assert_eq!(names(&fields), vec![(0, "a"), (2, "b"), (3, "c"), (5, "d")]);
    }

    #[test]
    fn native_order_sorts_by_hint() {
        let fields = NativeOrder.fields(&sample());
        assert_eq!(names(&fields), vec![(2, "b"), (5, "d"), (0, "a")]);
    }

    #[test]
    fn caching_memoizes_by_name() {
        let introspector = CachingIntrospector::new(DeclaredOrder);
        let ty = sample();
        let first = introspector.fields(&ty);
        let second = introspector.fields(&ty);
        assert_eq!(first, second);
        assert_eq!(introspector.cached(), 1);
    }
}
