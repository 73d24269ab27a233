//! Instance sets: a [`Layout`] bound to the [`MemoryAllocation`] holding it.
//!
//! Sets form a tree. A child set sees every instance and address of its
//! ancestors (so a graph marshalled as a child can point into its parent's
//! memory), never the other way around.
//!
//! Lifetimes are checked, not cascaded: releasing a set that still has open
//! children fails with [`NbinError::ResourceState`], and the set stays open.
//!
//! ## Addresses
//!
//! A set over a [`BaseAddress::Real`] allocation encodes an instance at
//! offset `o` as `base + o`. A virtual set gets a window of virtual
//! addresses instead: [`VIRTUAL_ORIGIN`] for a root set, or right after the
//! highest address used by any of its ancestors, real or virtual, for a
//! child set. A real child whose window overlaps an ancestor's is rejected,
//! so an address names one entry in the whole chain. Address 0 is always
//! null.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{NbinError, Result};
use crate::graph::InstanceId;
use crate::layout::{Layout, LayoutEntry};
use crate::memory::{BaseAddress, MemoryAllocation, VIRTUAL_ORIGIN};
use crate::registry::align_up;

static NEXT_SET_ID: AtomicU64 = AtomicU64::new(0);

struct SetInner {
    id: u64,
    layout: Layout,
    allocation: RefCell<Box<dyn MemoryAllocation>>,
    base: BaseAddress,
    origin: u64,
    parent: Option<InstanceSet>,
    children: Cell<usize>,
    released: Cell<bool>,
}

impl Drop for SetInner {
    fn drop(&mut self) {
        if self.released.get() {
            return;
        }
        log::warn!(
            "instance set {} dropped without release ({} entries)",
            self.id,
            self.layout.len()
        );
        if let Err(e) = self.allocation.get_mut().release() {
            log::warn!("releasing allocation of instance set {} failed: {e}", self.id);
        }
        if let Some(parent) = &self.parent {
            parent.detach_child();
        }
    }
}

/// A layout bound to its allocation, optionally nested under a parent.
///
/// This is a cheap, clonable handle; all clones designate the same set.
#[derive(Clone)]
pub struct InstanceSet {
    inner: Rc<SetInner>,
}

impl fmt::Debug for InstanceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceSet")
            .field("id", &self.inner.id)
            .field("entries", &self.inner.layout.len())
            .field("base", &self.inner.base)
            .field("origin", &self.inner.origin)
            .field("children", &self.inner.children.get())
            .field("released", &self.inner.released.get())
            .finish()
    }
}

impl InstanceSet {
    /// Binds a layout to an allocation, as a root set.
    pub fn new(layout: Layout, allocation: Box<dyn MemoryAllocation>) -> Result<Self> {
        Self::build(layout, allocation, None)
    }

    /// Creates a set nested under `self`.
    pub fn create_child(
        &self,
        layout: Layout,
        allocation: Box<dyn MemoryAllocation>,
    ) -> Result<InstanceSet> {
        if self.is_released() {
            return Err(NbinError::ResourceState(format!(
                "instance set {} is released",
                self.inner.id
            )));
        }
        let child = Self::build(layout, allocation, Some(self.clone()))?;
        self.inner.children.set(self.inner.children.get() + 1);
        Ok(child)
    }

    fn build(
        layout: Layout,
        allocation: Box<dyn MemoryAllocation>,
        parent: Option<InstanceSet>,
    ) -> Result<Self> {
        if allocation.len() < layout.size() {
            return Err(NbinError::ResourceState(format!(
                "allocation of {} bytes is too small for a layout of {} bytes",
                allocation.len(),
                layout.size()
            )));
        }
        let base = allocation.base_address();
        let origin = match base {
            BaseAddress::Real(address) => address,
            BaseAddress::Virtual => parent.as_ref().map_or(VIRTUAL_ORIGIN, |p| {
                align_up(p.address_end(), u64::from(layout.alignment()))
            }),
        };
        if let Some(parent) = &parent {
            let end = origin.saturating_add(layout.size());
            if let Some(owner) = parent.ancestry().find(|set| set.overlaps(origin, end)) {
                return Err(NbinError::ResourceState(format!(
                    "addresses {origin:#x}..{end:#x} overlap instance set {} at {:#x}..{:#x}",
                    owner.inner.id,
                    owner.inner.origin,
                    owner.window_end()
                )));
            }
        }
        Ok(Self {
            inner: Rc::new(SetInner {
                id: NEXT_SET_ID.fetch_add(1, Ordering::Relaxed),
                layout,
                allocation: RefCell::new(allocation),
                base,
                origin,
                parent,
                children: Cell::new(0),
                released: Cell::new(false),
            }),
        })
    }

    fn window_end(&self) -> u64 {
        self.inner.origin.saturating_add(self.inner.layout.size())
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        let own_end = self.window_end();
        start < end && self.inner.origin < own_end && start < own_end && self.inner.origin < end
    }

    /// Highest address used by this set and its ancestors, plus one.
    fn address_end(&self) -> u64 {
        self.ancestry()
            .map(InstanceSet::window_end)
            .fold(VIRTUAL_ORIGIN, u64::max)
    }

    /// Releases the allocation and detaches from the parent.
    ///
    /// Fails with [`NbinError::ResourceState`] while children are open.
    /// Releasing twice is a no-op.
    pub fn release(&self) -> Result<()> {
        if self.inner.released.get() {
            return Ok(());
        }
        let children = self.inner.children.get();
        if children > 0 {
            return Err(NbinError::ResourceState(format!(
                "instance set {} still has {children} open children",
                self.inner.id
            )));
        }
        self.allocation_mut()?.release()?;
        self.inner.released.set(true);
        if let Some(parent) = &self.inner.parent {
            parent.detach_child();
        }
        log::debug!("released instance set {}", self.inner.id);
        Ok(())
    }

    fn detach_child(&self) {
        self.inner
            .children
            .set(self.inner.children.get().saturating_sub(1));
    }

    /// True once released.
    pub fn is_released(&self) -> bool {
        self.inner.released.get()
    }

    /// Unique id of the set, stable for its lifetime.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The layout.
    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// The parent set.
    pub fn parent(&self) -> Option<&InstanceSet> {
        self.inner.parent.as_ref()
    }

    /// Number of open children.
    pub fn children(&self) -> usize {
        self.inner.children.get()
    }

    /// Where the allocation lives.
    pub fn base_address(&self) -> BaseAddress {
        self.inner.base
    }

    /// Address of offset 0 of this set.
    pub fn origin(&self) -> u64 {
        self.inner.origin
    }

    /// Borrows the allocation.
    pub fn allocation(&self) -> Result<std::cell::Ref<'_, Box<dyn MemoryAllocation>>> {
        self.inner.allocation.try_borrow().map_err(|_| {
            NbinError::ResourceState(format!(
                "allocation of instance set {} is being written",
                self.inner.id
            ))
        })
    }

    /// Mutably borrows the allocation.
    pub fn allocation_mut(&self) -> Result<std::cell::RefMut<'_, Box<dyn MemoryAllocation>>> {
        self.inner.allocation.try_borrow_mut().map_err(|_| {
            NbinError::ResourceState(format!(
                "allocation of instance set {} is in use",
                self.inner.id
            ))
        })
    }

    fn ancestry(&self) -> impl Iterator<Item = &InstanceSet> {
        std::iter::successors(Some(self), |set| set.parent())
    }

    /// True if the instance is placed in this set or an ancestor.
    pub fn contains(&self, instance: InstanceId) -> bool {
        self.ancestry().any(|set| set.inner.layout.contains(instance))
    }

    /// The set owning the instance, and its entry.
    pub fn locate(&self, instance: InstanceId) -> Option<(&InstanceSet, LayoutEntry)> {
        self.ancestry().find_map(|set| {
            set.inner
                .layout
                .entry_of(instance)
                .map(|entry| (set, *entry))
        })
    }

    /// Address of the instance, or `None` if it is placed nowhere in the chain.
    pub fn try_address_of(&self, instance: InstanceId) -> Option<u64> {
        self.locate(instance)
            .map(|(set, entry)| set.inner.origin + entry.offset())
    }

    /// Address of the instance, or 0 if it is placed nowhere in the chain.
    pub fn address_of(&self, instance: InstanceId) -> u64 {
        self.try_address_of(instance).unwrap_or(0)
    }

    /// True if `address` falls in this set's own range.
    pub fn contains_address(&self, address: u64) -> bool {
        let origin = self.inner.origin;
        address != 0 && address >= origin && address - origin < self.inner.layout.size()
    }

    /// The set and entry an address points to, searching this set then its ancestors.
    pub fn entry_at(&self, address: u64) -> Option<(&InstanceSet, LayoutEntry)> {
        if address == 0 {
            return None;
        }
        self.ancestry().find_map(|set| {
            if !set.contains_address(address) {
                return None;
            }
            set.inner
                .layout
                .entry_at(address - set.inner.origin)
                .map(|entry| (set, *entry))
        })
    }

    /// The instance an address points to.
    pub fn instance_at(&self, address: u64) -> Option<InstanceId> {
        self.entry_at(address).map(|(_, entry)| entry.instance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ArrayInstance, Heap};
    use crate::memory::HeapAllocation;

    fn single(heap: &mut Heap, value: i64) -> Result<(InstanceId, Layout)> {
        let id = heap.insert_array(ArrayInstance::Long(vec![value]));
        let mut layout = Layout::new(8)?;
        layout.append(id, 8, Some(1))?;
        Ok((id, layout))
    }

    #[test]
    fn visibility_is_upward_only() -> Result<()> {
        let mut heap = Heap::new();
        let (a, parent_layout) = single(&mut heap, 1)?;
        let (b, child_layout) = single(&mut heap, 2)?;

        let parent = InstanceSet::new(parent_layout, Box::new(HeapAllocation::new(8)))?;
        let child = parent.create_child(child_layout, Box::new(HeapAllocation::new(8)))?;

        assert!(child.contains(a));
        assert!(child.contains(b));
        assert!(parent.contains(a));
        assert!(!parent.contains(b));
        assert_eq!(parent.address_of(b), 0);

        // Virtual windows do not overlap.
        assert_eq!(parent.address_of(a), VIRTUAL_ORIGIN);
        let child_address = child.address_of(b);
        assert!(child_address > parent.address_of(a));
        assert_eq!(child.instance_at(child_address), Some(b));
        assert_eq!(child.instance_at(parent.address_of(a)), Some(a));
        assert_eq!(parent.instance_at(child_address), None);
        assert_eq!(child.instance_at(0), None);

        assert!(matches!(parent.release(), Err(NbinError::ResourceState(_))));
        assert!(!parent.is_released());
        child.release()?;
        assert_eq!(parent.children(), 0);
        parent.release()?;
        assert!(parent.allocation()?.is_released());
        Ok(())
    }

    #[test]
    fn real_base_addresses() -> Result<()> {
        let mut heap = Heap::new();
        let (a, layout) = single(&mut heap, 7)?;
        let set = InstanceSet::new(layout, Box::new(HeapAllocation::with_address(8, 0x4000)?))?;
        assert_eq!(set.address_of(a), 0x4000);
        assert!(set.contains_address(0x4007));
        assert!(!set.contains_address(0x4008));
        set.release()?;
        Ok(())
    }

    #[test]
    fn virtual_child_starts_after_a_real_parent() -> Result<()> {
        let mut heap = Heap::new();
        let (a, parent_layout) = single(&mut heap, 1)?;
        let (b, child_layout) = single(&mut heap, 2)?;

        let parent =
            InstanceSet::new(parent_layout, Box::new(HeapAllocation::with_address(24, 8)?))?;
        let child = parent.create_child(child_layout, Box::new(HeapAllocation::new(8)))?;
        assert_eq!(parent.address_of(a), 8);
        assert_eq!(child.origin(), 16);
        assert_eq!(child.address_of(b), 16);
        assert_eq!(child.instance_at(8), Some(a));
        assert_eq!(child.instance_at(16), Some(b));

        child.release()?;
        parent.release()?;
        Ok(())
    }

    #[test]
    fn real_child_cannot_overlap_an_ancestor() -> Result<()> {
        let mut heap = Heap::new();
        let (_, parent_layout) = single(&mut heap, 1)?;
        let (_, child_layout) = single(&mut heap, 2)?;
        let (_, next_layout) = single(&mut heap, 3)?;

        let parent = InstanceSet::new(parent_layout, Box::new(HeapAllocation::new(8)))?;
        // The parent's virtual window is 1..9.
        let result = parent.create_child(child_layout, Box::new(HeapAllocation::with_address(8, 4)?));
        assert!(matches!(result, Err(NbinError::ResourceState(_))));
        assert_eq!(parent.children(), 0);

        let child =
            parent.create_child(next_layout, Box::new(HeapAllocation::with_address(8, 9)?))?;
        assert_eq!(child.origin(), 9);
        child.release()?;
        parent.release()?;
        Ok(())
    }

    #[test]
    fn allocation_must_fit_layout() -> Result<()> {
        let mut heap = Heap::new();
        let (_, layout) = single(&mut heap, 7)?;
        assert!(matches!(
            InstanceSet::new(layout, Box::new(HeapAllocation::new(4))),
            Err(NbinError::ResourceState(_))
        ));
        Ok(())
    }

    #[test]
    fn dropping_an_open_child_detaches_it() -> Result<()> {
        let mut heap = Heap::new();
        let (_, parent_layout) = single(&mut heap, 1)?;
        let (_, child_layout) = single(&mut heap, 2)?;
        let parent = InstanceSet::new(parent_layout, Box::new(HeapAllocation::new(8)))?;
        {
            let _child = parent.create_child(child_layout, Box::new(HeapAllocation::new(8)))?;
            assert_eq!(parent.children(), 1);
        }
        assert_eq!(parent.children(), 0);
        parent.release()?;
        Ok(())
    }
}
