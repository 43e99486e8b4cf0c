//! # Descriptor Stores
//!
//! Backing storage for the descriptor table. [`DenseStore`] is a flat array
//! sized at construction, for small statically bounded namespaces.
//! [`SparseStore`] materialises descriptors in a [`RadixTree`] on first
//! allocation, for large or fragmented ones. The choice is made at build
//! time through [`KernelStore`].
//!
//! Slots, once materialised, are never removed while the store is shared:
//! lookups return plain references without locking.

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::descriptor::Descriptor;
use super::radix::{RadixTree, StoreError};
use super::Irq;

/// Storage behind a descriptor table
pub trait DescriptorStore: Send + Sync {
    /// Whether slots are materialised on demand
    const SPARSE: bool = false;

    /// Build a store for interrupt numbers `0..limit`
    fn with_limit(limit: Irq) -> Result<Self, StoreError>
    where
        Self: Sized;

    /// One past the highest interrupt number the store accepts
    fn limit(&self) -> Irq;

    /// The slot for `irq`, if it exists
    fn slot(&self, irq: Irq) -> Option<&Descriptor>;

    /// The slot for `irq`, creating it if needed
    fn materialize(&self, irq: Irq) -> Result<&Descriptor, StoreError>;

    /// Every existing slot, ascending
    fn slots(&self) -> impl Iterator<Item = &Descriptor> + '_;
}

// ============================================================================
// Dense
// ============================================================================

/// Flat, pre-sized descriptor array
pub struct DenseStore {
    slots: Box<[Descriptor]>,
}

impl DescriptorStore for DenseStore {
    fn with_limit(limit: Irq) -> Result<Self, StoreError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(limit as usize)
            .map_err(|_| StoreError::OutOfMemory)?;
        slots.extend((0..limit).map(Descriptor::new));
        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }

    fn limit(&self) -> Irq {
        self.slots.len() as Irq
    }

    #[inline]
    fn slot(&self, irq: Irq) -> Option<&Descriptor> {
        self.slots.get(irq as usize)
    }

    fn materialize(&self, irq: Irq) -> Result<&Descriptor, StoreError> {
        self.slot(irq).ok_or(StoreError::IndexOutOfRange)
    }

    fn slots(&self) -> impl Iterator<Item = &Descriptor> + '_ {
        self.slots.iter()
    }
}

impl core::fmt::Debug for DenseStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DenseStore")
            .field("limit", &self.slots.len())
            .finish()
    }
}

// ============================================================================
// Sparse
// ============================================================================

/// Radix-tree backed descriptor store
#[derive(Debug)]
pub struct SparseStore {
    tree: RadixTree<Descriptor>,
    limit: Irq,
}

impl SparseStore {
    /// Current height of the underlying tree
    pub fn height(&self) -> usize {
        self.tree.height()
    }

    /// Number of materialised slots
    pub fn materialized(&self) -> usize {
        self.tree.len()
    }
}

impl DescriptorStore for SparseStore {
    const SPARSE: bool = true;

    fn with_limit(limit: Irq) -> Result<Self, StoreError> {
        Ok(Self {
            tree: RadixTree::new(),
            limit,
        })
    }

    fn limit(&self) -> Irq {
        self.limit
    }

    #[inline]
    fn slot(&self, irq: Irq) -> Option<&Descriptor> {
        if irq >= self.limit {
            return None;
        }
        self.tree.get(irq as usize)
    }

    fn materialize(&self, irq: Irq) -> Result<&Descriptor, StoreError> {
        if irq >= self.limit {
            return Err(StoreError::IndexOutOfRange);
        }
        self.tree
            .get_or_insert_with(irq as usize, || Descriptor::new(irq))
    }

    fn slots(&self) -> impl Iterator<Item = &Descriptor> + '_ {
        self.tree.iter().map(|(_, desc)| desc)
    }
}

#[cfg(feature = "sparse-irq")]
/// Descriptor store used by the kernel instance
pub type KernelStore = SparseStore;

#[cfg(not(feature = "sparse-irq"))]
/// Descriptor store used by the kernel instance
pub type KernelStore = DenseStore;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_dense_slots_are_preset() {
        let store = DenseStore::with_limit(48).unwrap();
        assert_eq!(store.limit(), 48);
        assert_eq!(store.slot(47).map(Descriptor::irq), Some(47));
        assert!(store.slot(48).is_none());
        assert_eq!(store.materialize(48).unwrap_err(), StoreError::IndexOutOfRange);
        assert!(store.slots().enumerate().all(|(i, desc)| desc.irq() as usize == i));
    }

    #[test]
    fn test_sparse_slots_appear_on_demand() {
        let store = SparseStore::with_limit(1 << 16).unwrap();
        assert!(store.slot(40_000).is_none());

        let desc = store.materialize(40_000).unwrap();
        assert_eq!(desc.irq(), 40_000);
        assert!(!desc.is_allocated());
        assert!(core::ptr::eq(desc, store.slot(40_000).unwrap()));

        store.materialize(7).unwrap();
        let irqs: Vec<_> = store.slots().map(Descriptor::irq).collect();
        assert_eq!(irqs, [7, 40_000]);
        assert_eq!(store.materialized(), 2);
    }

    #[test]
    fn test_sparse_respects_limit() {
        let store = SparseStore::with_limit(100).unwrap();
        assert_eq!(store.materialize(100).unwrap_err(), StoreError::IndexOutOfRange);
        assert!(store.slot(100).is_none());
        assert_eq!(store.height(), 0);
    }
}
