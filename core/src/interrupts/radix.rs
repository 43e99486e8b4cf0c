//! # Radix Store
//!
//! Multi-level trie mapping `usize` indices to owned values, for interrupt
//! namespaces too large or fragmented for a flat array.
//!
//! ```text
//!   index = | ... | digit 2 | digit 1 | digit 0 |     6 bits per digit
//!
//!   root (level H-1)
//!    └─ slots[digit(H-1)] ─> layer (level H-2)
//!                              └─ ... ─> layer (level 0)
//!                                          └─ slots[digit(0)] ─> value
//! ```
//!
//! The tree grows upward: when an index needs more levels, the old root
//! becomes `slots[0]` of a new, taller root. It never shrinks; removal only
//! clears the leaf pointer.
//!
//! Readers walk the tree with acquire loads and never take a lock. Writers
//! publish fully initialised layers with release stores, so a reader racing
//! an insertion sees either the old shape or the new one, never a partial
//! layer.

use alloc::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use alloc::boxed::Box;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use spin::Mutex;
use static_assertions::const_assert;

// ============================================================================
// Geometry
// ============================================================================

/// Index bits decoded by each layer
pub const BITS_PER_LAYER: usize = 6;

/// Slots per layer
pub const FANOUT: usize = 1 << BITS_PER_LAYER;

const DIGIT_MASK: usize = FANOUT - 1;

/// Tallest tree needed to address every `usize`
pub const MAX_HEIGHT: usize = (usize::BITS as usize).div_ceil(BITS_PER_LAYER);

const_assert!(FANOUT == 64);
const_assert!(MAX_HEIGHT * BITS_PER_LAYER >= usize::BITS as usize);
const_assert!((MAX_HEIGHT - 1) * BITS_PER_LAYER < usize::BITS as usize);

/// Layers needed to address `index` (index 0 needs one)
const fn height_for(index: usize) -> usize {
    let mut height = 1;
    let mut rest = index >> BITS_PER_LAYER;
    while rest != 0 {
        height += 1;
        rest >>= BITS_PER_LAYER;
    }
    height
}

#[inline]
const fn digit(index: usize, level: usize) -> usize {
    (index >> (level * BITS_PER_LAYER)) & DIGIT_MASK
}

// ============================================================================
// Errors
// ============================================================================

/// Radix store errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// A layer or value allocation failed; the tree is unchanged
    OutOfMemory,
    /// The index lies outside what the owner of the store accepts
    IndexOutOfRange,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::IndexOutOfRange => f.write_str("index out of range"),
        }
    }
}

// ============================================================================
// Layers
// ============================================================================

/// One trie node. At level 0 the slots hold values, above it child layers.
struct Layer {
    level: usize,
    slots: [AtomicPtr<()>; FANOUT],
}

impl Layer {
    /// Allocate a zeroed (all slots null) layer
    fn allocate() -> Option<NonNull<Layer>> {
        #[cfg(test)]
        if tests::layer_budget_exhausted() {
            return None;
        }
        // SAFETY: Layer has non-zero size and all-zero bytes are a valid Layer
        let raw = unsafe { alloc_zeroed(Layout::new::<Layer>()) };
        NonNull::new(raw.cast::<Layer>())
    }

    /// Free a layer that was never linked into a tree
    ///
    /// # Safety
    ///
    /// `layer` must come from [`Layer::allocate`] and be unreachable.
    unsafe fn release(layer: NonNull<Layer>) {
        // SAFETY: allocated with this layout by `Layer::allocate`
        unsafe { dealloc(layer.as_ptr().cast(), Layout::new::<Layer>()) };
    }
}

/// Layers allocated up front for one insertion
struct LayerPool {
    layers: [*mut Layer; 2 * MAX_HEIGHT],
    len: usize,
}

impl LayerPool {
    /// Allocate `count` layers, or none at all
    fn reserve(count: usize) -> Result<Self, StoreError> {
        let mut pool = Self {
            layers: [ptr::null_mut(); 2 * MAX_HEIGHT],
            len: 0,
        };
        while pool.len < count {
            match Layer::allocate() {
                Some(layer) => {
                    pool.layers[pool.len] = layer.as_ptr();
                    pool.len += 1;
                },
                // Drop frees what was allocated so far
                None => return Err(StoreError::OutOfMemory),
            }
        }
        Ok(pool)
    }

    /// Take a layer and stamp its level
    fn take(&mut self, level: usize) -> *mut Layer {
        assert!(self.len > 0, "radix: insertion needed more layers than planned");
        self.len -= 1;
        let layer = mem::replace(&mut self.layers[self.len], ptr::null_mut());
        // SAFETY: the layer is private to this insertion until linked
        unsafe { (*layer).level = level };
        layer
    }
}

impl Drop for LayerPool {
    fn drop(&mut self) {
        for &layer in &self.layers[..self.len] {
            if let Some(layer) = NonNull::new(layer) {
                // SAFETY: pooled layers were never linked
                unsafe { Layer::release(layer) };
            }
        }
    }
}

/// Move a value to the heap without aborting on allocation failure
fn try_box<T>(value: T) -> Result<NonNull<T>, StoreError> {
    if mem::size_of::<T>() == 0 {
        return Ok(NonNull::from(Box::leak(Box::new(value))));
    }
    let layout = Layout::new::<T>();
    // SAFETY: non-zero size checked above
    let raw = unsafe { alloc(layout) }.cast::<T>();
    let slot = NonNull::new(raw).ok_or(StoreError::OutOfMemory)?;
    // SAFETY: freshly allocated for a T
    unsafe { slot.as_ptr().write(value) };
    Ok(slot)
}

// ============================================================================
// Radix Tree
// ============================================================================

/// Sparse index-to-value store with lock-free lookups
pub struct RadixTree<T> {
    root: AtomicPtr<Layer>,
    len: AtomicUsize,
    /// Serialises shared-reference insertions
    writer: Mutex<()>,
    _owns: PhantomData<Box<T>>,
}

// SAFETY: the tree owns its values; moving it moves them
unsafe impl<T: Send> Send for RadixTree<T> {}
// SAFETY: shared access hands out &T and can publish values created on
// another thread
unsafe impl<T: Send + Sync> Sync for RadixTree<T> {}

impl<T> RadixTree<T> {
    /// Create an empty tree (height 0, no allocation)
    pub const fn new() -> Self {
        Self {
            root: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
            writer: Mutex::new(()),
            _owns: PhantomData,
        }
    }

    /// Number of materialised layers from root to leaves
    pub fn height(&self) -> usize {
        let root = self.root.load(Ordering::Acquire);
        if root.is_null() {
            0
        } else {
            // SAFETY: published layers live as long as the tree
            unsafe { (*root).level + 1 }
        }
    }

    /// Number of indices addressable without growing, saturating at `usize::MAX`
    pub fn capacity(&self) -> usize {
        let height = self.height();
        if height == 0 {
            return 0;
        }
        let bits = height * BITS_PER_LAYER;
        if bits >= usize::BITS as usize {
            usize::MAX
        } else {
            1 << bits
        }
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Check if the tree holds no values
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a value
    ///
    /// Never allocates and never blocks. An index beyond the current height
    /// is simply absent.
    pub fn get(&self, index: usize) -> Option<&T> {
        let leaf = self.leaf(index)?;
        let value = leaf.load(Ordering::Acquire);
        // SAFETY: non-null leaves point at live values owned by the tree;
        // removal needs &mut self, which cannot coexist with this borrow
        unsafe { value.cast::<T>().as_ref() }
    }

    /// Store a value, returning the one it replaced
    pub fn insert(&mut self, index: usize, value: T) -> Result<Option<T>, StoreError> {
        let value = try_box(value)?;
        // SAFETY: &mut self excludes every other writer and reader
        match unsafe { self.publish(index, value.as_ptr().cast()) } {
            Ok(previous) => Ok(NonNull::new(previous.cast::<T>()).map(|previous| {
                // SAFETY: the previous leaf was unlinked and is owned by us
                let boxed = unsafe { Box::from_raw(previous.as_ptr()) };
                *boxed
            })),
            Err(err) => {
                // SAFETY: never linked
                drop(unsafe { Box::from_raw(value.as_ptr()) });
                Err(err)
            },
        }
    }

    /// Remove a value
    ///
    /// The layers on its path stay in place.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        let leaf = self.leaf(index)?;
        let value = NonNull::new(leaf.swap(ptr::null_mut(), Ordering::AcqRel).cast::<T>())?;
        self.len.fetch_sub(1, Ordering::Relaxed);
        // SAFETY: unlinked above; &mut self means no outstanding borrows
        let boxed = unsafe { Box::from_raw(value.as_ptr()) };
        Some(*boxed)
    }

    /// Return the value at `index`, creating it with `make` if absent
    ///
    /// Works through a shared reference: concurrent callers are serialised on
    /// an internal writer lock while readers continue unhindered. A value
    /// published this way stays at its index until the tree is accessed
    /// mutably again.
    pub fn get_or_insert_with<F>(&self, index: usize, make: F) -> Result<&T, StoreError>
    where
        F: FnOnce() -> T,
    {
        if let Some(value) = self.get(index) {
            return Ok(value);
        }

        let _writer = self.writer.lock();
        if let Some(value) = self.get(index) {
            return Ok(value);
        }

        let value = try_box(make())?;
        // SAFETY: the writer lock excludes other shared writers, and the
        // slot is empty so no reader holds a reference into it
        match unsafe { self.publish(index, value.as_ptr().cast()) } {
            Ok(previous) => {
                debug_assert!(previous.is_null());
                // SAFETY: just published; lives until removed through &mut self
                Ok(unsafe { &*value.as_ptr() })
            },
            Err(err) => {
                // SAFETY: never linked
                drop(unsafe { Box::from_raw(value.as_ptr()) });
                Err(err)
            },
        }
    }

    /// Iterate `(index, &value)` pairs in ascending index order
    pub fn iter(&self) -> Iter<'_, T> {
        let mut iter = Iter {
            stack: [(ptr::null(), 0); MAX_HEIGHT],
            depth: 0,
            _tree: PhantomData,
        };
        let root = self.root.load(Ordering::Acquire);
        if !root.is_null() {
            iter.stack[0] = (root.cast_const(), 0);
            iter.depth = 1;
        }
        iter
    }

    /// Walk to the level-0 slot for `index` without creating anything
    fn leaf(&self, index: usize) -> Option<&AtomicPtr<()>> {
        let mut node = self.root.load(Ordering::Acquire);
        if node.is_null() {
            return None;
        }
        // SAFETY: published layers are initialised and live as long as the tree
        unsafe {
            if height_for(index) > (*node).level + 1 {
                return None;
            }
            while (*node).level > 0 {
                let level = (*node).level;
                node = (*node).slots[digit(index, level)]
                    .load(Ordering::Acquire)
                    .cast::<Layer>();
                if node.is_null() {
                    return None;
                }
            }
            Some(&(*node).slots[digit(index, 0)])
        }
    }

    /// Count the layers an insertion at `index` must create
    ///
    /// # Safety
    ///
    /// Caller must hold writer exclusivity.
    unsafe fn missing_layers(&self, root: *mut Layer, index: usize, target: usize) -> usize {
        if root.is_null() {
            return target;
        }
        // SAFETY: root is published and writers are excluded
        let current = unsafe { (*root).level } + 1;

        // New roots chain down through slot 0. Leaving that chain at level
        // `l` means building a fresh path of `l` layers below it.
        for level in (current..target).rev() {
            if digit(index, level) != 0 {
                return (target - current) + level;
            }
        }

        let mut node = root;
        // SAFETY: as above
        unsafe {
            while (*node).level > 0 {
                let level = (*node).level;
                let child = (*node).slots[digit(index, level)]
                    .load(Ordering::Acquire)
                    .cast::<Layer>();
                if child.is_null() {
                    return (target - current) + level;
                }
                node = child;
            }
        }
        target - current
    }

    /// Link `leaf` at `index`, growing the tree as needed
    ///
    /// Every layer the insertion needs is allocated before anything is
    /// linked, so failure leaves the tree untouched. Returns the previous
    /// leaf pointer (null if the slot was empty).
    ///
    /// # Safety
    ///
    /// Caller must hold writer exclusivity (`&mut self` or the writer lock).
    /// If the slot may be occupied, no reader may hold a reference to the
    /// value being replaced.
    unsafe fn publish(&self, index: usize, leaf: *mut ()) -> Result<*mut (), StoreError> {
        let root = self.root.load(Ordering::Acquire);
        let height = self.height();
        let target = height.max(height_for(index));

        // SAFETY: forwarded
        let needed = unsafe { self.missing_layers(root, index, target) };
        let mut pool = LayerPool::reserve(needed)?;

        // Grow privately; the new top becomes visible only at the end
        let mut top = root;
        if top.is_null() {
            top = pool.take(target - 1);
        } else {
            for level in height..target {
                let taller = pool.take(level);
                // SAFETY: `taller` is private to this insertion
                unsafe { (*taller).slots[0].store(top.cast(), Ordering::Relaxed) };
                top = taller;
            }
        }

        let mut node = top;
        // SAFETY: every layer reached is either published or private to us,
        // and writers are excluded
        let previous = unsafe {
            while (*node).level > 0 {
                let level = (*node).level;
                let slot = &(*node).slots[digit(index, level)];
                let mut child = slot.load(Ordering::Acquire).cast::<Layer>();
                if child.is_null() {
                    child = pool.take(level - 1);
                    slot.store(child.cast(), Ordering::Release);
                }
                node = child;
            }
            (*node).slots[digit(index, 0)].swap(leaf, Ordering::AcqRel)
        };

        if top != root {
            self.root.store(top, Ordering::Release);
        }
        debug_assert_eq!(pool.len, 0);

        if previous.is_null() {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        Ok(previous)
    }
}

impl<T> Default for RadixTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for RadixTree<T> {
    fn drop(&mut self) {
        /// # Safety
        ///
        /// `layer` must be a linked layer of a tree being dropped.
        unsafe fn free<T>(layer: *mut Layer) {
            // SAFETY: forwarded; each pointer is visited exactly once
            unsafe {
                for slot in &(*layer).slots {
                    let entry = slot.load(Ordering::Relaxed);
                    if entry.is_null() {
                        continue;
                    }
                    if (*layer).level == 0 {
                        drop(Box::from_raw(entry.cast::<T>()));
                    } else {
                        free::<T>(entry.cast());
                    }
                }
                Layer::release(NonNull::new_unchecked(layer));
            }
        }

        let root = *self.root.get_mut();
        if !root.is_null() {
            // SAFETY: &mut self; nothing else can reach the tree
            unsafe { free::<T>(root) };
        }
    }
}

impl<T> fmt::Debug for RadixTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadixTree")
            .field("height", &self.height())
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// Iteration
// ============================================================================

/// Ascending iterator over a [`RadixTree`]
pub struct Iter<'a, T> {
    /// `(layer, next slot to visit)` from the root down
    stack: [(*const Layer, usize); MAX_HEIGHT],
    depth: usize,
    _tree: PhantomData<&'a RadixTree<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (usize, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        while self.depth > 0 {
            let (layer, next) = self.stack[self.depth - 1];
            if next == FANOUT {
                self.depth -= 1;
                continue;
            }
            self.stack[self.depth - 1].1 = next + 1;

            // SAFETY: layers on the stack are published and outlive 'a
            let (level, entry) =
                unsafe { ((*layer).level, (*layer).slots[next].load(Ordering::Acquire)) };
            if entry.is_null() {
                continue;
            }

            if level > 0 {
                self.stack[self.depth] = (entry.cast_const().cast(), 0);
                self.depth += 1;
                continue;
            }

            // Frames above the leaf have already advanced past the slot
            // they descended through
            let mut index = next;
            for &(frame, after) in &self.stack[..self.depth - 1] {
                // SAFETY: as above
                let frame_level = unsafe { (*frame).level };
                index |= (after - 1) << (frame_level * BITS_PER_LAYER);
            }
            // SAFETY: non-null leaf of a tree borrowed for 'a
            return Some((index, unsafe { &*entry.cast_const().cast::<T>() }));
        }
        None
    }
}

impl<T> fmt::Debug for Iter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").field("depth", &self.depth).finish()
    }
}
