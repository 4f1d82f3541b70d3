// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Reference-counted pointers for handing payloads between dispatchers.
//!
//! Both flavours share one control block: the payload, a reference count, and for the bound
//! flavour the thread that created it.
//!
//! - [`SharedRefPtr`] is unbound. Its count is atomic, so copies may be cloned and dropped on any
//!   thread.
//! - [`BoundRefPtr`] is bound to the thread that created it. The handle may travel inside a job
//!   to another dispatcher and back, but dereferencing, cloning or dropping it anywhere else is
//!   a fatal error. The check runs in every build, because the count is not atomic.
//!
//! A null handle (`default()`) has no control block. Dereferencing it panics.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

trait RefCounter {
    fn one() -> Self;
    fn increment(&self);
    /// Returns the count after decrementing.
    fn decrement(&self) -> usize;
    fn current(&self) -> usize;
}

impl RefCounter for AtomicUsize {
    fn one() -> Self {
        AtomicUsize::new(1)
    }

    fn increment(&self) {
        let previous = self.fetch_add(1, Ordering::Relaxed);
        if previous > isize::MAX as usize {
            std::process::abort();
        }
    }

    fn decrement(&self) -> usize {
        let previous = self.fetch_sub(1, Ordering::Release);
        if previous == 1 {
            atomic::fence(Ordering::Acquire);
        }
        previous - 1
    }

    fn current(&self) -> usize {
        self.load(Ordering::Acquire)
    }
}

impl RefCounter for Cell<usize> {
    fn one() -> Self {
        Cell::new(1)
    }

    fn increment(&self) {
        self.set(self.get() + 1);
    }

    fn decrement(&self) -> usize {
        let remaining = self.get() - 1;
        self.set(remaining);
        remaining
    }

    fn current(&self) -> usize {
        self.get()
    }
}

struct ControlBlock<T, C> {
    refs: C,
    owner: Option<ThreadId>,
    value: T,
}

impl<T, C: RefCounter> ControlBlock<T, C> {
    fn allocate(value: T, owner: Option<ThreadId>) -> NonNull<Self> {
        let block = Box::new(ControlBlock {
            refs: C::one(),
            owner,
            value,
        });
        NonNull::from(Box::leak(block))
    }

    /// Drops one reference and frees the block if it was the last.
    ///
    /// # Safety
    /// `block` must come from `allocate` and the caller must own one of its references.
    unsafe fn release(block: NonNull<Self>) {
        if block.as_ref().refs.decrement() == 0 {
            drop(Box::from_raw(block.as_ptr()));
        }
    }
}

/// Reference-counted pointer usable from any thread.
pub struct SharedRefPtr<T> {
    block: Option<NonNull<ControlBlock<T, AtomicUsize>>>,
    _owns: PhantomData<ControlBlock<T, AtomicUsize>>,
}

// SAFETY: like `Arc<T>`, the count is atomic and the payload is only shared by reference.
unsafe impl<T: Send + Sync> Send for SharedRefPtr<T> {}
unsafe impl<T: Send + Sync> Sync for SharedRefPtr<T> {}

impl<T> SharedRefPtr<T> {
    pub fn new(value: T) -> Self {
        Self {
            block: Some(ControlBlock::allocate(value, None)),
            _owns: PhantomData,
        }
    }

    pub fn null() -> Self {
        Self {
            block: None,
            _owns: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.block.is_none()
    }

    fn block(&self) -> Option<&ControlBlock<T, AtomicUsize>> {
        // SAFETY: a non-null handle keeps its block alive.
        self.block.map(|block| unsafe { &*block.as_ptr() })
    }

    /// Number of handles sharing the payload. Zero for a null handle.
    pub fn ref_count(&self) -> usize {
        self.block().map_or(0, |block| block.refs.current())
    }

    pub fn get(&self) -> Option<&T> {
        self.block().map(|block| &block.value)
    }

    /// True if both handles share the same payload, or both are null.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.block == other.block
    }

    /// Moves the reference out, leaving a null handle behind.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Releases the reference and becomes null.
    pub fn reset(&mut self) {
        drop(self.take());
    }
}

impl<T> Default for SharedRefPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Clone for SharedRefPtr<T> {
    fn clone(&self) -> Self {
        if let Some(block) = self.block() {
            block.refs.increment();
        }
        Self {
            block: self.block,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for SharedRefPtr<T> {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            // SAFETY: this handle owned one reference.
            unsafe { ControlBlock::release(block) };
        }
    }
}

impl<T> Deref for SharedRefPtr<T> {
    type Target = T;

    #[track_caller]
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => panic!("dereferenced a null SharedRefPtr"),
        }
    }
}

impl<T> PartialEq for SharedRefPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedRefPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRefPtr")
            .field("refs", &self.ref_count())
            .field("value", &self.get())
            .finish()
    }
}

/// Reference-counted pointer confined to the thread that created it.
pub struct BoundRefPtr<T> {
    block: Option<NonNull<ControlBlock<T, Cell<usize>>>>,
    _owns: PhantomData<ControlBlock<T, Cell<usize>>>,
}

// SAFETY: the handle may move between threads, but every access to the block (deref, clone,
// drop) first asserts that it runs on the owning thread. A handle dropped elsewhere during a
// panic leaks its reference instead of touching the block.
unsafe impl<T> Send for BoundRefPtr<T> {}

impl<T> BoundRefPtr<T> {
    /// Creates the payload, bound to the calling thread.
    pub fn new(value: T) -> Self {
        Self {
            block: Some(ControlBlock::allocate(value, Some(thread::current().id()))),
            _owns: PhantomData,
        }
    }

    pub fn null() -> Self {
        Self {
            block: None,
            _owns: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.block.is_none()
    }

    /// The thread allowed to use this handle. `None` for a null handle.
    pub fn owner_thread(&self) -> Option<ThreadId> {
        // SAFETY: `owner` is written once at allocation and never changes.
        self.block.and_then(|block| unsafe { (*block.as_ptr()).owner })
    }

    /// True if the calling thread may use this handle.
    pub fn is_accessible(&self) -> bool {
        match self.owner_thread() {
            Some(owner) => owner == thread::current().id(),
            None => true,
        }
    }

    #[track_caller]
    fn block(&self) -> Option<&ControlBlock<T, Cell<usize>>> {
        let owner = self.owner_thread()?;
        let current = thread::current().id();
        assert!(
            owner == current,
            "BoundRefPtr created on {owner:?} accessed from {current:?}"
        );
        // SAFETY: checked to be on the owning thread, and a non-null handle keeps its block.
        self.block.map(|block| unsafe { &*block.as_ptr() })
    }

    /// # Panics
    /// Off the owning thread.
    #[track_caller]
    pub fn ref_count(&self) -> usize {
        self.block().map_or(0, |block| block.refs.current())
    }

    /// # Panics
    /// Off the owning thread.
    #[track_caller]
    pub fn get(&self) -> Option<&T> {
        self.block().map(|block| &block.value)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.block == other.block
    }

    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// # Panics
    /// Off the owning thread.
    #[track_caller]
    pub fn reset(&mut self) {
        drop(self.take());
    }
}

impl<T> Default for BoundRefPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Clone for BoundRefPtr<T> {
    #[track_caller]
    fn clone(&self) -> Self {
        if let Some(block) = self.block() {
            block.refs.increment();
        }
        Self {
            block: self.block,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for BoundRefPtr<T> {
    fn drop(&mut self) {
        let Some(block) = self.block.take() else {
            return;
        };
        // SAFETY: `owner` is immutable after allocation.
        let owner = unsafe { (*block.as_ptr()).owner };
        let current = thread::current().id();
        if owner != Some(current) {
            if thread::panicking() {
                return;
            }
            panic!("BoundRefPtr created on {owner:?} dropped on {current:?}");
        }
        // SAFETY: on the owning thread, and this handle owned one reference.
        unsafe { ControlBlock::release(block) };
    }
}

impl<T> Deref for BoundRefPtr<T> {
    type Target = T;

    #[track_caller]
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => panic!("dereferenced a null BoundRefPtr"),
        }
    }
}

impl<T> PartialEq for BoundRefPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T> fmt::Debug for BoundRefPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundRefPtr")
            .field("owner", &self.owner_thread())
            .field("null", &self.is_null())
            .finish()
    }
}
