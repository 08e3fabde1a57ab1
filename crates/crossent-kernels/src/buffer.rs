//! Device memory.
//!
//! A [`DeviceBuffer`] is a shared handle to a fixed-length allocation. Cloning
//! the handle aliases the same memory, which is how launched kernels keep
//! their operands alive after the host call returns. [`DeviceBuffer::resize`]
//! never mutates memory a queued kernel may still touch: a length change
//! swaps in a fresh allocation and leaves the old one to its last user.

use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crossent_common::{KernelError, Result};

use crate::stream::Stream;

pub struct DeviceBuffer<T> {
    data: Arc<RwLock<Vec<T>>>,
    len: usize,
}

impl<T> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        Self { data: Arc::clone(&self.data), len: self.len }
    }
}

impl<T> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer").field("len", &self.len).finish_non_exhaustive()
    }
}

impl<T: Clone + Default> Default for DeviceBuffer<T> {
    fn default() -> Self {
        Self::zeros(0)
    }
}

impl<T: Clone + Default> DeviceBuffer<T> {
    /// Allocate `len` default-initialized elements.
    pub fn zeros(len: usize) -> Self {
        Self::from_host(vec![T::default(); len])
    }

    /// Upload host data.
    pub fn from_host(data: Vec<T>) -> Self {
        let len = data.len();
        Self { data: Arc::new(RwLock::new(data)), len }
    }

    /// Make the buffer hold exactly `len` elements.
    ///
    /// Returns `true` when a new allocation was made. Contents are not
    /// preserved across a reallocation.
    pub fn resize(&mut self, len: usize) -> bool {
        if len == self.len {
            return false;
        }
        *self = Self::zeros(len);
        true
    }
}

impl<T> DeviceBuffer<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `self` and `other` are handles to the same allocation.
    pub fn same_allocation(&self, other: &DeviceBuffer<T>) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    // A kernel that panicked while holding a guard poisons the lock. The
    // stream is faulted at that point, so the data is simply taken as is.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> DeviceBuffer<T> {
    /// Download after waiting for `stream`.
    pub fn to_host(&self, stream: &Stream) -> Result<Vec<T>> {
        stream.copy_to_host(self)
    }
}

/// A buffer together with its logical dimensions.
pub struct DeviceTensor<T> {
    dims: Vec<usize>,
    buffer: DeviceBuffer<T>,
}

impl<T> Clone for DeviceTensor<T> {
    fn clone(&self) -> Self {
        Self { dims: self.dims.clone(), buffer: self.buffer.clone() }
    }
}

impl<T> std::fmt::Debug for DeviceTensor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTensor").field("dims", &self.dims).finish_non_exhaustive()
    }
}

impl<T: Clone + Default> DeviceTensor<T> {
    pub fn zeros(dims: &[usize]) -> Self {
        Self { dims: dims.to_vec(), buffer: DeviceBuffer::zeros(dims.iter().product()) }
    }

    pub fn from_host(dims: &[usize], data: Vec<T>) -> Result<Self> {
        let numel: usize = dims.iter().product();
        if numel != data.len() {
            return Err(KernelError::InvalidArguments {
                reason: format!(
                    "dims {dims:?} describe {numel} elements but {} were given",
                    data.len()
                ),
            }
            .into());
        }
        Ok(Self { dims: dims.to_vec(), buffer: DeviceBuffer::from_host(data) })
    }

    /// A zero-dimensional tensor holding one value.
    pub fn scalar(value: T) -> Self {
        Self { dims: Vec::new(), buffer: DeviceBuffer::from_host(vec![value]) }
    }
}

impl<T> DeviceTensor<T> {
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn numel(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &DeviceBuffer<T> {
        &self.buffer
    }
}

impl<T: Clone> DeviceTensor<T> {
    pub fn to_host(&self, stream: &Stream) -> Result<Vec<T>> {
        self.buffer.to_host(stream)
    }
}

/// Shared view of a mutable slice for kernels whose workers write disjoint,
/// strided element sets that cannot be expressed as contiguous chunks.
pub(crate) struct DisjointSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: the view is created from a unique borrow, and callers uphold that
// no two workers touch the same index (see `get`/`set`).
unsafe impl<T: Send> Send for DisjointSlice<'_, T> {}
unsafe impl<T: Send> Sync for DisjointSlice<'_, T> {}

impl<'a, T: Copy> DisjointSlice<'a, T> {
    pub(crate) fn new(slice: &'a mut [T]) -> Self {
        Self { ptr: slice.as_mut_ptr(), len: slice.len(), _marker: PhantomData }
    }

    /// # Safety
    /// No other worker may write `index` concurrently.
    #[inline]
    pub(crate) unsafe fn get(&self, index: usize) -> T {
        assert!(index < self.len, "index {index} out of bounds for length {}", self.len);
        *self.ptr.add(index)
    }

    /// # Safety
    /// No other worker may read or write `index` concurrently.
    #[inline]
    pub(crate) unsafe fn set(&self, index: usize, value: T) {
        assert!(index < self.len, "index {index} out of bounds for length {}", self.len);
        *self.ptr.add(index) = value;
    }
}
