use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;

use bytemuck::Pod;

/// A fixed run of `T` slots inside a mapped segment, viewed through
/// `bytemuck` so only Plain Old Data types can live there.
///
/// The region only remembers where the slots are; it neither owns nor
/// unmaps the memory.
pub(crate) struct FixedRegion<T> {
    base: NonNull<u8>,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> FixedRegion<T> {
    /// # Safety
    /// `base` must point into a live mapping with room for `capacity`
    /// elements of `T`, aligned for `T`, and the mapping must outlive the
    /// region.
    pub unsafe fn new(base: NonNull<u8>, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            _marker: PhantomData,
        }
    }

    /// # Safety
    /// Same as [`FixedRegion::new`], with `offset` bytes into the mapping.
    pub unsafe fn at_offset(base: NonNull<u8>, offset: usize, capacity: usize) -> Self {
        let start = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
        unsafe { Self::new(start, capacity) }
    }

    fn byte_len(&self) -> usize {
        self.capacity * size_of::<T>()
    }

    /// Returns the slots as a mutable slice.
    ///
    /// # Safety
    /// The caller must hold the table lock (or be the sole initializer of a
    /// freshly created segment) and must not create a second view of the
    /// same region while the returned slice is alive.
    pub unsafe fn slice_mut<'a>(&self) -> &'a mut [T] {
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.byte_len()) };
        bytemuck::cast_slice_mut(bytes)
    }

    /// Returns the first slot, for single-element header regions.
    ///
    /// # Safety
    /// Same as [`FixedRegion::slice_mut`].
    pub unsafe fn first_mut<'a>(&self) -> &'a mut T {
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), size_of::<T>()) };
        bytemuck::from_bytes_mut(bytes)
    }
}
