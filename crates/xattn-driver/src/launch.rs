//! Kernel launch geometry and parameter arrays.
//!
//! The driver receives kernel parameters as an array of pointers, one per parameter, each
//! pointing at host memory holding the value. [`ArgList`] builds that array from borrowed
//! values, so the values are guaranteed to outlive the launch, and caps the slot count.

use std::ffi::c_void;
use std::marker::PhantomData;

use bytemuck::Pod;
use smallvec::SmallVec;

/// Largest parameter list any precompiled kernel takes.
pub const MAX_KERNEL_PARAMS: usize = 11;

/// Grid/block dimensions and dynamic shared memory for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchConfig {
    pub grid_dim: (u32, u32, u32),
    pub block_dim: (u32, u32, u32),
    pub shared_mem_bytes: u32,
}

impl LaunchConfig {
    /// Total threads per block.
    pub fn threads_per_block(&self) -> u32 {
        self.block_dim.0 * self.block_dim.1 * self.block_dim.2
    }
}

/// Pushing past the slot limit of an [`ArgList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("kernel parameter list exceeds {max} slots")]
pub struct ArgOverflow {
    pub max: usize,
}

/// Ordered builder of kernel parameters borrowed for `'a`.
pub struct ArgList<'a> {
    ptrs: SmallVec<[*mut c_void; MAX_KERNEL_PARAMS + 1]>,
    sizes: SmallVec<[usize; MAX_KERNEL_PARAMS]>,
    max_slots: usize,
    _borrow: PhantomData<&'a mut ()>,
}

impl<'a> ArgList<'a> {
    /// Builder accepting at most [`MAX_KERNEL_PARAMS`] values.
    pub fn new() -> Self {
        Self::with_max_slots(MAX_KERNEL_PARAMS)
    }

    /// Builder accepting at most `max_slots` values (clamped to [`MAX_KERNEL_PARAMS`]).
    pub fn with_max_slots(max_slots: usize) -> Self {
        Self {
            ptrs: SmallVec::new(),
            sizes: SmallVec::new(),
            max_slots: max_slots.min(MAX_KERNEL_PARAMS),
            _borrow: PhantomData,
        }
    }

    /// Append the next parameter.
    pub fn push<T: Pod>(&mut self, value: &'a mut T) -> Result<(), ArgOverflow> {
        if self.sizes.len() >= self.max_slots {
            return Err(ArgOverflow { max: self.max_slots });
        }
        self.ptrs.push(value as *mut T as *mut c_void);
        self.sizes.push(std::mem::size_of::<T>());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Seal the list. A null entry is appended after the last parameter.
    pub fn finish(mut self) -> KernelArgs<'a> {
        self.ptrs.push(std::ptr::null_mut());
        KernelArgs {
            ptrs: self.ptrs,
            sizes: self.sizes,
            _borrow: PhantomData,
        }
    }
}

impl Default for ArgList<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// A sealed, null-terminated parameter array ready for the driver.
pub struct KernelArgs<'a> {
    ptrs: SmallVec<[*mut c_void; MAX_KERNEL_PARAMS + 1]>,
    sizes: SmallVec<[usize; MAX_KERNEL_PARAMS]>,
    _borrow: PhantomData<&'a mut ()>,
}

impl<'a> KernelArgs<'a> {
    /// Number of parameters, not counting the trailing null.
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// The raw pointer array including the trailing null.
    pub fn as_mut_ptr_slice(&mut self) -> &mut [*mut c_void] {
        &mut self.ptrs
    }

    /// Whether the entry after the last parameter is null.
    pub fn is_null_terminated(&self) -> bool {
        self.ptrs.len() == self.sizes.len() + 1
            && self.ptrs.last().map_or(false, |p| p.is_null())
    }

    /// Host bytes of parameter `index`.
    pub fn slot_bytes(&self, index: usize) -> Option<&[u8]> {
        let size = *self.sizes.get(index)?;
        let ptr = self.ptrs[index] as *const u8;
        // Safety: the pointer came from a `&'a mut T` of `size` bytes that is still borrowed.
        Some(unsafe { std::slice::from_raw_parts(ptr, size) })
    }

    /// Copies of every parameter's bytes, in order.
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        (0..self.len())
            .filter_map(|i| self.slot_bytes(i).map(<[u8]>::to_vec))
            .collect()
    }
}
