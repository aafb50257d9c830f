//! Allocation routed through the GDB server.
//!
//! The server expects plug-ins to obtain heap memory from its own
//! `allocate`/`deallocate` pair so that everything a plug-in holds is
//! accounted to (and torn down with) the debug session. Two adapters cover
//! the two shapes this takes in Rust: [`HostAllocator`] for explicit typed
//! array allocation, and [`HostMemoryResource`] as a `#[global_allocator]`
//! that starts on [`System`] and switches to the host once a server table
//! is installed.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ffi::c_void;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::api::ServerApi;

/// A typed allocation request could not be satisfied.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum AllocError {
    /// An array of {count} items of {size} bytes each does not fit in the address space.
    Overflow {
        /// Requested item count.
        count: usize,
        /// Size of one item.
        size: usize,
    },
    /// The host failed to provide {bytes} bytes.
    HostExhausted {
        /// Total size of the rejected request.
        bytes: usize,
    },
}

/// Typed array allocation on the server's heap.
///
/// A plain value; copies referring to the same [`ServerApi`] table compare
/// equal, which is what lets containers with distinct allocator instances
/// exchange memory.
#[derive(Clone, Copy)]
pub struct HostAllocator<'a> {
    api: &'a ServerApi,
}

impl<'a> HostAllocator<'a> {
    /// An allocator drawing from `api`.
    pub fn new(api: &'a ServerApi) -> Self {
        Self { api }
    }

    /// Allocates space for `count` values of `T`.
    ///
    /// Oversized requests are rejected with [`AllocError::Overflow`] before
    /// the host is involved at all; the host must never see a size that
    /// already overflowed on this side. A zero-sized request returns a
    /// dangling pointer without calling the host.
    pub fn allocate_array<T>(&self, count: usize) -> Result<NonNull<T>, AllocError> {
        let layout = Layout::array::<T>(count).map_err(|_| AllocError::Overflow {
            count,
            size: mem::size_of::<T>(),
        })?;
        if layout.size() == 0 {
            return Ok(NonNull::dangling());
        }
        let raw = unsafe { (self.api.allocate)(layout.size()) };
        NonNull::new(raw.cast::<T>()).ok_or(AllocError::HostExhausted {
            bytes: layout.size(),
        })
    }

    /// Returns an array obtained from [`allocate_array`](Self::allocate_array)
    /// to the host.
    ///
    /// `count` must match the allocation; the host tracks sizes itself, but
    /// the count is part of the interface so a mismatch is visible at the
    /// call site.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate_array::<T>` on an equal allocator and
    /// must not be used afterwards.
    pub unsafe fn deallocate_array<T>(&self, ptr: NonNull<T>, count: usize) {
        if count == 0 || mem::size_of::<T>() == 0 {
            return;
        }
        (self.api.deallocate)(ptr.as_ptr().cast::<c_void>());
    }

    /// Resizes an array in place where the host can, moving it otherwise.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate_array::<T>` on an equal allocator;
    /// on success it is invalidated and the returned pointer replaces it.
    pub unsafe fn reallocate_array<T>(
        &self,
        ptr: NonNull<T>,
        new_count: usize,
    ) -> Result<NonNull<T>, AllocError> {
        let layout = Layout::array::<T>(new_count).map_err(|_| AllocError::Overflow {
            count: new_count,
            size: mem::size_of::<T>(),
        })?;
        let raw = (self.api.reallocate)(ptr.as_ptr().cast::<c_void>(), layout.size() as _);
        NonNull::new(raw.cast::<T>()).ok_or(AllocError::HostExhausted {
            bytes: layout.size(),
        })
    }
}

impl PartialEq for HostAllocator<'_> {
    /// Two allocators are interchangeable exactly when they draw from the
    /// same server table.
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.api, other.api)
    }
}

impl Eq for HostAllocator<'_> {}

impl std::fmt::Debug for HostAllocator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAllocator")
            .field("api", &(self.api as *const ServerApi))
            .finish()
    }
}

/// Bookkeeping stored immediately before every block handed out by
/// [`HostMemoryResource`], so a block frees through whichever allocator
/// produced it even if the host table was installed in between.
#[repr(C)]
struct BlockHeader {
    /// Pointer as returned by the underlying allocator.
    raw: *mut u8,
    /// Server table the block came from; null means [`System`].
    api: *const ServerApi,
}

/// A `GlobalAlloc` that routes to the server heap once one is known.
///
/// Static initializers and anything else that runs before `RTOS_Init`
/// allocate from [`System`]; after [`install`](Self::install) new blocks
/// come from the host. Each block records its origin in a [`BlockHeader`],
/// so mixed lifetimes are safe.
pub struct HostMemoryResource {
    api: AtomicPtr<ServerApi>,
}

impl HostMemoryResource {
    /// A resource that routes to [`System`] until a table is installed.
    ///
    /// `const` so it can back a `#[global_allocator]` static.
    pub const fn new() -> Self {
        Self {
            api: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Switches future allocations to the server heap.
    pub fn install(&self, api: &'static ServerApi) {
        self.api
            .store(api as *const ServerApi as *mut ServerApi, Ordering::Release);
    }

    /// Whether a server table has been installed.
    pub fn is_installed(&self) -> bool {
        !self.api.load(Ordering::Acquire).is_null()
    }

    fn raw_layout(layout: Layout) -> Option<(Layout, usize)> {
        let align = layout.align().max(mem::align_of::<BlockHeader>());
        let total = layout
            .size()
            .checked_add(align)?
            .checked_add(mem::size_of::<BlockHeader>())?;
        let raw = Layout::from_size_align(total, mem::align_of::<BlockHeader>()).ok()?;
        Some((raw, align))
    }
}

impl Default for HostMemoryResource {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for HostMemoryResource {
    /// Resources are interchangeable exactly when they currently route to
    /// the same server table (or both still to [`System`]).
    fn eq(&self, other: &Self) -> bool {
        self.api.load(Ordering::Acquire) == other.api.load(Ordering::Acquire)
    }
}

// SAFETY: over-allocates enough room to place a `BlockHeader` directly in
// front of a payload pointer of the requested alignment; the header always
// fits between the raw block start and the payload.
unsafe impl GlobalAlloc for HostMemoryResource {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let api = self.api.load(Ordering::Acquire);
        let Some((raw_layout, align)) = Self::raw_layout(layout) else {
            return ptr::null_mut();
        };

        let raw = if api.is_null() {
            System.alloc(raw_layout)
        } else {
            ((*api).allocate)(raw_layout.size()).cast::<u8>()
        };
        if raw.is_null() {
            return ptr::null_mut();
        }

        let payload = raw.add(mem::size_of::<BlockHeader>());
        let payload = payload.add(payload.align_offset(align));
        payload.cast::<BlockHeader>().sub(1).write(BlockHeader { raw, api });
        payload
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let header = ptr.cast::<BlockHeader>().sub(1).read();
        if header.api.is_null() {
            let (raw_layout, _) =
                Self::raw_layout(layout).expect("layout was valid at allocation time");
            System.dealloc(header.raw, raw_layout);
        } else {
            ((*header.api).deallocate)(header.raw.cast::<c_void>());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_host::FakeHost;
    use pretty_assertions::assert_eq;

    #[test]
    fn oversized_requests_never_reach_the_host() {
        let host = FakeHost::install();
        let allocator = HostAllocator::new(host.api());

        let error = allocator
            .allocate_array::<u64>(usize::MAX / 8 + 1)
            .unwrap_err();
        assert!(matches!(error, AllocError::Overflow { size: 8, .. }));
        assert_eq!(host.alloc_calls(), 0);
    }

    #[test]
    fn zero_sized_requests_never_reach_the_host() {
        let host = FakeHost::install();
        let allocator = HostAllocator::new(host.api());

        let ptr = allocator.allocate_array::<u32>(0).unwrap();
        assert_eq!(ptr, NonNull::dangling());
        unsafe { allocator.deallocate_array(ptr, 0) };
        assert_eq!(host.alloc_calls(), 0);
        assert_eq!(host.dealloc_calls(), 0);
    }

    #[test]
    fn arrays_roundtrip_through_the_host_heap() {
        let host = FakeHost::install();
        let allocator = HostAllocator::new(host.api());

        let ptr = allocator.allocate_array::<u32>(16).unwrap();
        assert_eq!(host.alloc_calls(), 1);
        unsafe {
            ptr.as_ptr().write(0xDEAD_BEEF);
            assert_eq!(ptr.as_ptr().read(), 0xDEAD_BEEF);
            allocator.deallocate_array(ptr, 16);
        }
        assert_eq!(host.dealloc_calls(), 1);
        assert_eq!(host.live_allocs(), 0);
    }

    #[test]
    fn allocators_compare_by_server_table() {
        let host = FakeHost::install();
        let first = HostAllocator::new(host.api());
        let second = HostAllocator::new(host.api());
        assert_eq!(first, second);

        // A bitwise copy of the table at another address is a different heap.
        let copy: &'static ServerApi = Box::leak(Box::new(unsafe { ptr::read(host.api()) }));
        assert_ne!(first, HostAllocator::new(copy));
    }

    #[test]
    fn memory_resource_switches_heaps_on_install() {
        let host = FakeHost::install();
        let resource = HostMemoryResource::new();
        assert!(!resource.is_installed());

        let layout = Layout::from_size_align(64, 8).unwrap();
        // Pre-install blocks come from System and must free through it even
        // after the host heap takes over.
        let early = unsafe { resource.alloc(layout) };
        assert!(!early.is_null());
        assert_eq!(host.alloc_calls(), 0);

        resource.install(host.api());
        assert!(resource.is_installed());

        let late = unsafe { resource.alloc(layout) };
        assert!(!late.is_null());
        assert_eq!(host.alloc_calls(), 1);

        unsafe {
            resource.dealloc(early, layout);
            resource.dealloc(late, layout);
        }
        assert_eq!(host.dealloc_calls(), 1);
        assert_eq!(host.live_allocs(), 0);
    }

    #[test]
    fn memory_resource_honors_over_alignment() {
        let host = FakeHost::install();
        let resource = HostMemoryResource::new();
        resource.install(host.api());

        let layout = Layout::from_size_align(32, 64).unwrap();
        let ptr = unsafe { resource.alloc(layout) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 64, 0);
        unsafe { resource.dealloc(ptr, layout) };
        assert_eq!(host.live_allocs(), 0);
    }

    #[test]
    fn memory_resources_compare_by_backend() {
        let host = FakeHost::install();
        let first = HostMemoryResource::new();
        let second = HostMemoryResource::new();
        assert!(first == second);

        first.install(host.api());
        assert!(first != second);
        second.install(host.api());
        assert!(first == second);
    }
}
