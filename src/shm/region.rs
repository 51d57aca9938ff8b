//! The shared region itself: memfd-backed anonymous shared memory.
//!
//! The region must exist before any fork so children inherit the
//! mapping at the same address; it is unmapped once, after every
//! instance has been reaped.

use super::layout::{InstanceBlock, RegionHeader};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::SealFlags;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::mem::size_of;
use std::ptr::NonNull;

/// A memfd-backed shared mapping holding the run's header and one
/// stats block per instance.
///
/// Created by the parent before the first fork; children inherit the
/// mapping across `fork`, so no fd passing or re-mapping is needed.
/// The kernel reclaims the memory when the last reference goes away.
pub struct SharedRegion {
    /// The memfd file descriptor (kept for sealing/debugging).
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the mapping in bytes.
    len: usize,
    /// Number of instance blocks.
    instances: usize,
}

impl SharedRegion {
    /// Allocate and zero-initialize a region for `instances` workers.
    ///
    /// Sizes the mapping as `header + instances * stats_block`, maps
    /// it `MAP_SHARED`, and initializes the header and every block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resource`] if the mapping cannot be created;
    /// this aborts the run before any instance starts.
    pub fn allocate(instances: usize) -> Result<Self> {
        if instances == 0 {
            return Err(Error::Config("instance count must be non-zero".into()));
        }
        if instances > u32::MAX as usize {
            return Err(Error::Config("instance count out of range".into()));
        }

        let len = size_of::<RegionHeader>() + instances * size_of::<InstanceBlock>();

        let cname = CString::new("torsion-region")
            .map_err(|e| Error::Resource(e.to_string()))?;
        let fd = rustix::fs::memfd_create(
            &cname,
            rustix::fs::MemfdFlags::CLOEXEC | rustix::fs::MemfdFlags::ALLOW_SEALING,
        )
        .map_err(|e| Error::Resource(format!("memfd_create: {e}")))?;

        rustix::fs::ftruncate(&fd, len as u64)
            .map_err(|e| Error::Resource(format!("ftruncate: {e}")))?;

        // Map shared so the counters stay coherent across fork.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| Error::Resource(format!("mmap: {e}")))?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Resource("mmap returned null".into()))?;

        let region = Self {
            fd,
            ptr,
            len,
            instances,
        };

        region.header().init(instances as u32);
        for index in 0..instances {
            region.instance(index).reset(u64::MAX);
        }

        tracing::debug!(instances, bytes = len, "shared region allocated");
        Ok(region)
    }

    /// The region header (continue flag, barrier, instance count).
    #[inline]
    pub fn header(&self) -> &RegionHeader {
        // SAFETY: the mapping starts with a RegionHeader, is at least
        // header-sized, zero-initialized by the kernel, and all header
        // fields are atomics.
        unsafe { &*self.ptr.as_ptr().cast::<RegionHeader>() }
    }

    /// Bounds-checked accessor for one instance's stats block.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[inline]
    pub fn instance(&self, index: usize) -> &InstanceBlock {
        assert!(index < self.instances, "instance index out of bounds");
        // SAFETY: the mapping holds `self.instances` InstanceBlocks
        // directly after the header, and `index` was checked above.
        unsafe { &*self.blocks_ptr().add(index) }
    }

    /// Number of instance blocks in the region.
    pub fn instances(&self) -> usize {
        self.instances
    }

    /// Total size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty (it never is; parity accessor).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The backing memfd.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Seal the backing memfd against resizing.
    ///
    /// Called once the layout is final, before the first fork; a
    /// misbehaving workload can then no longer truncate the counters
    /// out from under the run.
    pub fn freeze(&self) -> Result<()> {
        rustix::fs::fcntl_add_seals(&self.fd, SealFlags::GROW | SealFlags::SHRINK)?;
        Ok(())
    }

    /// Explicitly unmap the region.
    ///
    /// Equivalent to dropping, but callable at the one point the run
    /// logic wants deterministic release: after all instances have
    /// been reaped.
    pub fn unmap(self) {
        drop(self);
    }

    /// Raw pointer to the header, for arming the deadline signal
    /// handler. The pointer stays valid until the region is unmapped;
    /// the controller disarms the handler first.
    pub(crate) fn header_ptr(&self) -> *const RegionHeader {
        self.ptr.as_ptr().cast::<RegionHeader>()
    }

    #[inline]
    fn blocks_ptr(&self) -> *const InstanceBlock {
        // SAFETY: offset stays inside the mapping (allocate sized it).
        unsafe {
            self.ptr
                .as_ptr()
                .add(size_of::<RegionHeader>())
                .cast::<InstanceBlock>()
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in allocate().
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd closes when OwnedFd drops.
    }
}

// SAFETY: the region is plain shared memory full of atomics; the fd is
// reference-counted by the kernel and no thread-local state is held.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}
