// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! DMA heap allocations shared between the CPU and the codec hardware.

use std::{
    fmt, io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    ptr::{null_mut, NonNull},
    slice::{from_raw_parts, from_raw_parts_mut},
};

use dma_buf::DmaBuf;
use dma_heap::{Heap, HeapKind};
use libc::{dup, mmap, munmap, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};
use nix::{errno::Errno, ioctl_write_ptr};
use tracing::{debug, warn};

use crate::error::{Error, Result};

// include/uapi/linux/dma-buf.h
const DMA_BUF_BASE: u8 = b'b';
const DMA_BUF_IOCTL_SYNC: u8 = 0;
const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 2 << 0;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[allow(non_camel_case_types)]
#[repr(C)]
struct dma_buf_sync {
    flags: u64,
}
ioctl_write_ptr!(dma_buf_ioctl_sync, DMA_BUF_BASE, DMA_BUF_IOCTL_SYNC, dma_buf_sync);

fn sync(fd: RawFd, flags: u64) {
    let arg = dma_buf_sync { flags };
    loop {
        match unsafe { dma_buf_ioctl_sync(fd, &arg) } {
            Ok(_) => return,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("DMA_BUF_IOCTL_SYNC {flags:#x} failed: {e}");
                return;
            }
        }
    }
}

/// Allocator for zero-copy buffers from a kernel DMA heap.
///
/// The contiguous (CMA) heap is preferred since most codec IP blocks cannot
/// scatter-gather; the system heap is used when no CMA heap is exposed.
pub struct DmaHeap {
    heap: Heap,
}

impl DmaHeap {
    /// Opens the CMA heap, falling back to the system heap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] when neither `/dev/dma_heap/linux,cma`
    /// nor `/dev/dma_heap/system` can be opened.
    pub fn new() -> Result<Self> {
        match Heap::new(HeapKind::Cma) {
            Ok(heap) => Ok(Self { heap }),
            Err(e) => {
                debug!("CMA heap unavailable ({e}), using system heap");
                Self::with_kind(HeapKind::System)
            }
        }
    }

    pub fn with_kind(kind: HeapKind) -> Result<Self> {
        let heap = Heap::new(kind).map_err(|e| Error::Allocation(format!("dma heap: {e}")))?;
        Ok(Self { heap })
    }

    /// Allocates and maps `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<DmaBuffer> {
        if size == 0 {
            return Err(Error::Allocation("zero sized dma buffer".to_string()));
        }
        let fd = self
            .heap
            .allocate(size)
            .map_err(|e| Error::Allocation(format!("{size} bytes: {e}")))?;
        DmaBuffer::map(fd, size)
    }
}

/// One DMA-BUF allocation, mapped once for its whole lifetime.
///
/// Dropping the buffer unmaps it and closes the descriptor. Other holders of
/// duplicated descriptors (the kernel, exported [`DmaBuf`]s) keep the memory
/// alive until they close theirs.
pub struct DmaBuffer {
    fd: OwnedFd,
    size: usize,
    ptr: NonNull<u8>,
}

// The mapping is plain shared memory; access is synchronised through the
// owning MediaBuffer.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    fn map(fd: OwnedFd, size: usize) -> Result<Self> {
        let ptr = unsafe {
            mmap(
                null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == MAP_FAILED {
            let err = io::Error::last_os_error();
            return Err(Error::Allocation(format!("mmap {size} bytes: {err}")));
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Allocation("mmap returned null".to_string()))?;
        debug!("DMA buffer mapped fd:{} size:{size}", fd.as_raw_fd());
        Ok(Self { fd, size, ptr })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Exports a duplicated descriptor for hand-off to other hardware blocks.
    pub fn dmabuf(&self) -> io::Result<DmaBuf> {
        let fd = unsafe { dup(self.fd.as_raw_fd()) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { DmaBuf::from_raw_fd(fd) })
    }

    /// Runs `f` over the mapping inside a read sync window.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        sync(self.raw_fd(), DMA_BUF_SYNC_START | DMA_BUF_SYNC_READ);
        let out = f(unsafe { from_raw_parts(self.ptr.as_ptr(), self.size) });
        sync(self.raw_fd(), DMA_BUF_SYNC_END | DMA_BUF_SYNC_READ);
        out
    }

    /// Runs `f` over the mapping inside a read/write sync window.
    pub fn write<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let flags = DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE;
        sync(self.raw_fd(), DMA_BUF_SYNC_START | flags);
        let out = f(unsafe { from_raw_parts_mut(self.ptr.as_ptr(), self.size) });
        sync(self.raw_fd(), DMA_BUF_SYNC_END | flags);
        out
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } != 0 {
            warn!("munmap failed: {}", io::Error::last_os_error());
        }
        debug!("DMA buffer freed fd:{}", self.fd.as_raw_fd());
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("fd", &self.fd.as_raw_fd())
            .field("size", &self.size)
            .finish()
    }
}

impl fmt::Display for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "dmabuf fd:{} size:{}", self.fd.as_raw_fd(), self.size)
    }
}
