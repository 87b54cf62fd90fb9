// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Reference counted frames and packets exchanged with codec callers.
//!
//! A [`MediaBuffer`] is a shared handle: cloning it takes a reference and
//! dropping it releases one. The backing memory (heap planes or a
//! [`DmaBuffer`]) is freed only when the last handle goes away, so a buffer
//! handed to another thread or back to the codec can never be freed under
//! its remaining users.

use std::{
    fmt, io,
    os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd},
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use dma_buf::DmaBuf;
use tracing::trace;

use crate::{
    dma::{DmaBuffer, DmaHeap},
    error::{Error, Result},
    fourcc::FourCC,
};

/// End-of-stream marker carried by a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndOfStream {
    #[default]
    None,
    /// Last buffer of the stream, its payload is valid.
    WithData,
    /// Terminal marker without payload.
    WithoutData,
}

impl EndOfStream {
    pub fn is_eos(self) -> bool {
        self != EndOfStream::None
    }
}

/// Who owns the memory behind a [`MediaBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    /// Heap planes allocated and freed by the buffer.
    HeapInternal,
    /// A DMA heap allocation owned by the buffer.
    DmaInternal,
    /// Memory owned by the caller; the buffer only borrows it.
    External,
}

/// Back-reference to the driver slot a buffer came from.
///
/// `generation` changes every time the slot set is reallocated, so a buffer
/// returned after a resolution change is recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy)]
struct PlaneRange {
    offset: usize,
    len: usize,
}

enum Backing {
    Heap(Vec<Vec<u8>>),
    Dma {
        buf: DmaBuffer,
        planes: Vec<PlaneRange>,
    },
    UserPtr(Vec<(usize, usize)>),
    DmaFd {
        fd: OwnedFd,
        planes: Vec<PlaneRange>,
    },
}

impl Backing {
    fn plane_count(&self) -> usize {
        match self {
            Backing::Heap(planes) => planes.len(),
            Backing::Dma { planes, .. } | Backing::DmaFd { planes, .. } => planes.len(),
            Backing::UserPtr(planes) => planes.len(),
        }
    }

    fn capacity(&self, plane: usize) -> Option<usize> {
        match self {
            Backing::Heap(planes) => planes.get(plane).map(Vec::len),
            Backing::Dma { planes, .. } | Backing::DmaFd { planes, .. } => {
                planes.get(plane).map(|p| p.len)
            }
            Backing::UserPtr(planes) => planes.get(plane).map(|p| p.1),
        }
    }
}

struct State {
    backing: Backing,
    used: Vec<usize>,
}

#[derive(Debug, Clone)]
struct Info {
    format: FourCC,
    width: u32,
    height: u32,
    stride: u32,
    pts: u64,
    eos: EndOfStream,
    keyframe: bool,
    corrupted: bool,
}

struct Inner {
    info: Mutex<Info>,
    state: Mutex<State>,
    kind: BufferType,
    origin: Option<Origin>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        trace!(
            "media buffer freed kind:{:?} origin:{:?}",
            self.kind,
            self.origin
        );
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared handle to one picture (frame) or one bitstream unit (packet).
///
/// # Example
///
/// ```
/// use edgefirst_codec::{fourcc, media::MediaBuffer};
///
/// let packet = MediaBuffer::packet(fourcc::H264, vec![0, 0, 0, 1, 0x67], 33);
/// let handle = packet.clone();
/// assert_eq!(packet.ref_count(), 2);
/// drop(handle);
/// assert_eq!(packet.ref_count(), 1);
/// assert_eq!(packet.payload_len(), 5);
/// ```
#[derive(Clone)]
pub struct MediaBuffer {
    inner: Arc<Inner>,
}

impl MediaBuffer {
    fn build(info: Info, backing: Backing, used: Vec<usize>, kind: BufferType) -> Self {
        Self::build_with_origin(info, backing, used, kind, None)
    }

    fn build_with_origin(
        info: Info,
        backing: Backing,
        used: Vec<usize>,
        kind: BufferType,
        origin: Option<Origin>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                info: Mutex::new(info),
                state: Mutex::new(State { backing, used }),
                kind,
                origin,
            }),
        }
    }

    fn frame_info(format: FourCC, width: u32, height: u32, stride: u32) -> Info {
        Info {
            format,
            width,
            height,
            stride,
            pts: 0,
            eos: EndOfStream::None,
            keyframe: false,
            corrupted: false,
        }
    }

    fn layout(format: FourCC, width: u32, height: u32) -> Result<Vec<(usize, usize)>> {
        format
            .plane_layout(width, height)
            .ok_or(Error::UnsupportedFormat {
                requested: format,
                actual: format,
            })
    }

    /// Allocates a heap frame with one allocation per plane.
    pub fn frame(format: FourCC, width: u32, height: u32) -> Result<Self> {
        let layout = Self::layout(format, width, height)?;
        let stride = layout[0].0 as u32;
        let planes: Vec<Vec<u8>> = layout.iter().map(|(_, size)| vec![0; *size]).collect();
        let used = layout.iter().map(|(_, size)| *size).collect();
        Ok(Self::build(
            Self::frame_info(format, width, height, stride),
            Backing::Heap(planes),
            used,
            BufferType::HeapInternal,
        ))
    }

    /// Wraps an owned bitstream unit. An empty `data` is an end-of-stream
    /// marker for the decoder.
    pub fn packet(coding: FourCC, data: Vec<u8>, pts: u64) -> Self {
        let len = data.len();
        let mut info = Self::frame_info(coding, 0, 0, 0);
        info.pts = pts;
        Self::build(
            info,
            Backing::Heap(vec![data]),
            vec![len],
            BufferType::HeapInternal,
        )
    }

    /// Heap buffer built from plane payloads produced by the driver.
    pub(crate) fn from_planes(
        format: FourCC,
        width: u32,
        height: u32,
        stride: u32,
        planes: Vec<Vec<u8>>,
    ) -> Self {
        let used = planes.iter().map(Vec::len).collect();
        Self::build(
            Self::frame_info(format, width, height, stride),
            Backing::Heap(planes),
            used,
            BufferType::HeapInternal,
        )
    }

    /// Tags a freshly built buffer with the driver slot it belongs to. Has no
    /// effect once the handle has been shared.
    pub(crate) fn with_origin(mut self, origin: Origin) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.origin = Some(origin);
        }
        self
    }

    /// Allocates a frame as a single DMA heap region with planes laid out
    /// back to back.
    pub fn dma_frame(heap: &DmaHeap, format: FourCC, width: u32, height: u32) -> Result<Self> {
        let layout = Self::layout(format, width, height)?;
        let total = layout.iter().map(|(_, size)| size).sum();
        Self::dma_with_layout(heap, format, width, height, total, &layout, None)
    }

    /// Allocates a frame backed by one DMA region of `size` bytes, used for
    /// driver slots whose size is dictated by the negotiated format.
    pub(crate) fn dma_slot(
        heap: &DmaHeap,
        format: FourCC,
        width: u32,
        height: u32,
        stride: u32,
        size: usize,
        origin: Origin,
    ) -> Result<Self> {
        let layout = [(stride as usize, size)];
        Self::dma_with_layout(heap, format, width, height, size, &layout, Some(origin))
    }

    fn dma_with_layout(
        heap: &DmaHeap,
        format: FourCC,
        width: u32,
        height: u32,
        total: usize,
        layout: &[(usize, usize)],
        origin: Option<Origin>,
    ) -> Result<Self> {
        let buf = heap.allocate(total)?;
        let mut offset = 0;
        let planes = layout
            .iter()
            .map(|(_, len)| {
                let range = PlaneRange {
                    offset,
                    len: *len,
                };
                offset += len;
                range
            })
            .collect::<Vec<_>>();
        let used = planes.iter().map(|p| p.len).collect();
        let stride = layout.first().map(|(stride, _)| *stride as u32).unwrap_or(0);
        Ok(Self::build_with_origin(
            Self::frame_info(format, width, height, stride),
            Backing::Dma { buf, planes },
            used,
            BufferType::DmaInternal,
            origin,
        ))
    }

    /// Wraps a caller-owned DMA-BUF. The descriptor is duplicated; the memory
    /// stays owned by the caller.
    pub fn from_dma_fd(
        fd: BorrowedFd<'_>,
        format: FourCC,
        width: u32,
        height: u32,
        size: usize,
    ) -> Result<Self> {
        let fd = fd.try_clone_to_owned()?;
        let layout = match format.plane_layout(width, height) {
            Some(layout) => layout,
            None => vec![(0, size)],
        };
        let mut offset = 0;
        let planes: Vec<PlaneRange> = layout
            .iter()
            .map(|(_, len)| {
                let range = PlaneRange {
                    offset,
                    len: *len,
                };
                offset += len;
                range
            })
            .collect();
        if offset > size {
            return Err(Error::BufferTooSmall {
                need: offset,
                have: size,
            });
        }
        let used = planes.iter().map(|p| p.len).collect();
        let stride = layout[0].0 as u32;
        Ok(Self::build(
            Self::frame_info(format, width, height, stride),
            Backing::DmaFd { fd, planes },
            used,
            BufferType::External,
        ))
    }

    /// Wraps caller-owned plane memory.
    ///
    /// # Safety
    ///
    /// Every `(pointer, len)` pair must describe memory that stays valid and
    /// is not accessed by the caller until the last handle to this buffer
    /// has been dropped.
    pub unsafe fn from_user_ptr(
        format: FourCC,
        width: u32,
        height: u32,
        planes: &[(*mut u8, usize)],
    ) -> Result<Self> {
        if planes.is_empty() || planes.iter().any(|(ptr, _)| ptr.is_null()) {
            return Err(Error::NullArgument("plane pointer"));
        }
        let stride = format
            .plane_layout(width, height)
            .map(|layout| layout[0].0 as u32)
            .unwrap_or(0);
        let planes: Vec<(usize, usize)> = planes.iter().map(|(p, l)| (*p as usize, *l)).collect();
        let used = planes.iter().map(|p| p.1).collect();
        Ok(Self::build(
            Self::frame_info(format, width, height, stride),
            Backing::UserPtr(planes),
            used,
            BufferType::External,
        ))
    }

    /// Current number of handles, including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether both handles refer to the same underlying buffer.
    pub fn same_buffer(&self, other: &MediaBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn buffer_type(&self) -> BufferType {
        self.inner.kind
    }

    pub fn origin(&self) -> Option<Origin> {
        self.inner.origin
    }

    /// Stable slot id when the buffer is backed by driver memory.
    pub fn id(&self) -> Option<u32> {
        self.inner.origin.map(|o| o.index)
    }

    pub fn format(&self) -> FourCC {
        lock(&self.inner.info).format
    }

    pub fn width(&self) -> u32 {
        lock(&self.inner.info).width
    }

    pub fn height(&self) -> u32 {
        lock(&self.inner.info).height
    }

    pub fn stride(&self) -> u32 {
        lock(&self.inner.info).stride
    }

    pub fn pts(&self) -> u64 {
        lock(&self.inner.info).pts
    }

    pub fn set_pts(&self, pts: u64) {
        lock(&self.inner.info).pts = pts;
    }

    pub fn eos(&self) -> EndOfStream {
        lock(&self.inner.info).eos
    }

    pub fn set_eos(&self, eos: EndOfStream) {
        lock(&self.inner.info).eos = eos;
    }

    pub fn is_keyframe(&self) -> bool {
        lock(&self.inner.info).keyframe
    }

    pub fn set_keyframe(&self, keyframe: bool) {
        lock(&self.inner.info).keyframe = keyframe;
    }

    /// Set on frames the driver flagged as decoded with errors.
    pub fn is_corrupted(&self) -> bool {
        lock(&self.inner.info).corrupted
    }

    pub(crate) fn set_corrupted(&self, corrupted: bool) {
        lock(&self.inner.info).corrupted = corrupted;
    }

    pub(crate) fn set_geometry(&self, width: u32, height: u32, stride: u32) {
        let mut info = lock(&self.inner.info);
        info.width = width;
        info.height = height;
        info.stride = stride;
    }

    pub fn plane_count(&self) -> usize {
        lock(&self.inner.state).backing.plane_count()
    }

    pub fn bytes_used(&self, plane: usize) -> usize {
        lock(&self.inner.state).used.get(plane).copied().unwrap_or(0)
    }

    /// Sum of the valid bytes over all planes.
    pub fn payload_len(&self) -> usize {
        lock(&self.inner.state).used.iter().sum()
    }

    pub fn capacity(&self, plane: usize) -> Option<usize> {
        lock(&self.inner.state).backing.capacity(plane)
    }

    pub fn set_bytes_used(&self, plane: usize, used: usize) -> Result<()> {
        let mut state = lock(&self.inner.state);
        let have = state
            .backing
            .capacity(plane)
            .ok_or(Error::NullArgument("plane"))?;
        if used > have {
            return Err(Error::BufferTooSmall { need: used, have });
        }
        state.used[plane] = used;
        Ok(())
    }

    /// Runs `f` over the valid bytes of `plane`.
    ///
    /// Returns `None` if the plane does not exist or has no CPU mapping
    /// (caller-owned DMA-BUF descriptors).
    pub fn read_plane<R>(&self, plane: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let state = lock(&self.inner.state);
        let used = *state.used.get(plane)?;
        match &state.backing {
            Backing::Heap(planes) => Some(f(&planes[plane][..used])),
            Backing::Dma { buf, planes } => {
                let range = planes[plane];
                Some(buf.read(|data| f(&data[range.offset..range.offset + used])))
            }
            Backing::UserPtr(planes) => {
                let (ptr, _) = planes[plane];
                Some(f(unsafe { from_raw_parts(ptr as *const u8, used) }))
            }
            Backing::DmaFd { .. } => None,
        }
    }

    /// Runs `f` over the full capacity of `plane` for writing.
    pub fn write_plane<R>(&self, plane: usize, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut state = lock(&self.inner.state);
        if plane >= state.backing.plane_count() {
            return None;
        }
        match &mut state.backing {
            Backing::Heap(planes) => Some(f(&mut planes[plane])),
            Backing::Dma { buf, planes } => {
                let range = planes[plane];
                Some(buf.write(|data| f(&mut data[range.offset..range.offset + range.len])))
            }
            Backing::UserPtr(planes) => {
                let (ptr, len) = planes[plane];
                Some(f(unsafe { from_raw_parts_mut(ptr as *mut u8, len) }))
            }
            Backing::DmaFd { .. } => None,
        }
    }

    /// Copies the valid bytes of every plane, back to back.
    pub fn to_vec(&self) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(self.payload_len());
        for plane in 0..self.plane_count() {
            self.read_plane(plane, |data| out.extend_from_slice(data))?;
        }
        Some(out)
    }

    /// DMA-BUF descriptor with the byte offset and capacity of `plane`, for
    /// zero-copy submission.
    pub fn plane_fd(&self, plane: usize) -> Option<(RawFd, usize, usize)> {
        let state = lock(&self.inner.state);
        match &state.backing {
            Backing::Dma { buf, planes } => {
                planes.get(plane).map(|p| (buf.raw_fd(), p.offset, p.len))
            }
            Backing::DmaFd { fd, planes } => {
                planes.get(plane).map(|p| (fd.as_raw_fd(), p.offset, p.len))
            }
            _ => None,
        }
    }

    /// Process address and capacity of `plane`, for user-pointer submission.
    pub fn plane_ptr(&self, plane: usize) -> Option<(usize, usize)> {
        let state = lock(&self.inner.state);
        match &state.backing {
            Backing::Heap(planes) => planes.get(plane).map(|p| (p.as_ptr() as usize, p.len())),
            Backing::Dma { buf, planes } => planes
                .get(plane)
                .map(|p| (buf.as_ptr() as usize + p.offset, p.len)),
            Backing::UserPtr(planes) => planes.get(plane).copied(),
            Backing::DmaFd { .. } => None,
        }
    }

    /// Exports the DMA allocation of an internally allocated DMA buffer.
    pub fn dmabuf(&self) -> Option<io::Result<DmaBuf>> {
        let state = lock(&self.inner.state);
        match &state.backing {
            Backing::Dma { buf, .. } => Some(buf.dmabuf()),
            _ => None,
        }
    }
}

impl fmt::Debug for MediaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let info = lock(&self.inner.info).clone();
        f.debug_struct("MediaBuffer")
            .field("format", &info.format)
            .field("width", &info.width)
            .field("height", &info.height)
            .field("pts", &info.pts)
            .field("eos", &info.eos)
            .field("kind", &self.inner.kind)
            .field("origin", &self.inner.origin)
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl fmt::Display for MediaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let info = lock(&self.inner.info).clone();
        write!(
            f,
            "{}x{} {} pts:{} bytes:{}",
            info.width,
            info.height,
            info.format,
            info.pts,
            self.payload_len()
        )
    }
}
