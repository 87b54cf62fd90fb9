// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Safe seam over the kernel video device.
//!
//! [`Device`] lists every call the codec core makes against a stateful
//! mem2mem node, in plain Rust types. [`V4l2Device`] implements it over a
//! real `/dev/videoN` descriptor; tests substitute a recording fake so the
//! protocol state machine can be driven without hardware.

use std::{
    ffi::CStr,
    fmt,
    fs::OpenOptions,
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
    ptr::{null_mut, NonNull},
    slice::{from_raw_parts, from_raw_parts_mut},
    time::Duration,
};

use libc::{c_int, c_ulong, mmap, munmap, pollfd, timeval, MAP_FAILED, MAP_SHARED};
use nix::errno::Errno;
use tracing::{debug, warn};
use v4l2_sys::*;

use crate::{
    error::{Error, Result},
    fourcc::FourCC,
};

pub type IoctlResult<T> = std::result::Result<T, Errno>;

/// Kernel queue a buffer or format belongs to.
///
/// In V4L2 terms `Output` is the queue the application writes into (the
/// bitstream for a decoder, raw frames for an encoder) and `Capture` is the
/// queue it reads results from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Output,
    Capture,
    OutputMplane,
    CaptureMplane,
}

impl QueueType {
    pub fn output(multiplanar: bool) -> Self {
        if multiplanar {
            QueueType::OutputMplane
        } else {
            QueueType::Output
        }
    }

    pub fn capture(multiplanar: bool) -> Self {
        if multiplanar {
            QueueType::CaptureMplane
        } else {
            QueueType::Capture
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            QueueType::Output => V4L2_BUF_TYPE_VIDEO_OUTPUT,
            QueueType::Capture => V4L2_BUF_TYPE_VIDEO_CAPTURE,
            QueueType::OutputMplane => V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            QueueType::CaptureMplane => V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        }
    }

    pub fn is_multiplanar(self) -> bool {
        matches!(self, QueueType::OutputMplane | QueueType::CaptureMplane)
    }

    pub fn is_output(self) -> bool {
        matches!(self, QueueType::Output | QueueType::OutputMplane)
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            QueueType::Output => "output",
            QueueType::Capture => "capture",
            QueueType::OutputMplane => "output-mplane",
            QueueType::CaptureMplane => "capture-mplane",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Memory {
    #[default]
    Mmap,
    UserPtr,
    DmaBuf,
}

impl Memory {
    pub fn raw(self) -> u32 {
        match self {
            Memory::Mmap => V4L2_MEMORY_MMAP,
            Memory::UserPtr => V4L2_MEMORY_USERPTR,
            Memory::DmaBuf => V4L2_MEMORY_DMABUF,
        }
    }
}

/// Where the memory of one plane lives, depending on the queue memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneLocation {
    Offset(u32),
    UserPtr(usize),
    Fd(RawFd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneDescriptor {
    pub bytes_used: u32,
    pub length: u32,
    pub data_offset: u32,
    pub location: PlaneLocation,
}

impl PlaneDescriptor {
    pub fn new(memory: Memory) -> Self {
        let location = match memory {
            Memory::Mmap => PlaneLocation::Offset(0),
            Memory::UserPtr => PlaneLocation::UserPtr(0),
            Memory::DmaBuf => PlaneLocation::Fd(-1),
        };
        Self {
            bytes_used: 0,
            length: 0,
            data_offset: 0,
            location,
        }
    }
}

/// Safe copy of a `struct v4l2_buffer`.
///
/// `timestamp` is the caller pts; it travels through the kernel unchanged
/// (split into seconds and microseconds) so decoded frames can be matched to
/// their input. `vendor_flags` is carried in the otherwise unused
/// `reserved2` word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub index: u32,
    pub queue: QueueType,
    pub memory: Memory,
    pub flags: u32,
    pub field: u32,
    pub timestamp: u64,
    pub sequence: u32,
    pub vendor_flags: u32,
    pub planes: Vec<PlaneDescriptor>,
}

impl BufferDescriptor {
    pub fn new(queue: QueueType, memory: Memory, index: u32, num_planes: usize) -> Self {
        Self {
            index,
            queue,
            memory,
            flags: 0,
            field: V4L2_FIELD_NONE,
            timestamp: 0,
            sequence: 0,
            vendor_flags: 0,
            planes: vec![PlaneDescriptor::new(memory); num_planes.max(1)],
        }
    }

    pub fn bytes_used(&self) -> usize {
        self.planes.iter().map(|p| p.bytes_used as usize).sum()
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneFormat {
    pub bytes_per_line: u32,
    pub size_image: u32,
}

/// Safe copy of the pixel part of a `struct v4l2_format`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixFormat {
    pub queue: QueueType,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pub field: u32,
    pub colorspace: u32,
    pub planes: Vec<PlaneFormat>,
}

impl PixFormat {
    pub fn new(queue: QueueType, fourcc: FourCC, width: u32, height: u32) -> Self {
        Self {
            queue,
            width,
            height,
            fourcc,
            field: V4L2_FIELD_NONE,
            colorspace: 0,
            planes: vec![PlaneFormat::default()],
        }
    }

    pub fn size_image(&self) -> usize {
        self.planes.iter().map(|p| p.size_image as usize).sum()
    }

    pub fn stride(&self) -> u32 {
        self.planes.first().map(|p| p.bytes_per_line).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// Readiness conditions of the device descriptor, also used as the interest
/// set passed to [`Device::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// The input queue can take another buffer.
    pub input: bool,
    /// A completed buffer is waiting on the output queue.
    pub output: bool,
    /// An asynchronous event is pending.
    pub event: bool,
    pub error: bool,
}

impl Readiness {
    pub fn all() -> Self {
        Self {
            input: true,
            output: true,
            event: true,
            error: false,
        }
    }

    pub fn events() -> Self {
        Self {
            event: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.input || self.output || self.event || self.error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SourceChange { changes: u32 },
    Eos,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEvent {
    pub kind: EventKind,
    pub pending: u32,
}

impl DeviceEvent {
    pub fn is_resolution_change(&self) -> bool {
        matches!(self.kind, EventKind::SourceChange { changes } if changes & V4L2_EVENT_SRC_CH_RESOLUTION != 0)
    }
}

/// A plane mapped into the process.
pub enum Mapping {
    /// Driver memory mapped with `mmap`, unmapped on drop.
    Mmap { ptr: NonNull<u8>, len: usize },
    /// Process memory standing in for driver memory.
    Anonymous(Box<[u8]>),
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub fn anonymous(len: usize) -> Self {
        Mapping::Anonymous(vec![0; len].into_boxed_slice())
    }

    pub fn len(&self) -> usize {
        match self {
            Mapping::Mmap { len, .. } => *len,
            Mapping::Anonymous(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Mapping::Mmap { ptr, len } => unsafe { from_raw_parts(ptr.as_ptr(), *len) },
            Mapping::Anonymous(data) => data,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Mapping::Mmap { ptr, len } => unsafe { from_raw_parts_mut(ptr.as_ptr(), *len) },
            Mapping::Anonymous(data) => data,
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Mapping::Mmap { ptr, len } = self {
            if unsafe { munmap(ptr.as_ptr().cast(), *len) } != 0 {
                warn!("munmap failed: {}", Errno::last());
            }
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mapping::Mmap { ptr, len } => write!(f, "Mapping::Mmap({:p}, {len})", ptr.as_ptr()),
            Mapping::Anonymous(data) => write!(f, "Mapping::Anonymous({})", data.len()),
        }
    }
}

/// Kernel calls used by the codec core.
///
/// Implementations report the raw errno; callers attach context. `EAGAIN`
/// from [`Device::dqbuf`] means no buffer has completed yet and `EPIPE`
/// means the last buffer of the stream was already dequeued.
pub trait Device: Send + Sync {
    /// Whether queues use the multi-planar API.
    fn is_multiplanar(&self) -> bool;

    /// Requests `count` buffers and returns the granted count. A count of
    /// zero frees every buffer of the queue.
    fn reqbufs(&self, queue: QueueType, memory: Memory, count: u32) -> IoctlResult<u32>;
    fn querybuf(&self, queue: QueueType, memory: Memory, index: u32)
        -> IoctlResult<BufferDescriptor>;
    fn qbuf(&self, desc: &BufferDescriptor) -> IoctlResult<()>;
    fn dqbuf(&self, queue: QueueType, memory: Memory) -> IoctlResult<BufferDescriptor>;
    fn streamon(&self, queue: QueueType) -> IoctlResult<()>;
    fn streamoff(&self, queue: QueueType) -> IoctlResult<()>;

    fn g_fmt(&self, queue: QueueType) -> IoctlResult<PixFormat>;
    fn s_fmt(&self, fmt: &PixFormat) -> IoctlResult<PixFormat>;
    /// Negotiates without committing.
    fn try_fmt(&self, fmt: &PixFormat) -> IoctlResult<PixFormat>;

    fn g_ctrl(&self, id: u32) -> IoctlResult<i32>;
    fn s_ctrl(&self, id: u32, value: i32) -> IoctlResult<()>;
    /// Sets a compound (pointer) control carrying `payload`.
    fn s_ext_ctrl(&self, id: u32, payload: &[u8]) -> IoctlResult<()>;

    fn g_selection(&self, queue: QueueType, target: u32) -> IoctlResult<Rect>;
    fn s_selection(&self, queue: QueueType, target: u32, rect: Rect) -> IoctlResult<Rect>;

    fn encoder_cmd(&self, cmd: u32, try_only: bool) -> IoctlResult<()>;
    fn decoder_cmd(&self, cmd: u32, try_only: bool) -> IoctlResult<()>;

    fn subscribe_event(&self, kind: u32) -> IoctlResult<()>;
    /// Dequeues one pending event, `ENOENT` when none is pending.
    fn dqevent(&self) -> IoctlResult<DeviceEvent>;

    /// Waits up to `timeout` for any condition in `interest`.
    fn poll(&self, interest: Readiness, timeout: Duration) -> IoctlResult<Readiness>;

    /// Maps the MMAP plane at `offset` into the process.
    fn map_plane(&self, offset: u32, len: usize) -> IoctlResult<Mapping>;
}

/// A V4L2 mem2mem device node.
pub struct V4l2Device {
    fd: OwnedFd,
    path: PathBuf,
    driver: String,
    card: String,
    caps: u32,
}

fn c_string(raw: &[u8]) -> String {
    CStr::from_bytes_until_nul(raw)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl V4l2Device {
    /// Opens `path` non-blocking and verifies it is a streaming mem2mem node.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|source| Error::Open {
                path: path.clone(),
                source,
            })?;
        let fd = OwnedFd::from(file);

        let mut cap = v4l2_capability::default();
        unsafe { vidioc_querycap(fd.as_raw_fd(), &mut cap) }
            .map_err(Error::ioctl("VIDIOC_QUERYCAP"))?;
        let caps = if cap.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };

        let m2m = V4L2_CAP_VIDEO_M2M | V4L2_CAP_VIDEO_M2M_MPLANE;
        let split = caps & (V4L2_CAP_VIDEO_CAPTURE | V4L2_CAP_VIDEO_CAPTURE_MPLANE) != 0
            && caps & (V4L2_CAP_VIDEO_OUTPUT | V4L2_CAP_VIDEO_OUTPUT_MPLANE) != 0;
        if caps & m2m == 0 && !split {
            return Err(Error::InvalidState("device is not a mem2mem codec"));
        }
        if caps & V4L2_CAP_STREAMING == 0 {
            return Err(Error::InvalidState("device does not support streaming"));
        }

        let dev = Self {
            fd,
            path,
            driver: c_string(&cap.driver),
            card: c_string(&cap.card),
            caps,
        };
        debug!(
            "opened {:?} driver:{} card:{} caps:{:#x} mplane:{}",
            dev.path,
            dev.driver,
            dev.card,
            dev.caps,
            dev.is_multiplanar()
        );
        Ok(dev)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl fmt::Debug for V4l2Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("V4l2Device")
            .field("path", &self.path)
            .field("driver", &self.driver)
            .field("card", &self.card)
            .finish()
    }
}

fn pts_to_timeval(pts: u64) -> timeval {
    timeval {
        tv_sec: (pts / 1_000_000) as _,
        tv_usec: (pts % 1_000_000) as _,
    }
}

fn timeval_to_pts(tv: &timeval) -> u64 {
    tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64
}

fn queue_from_raw(raw: u32) -> QueueType {
    match raw {
        V4L2_BUF_TYPE_VIDEO_OUTPUT => QueueType::Output,
        V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE => QueueType::OutputMplane,
        V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE => QueueType::CaptureMplane,
        _ => QueueType::Capture,
    }
}

fn location(memory: Memory, offset: u32, userptr: c_ulong, fd: i32) -> PlaneLocation {
    match memory {
        Memory::Mmap => PlaneLocation::Offset(offset),
        Memory::UserPtr => PlaneLocation::UserPtr(userptr as usize),
        Memory::DmaBuf => PlaneLocation::Fd(fd),
    }
}

/// Builds the raw descriptor. `planes` must outlive every use of the result.
fn raw_buffer(desc: &BufferDescriptor, planes: &mut [v4l2_plane; VIDEO_MAX_PLANES]) -> v4l2_buffer {
    let mut buf = v4l2_buffer {
        index: desc.index,
        type_: desc.queue.raw(),
        flags: desc.flags,
        field: desc.field,
        timestamp: pts_to_timeval(desc.timestamp),
        memory: desc.memory.raw(),
        reserved2: desc.vendor_flags,
        ..Default::default()
    };
    if desc.queue.is_multiplanar() {
        let count = desc.planes.len().min(VIDEO_MAX_PLANES);
        for (raw, plane) in planes.iter_mut().zip(&desc.planes) {
            raw.bytesused = plane.bytes_used;
            raw.length = plane.length;
            raw.data_offset = plane.data_offset;
            raw.m = match plane.location {
                PlaneLocation::Offset(offset) => v4l2_plane_m { mem_offset: offset },
                PlaneLocation::UserPtr(ptr) => v4l2_plane_m {
                    userptr: ptr as c_ulong,
                },
                PlaneLocation::Fd(fd) => v4l2_plane_m { fd },
            };
        }
        buf.length = count as u32;
        buf.m.planes = planes.as_mut_ptr();
    } else if let Some(plane) = desc.planes.first() {
        buf.bytesused = plane.bytes_used;
        buf.length = plane.length;
        buf.m = match plane.location {
            PlaneLocation::Offset(offset) => v4l2_buffer_m { offset },
            PlaneLocation::UserPtr(ptr) => v4l2_buffer_m {
                userptr: ptr as c_ulong,
            },
            PlaneLocation::Fd(fd) => v4l2_buffer_m { fd },
        };
    }
    buf
}

fn from_raw_buffer(
    buf: &v4l2_buffer,
    planes: &[v4l2_plane; VIDEO_MAX_PLANES],
    queue: QueueType,
    memory: Memory,
) -> BufferDescriptor {
    let descs = if queue.is_multiplanar() {
        planes
            .iter()
            .take((buf.length as usize).min(VIDEO_MAX_PLANES))
            .map(|p| PlaneDescriptor {
                bytes_used: p.bytesused,
                length: p.length,
                data_offset: p.data_offset,
                location: unsafe { location(memory, p.m.mem_offset, p.m.userptr, p.m.fd) },
            })
            .collect()
    } else {
        vec![PlaneDescriptor {
            bytes_used: buf.bytesused,
            length: buf.length,
            data_offset: 0,
            location: unsafe { location(memory, buf.m.offset, buf.m.userptr, buf.m.fd) },
        }]
    };
    BufferDescriptor {
        index: buf.index,
        queue: queue_from_raw(buf.type_),
        memory,
        flags: buf.flags,
        field: buf.field,
        timestamp: timeval_to_pts(&buf.timestamp),
        sequence: buf.sequence,
        vendor_flags: buf.reserved2,
        planes: descs,
    }
}

fn raw_format(fmt: &PixFormat) -> v4l2_format {
    let mut raw = v4l2_format {
        type_: fmt.queue.raw(),
        ..Default::default()
    };
    if fmt.queue.is_multiplanar() {
        let mut mp = v4l2_pix_format_mplane {
            width: fmt.width,
            height: fmt.height,
            pixelformat: fmt.fourcc.to_u32(),
            field: fmt.field,
            colorspace: fmt.colorspace,
            num_planes: fmt.planes.len().min(VIDEO_MAX_PLANES) as u8,
            ..Default::default()
        };
        for (raw, plane) in mp.plane_fmt.iter_mut().zip(&fmt.planes) {
            raw.bytesperline = plane.bytes_per_line;
            raw.sizeimage = plane.size_image;
        }
        raw.fmt.pix_mp = mp;
    } else {
        let plane = fmt.planes.first().copied().unwrap_or_default();
        raw.fmt.pix = v4l2_pix_format {
            width: fmt.width,
            height: fmt.height,
            pixelformat: fmt.fourcc.to_u32(),
            field: fmt.field,
            bytesperline: plane.bytes_per_line,
            sizeimage: plane.size_image,
            colorspace: fmt.colorspace,
            ..Default::default()
        };
    }
    raw
}

fn from_raw_format(raw: &v4l2_format) -> PixFormat {
    let queue = queue_from_raw(raw.type_);
    if queue.is_multiplanar() {
        let mp = unsafe { raw.fmt.pix_mp };
        PixFormat {
            queue,
            width: mp.width,
            height: mp.height,
            fourcc: FourCC::from_u32(mp.pixelformat),
            field: mp.field,
            colorspace: mp.colorspace,
            planes: mp
                .plane_fmt
                .iter()
                .take((mp.num_planes as usize).clamp(1, VIDEO_MAX_PLANES))
                .map(|p| PlaneFormat {
                    bytes_per_line: p.bytesperline,
                    size_image: p.sizeimage,
                })
                .collect(),
        }
    } else {
        let pix = unsafe { raw.fmt.pix };
        PixFormat {
            queue,
            width: pix.width,
            height: pix.height,
            fourcc: FourCC::from_u32(pix.pixelformat),
            field: pix.field,
            colorspace: pix.colorspace,
            planes: vec![PlaneFormat {
                bytes_per_line: pix.bytesperline,
                size_image: pix.sizeimage,
            }],
        }
    }
}

impl Device for V4l2Device {
    fn is_multiplanar(&self) -> bool {
        self.caps
            & (V4L2_CAP_VIDEO_M2M_MPLANE
                | V4L2_CAP_VIDEO_CAPTURE_MPLANE
                | V4L2_CAP_VIDEO_OUTPUT_MPLANE)
            != 0
    }

    fn reqbufs(&self, queue: QueueType, memory: Memory, count: u32) -> IoctlResult<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: queue.raw(),
            memory: memory.raw(),
            ..Default::default()
        };
        unsafe { vidioc_reqbufs(self.raw(), &mut req) }?;
        Ok(req.count)
    }

    fn querybuf(
        &self,
        queue: QueueType,
        memory: Memory,
        index: u32,
    ) -> IoctlResult<BufferDescriptor> {
        let mut planes = [v4l2_plane::default(); VIDEO_MAX_PLANES];
        let mut buf = v4l2_buffer {
            index,
            type_: queue.raw(),
            memory: memory.raw(),
            ..Default::default()
        };
        if queue.is_multiplanar() {
            buf.length = VIDEO_MAX_PLANES as u32;
            buf.m.planes = planes.as_mut_ptr();
        }
        unsafe { vidioc_querybuf(self.raw(), &mut buf) }?;
        Ok(from_raw_buffer(&buf, &planes, queue, memory))
    }

    fn qbuf(&self, desc: &BufferDescriptor) -> IoctlResult<()> {
        let mut planes = [v4l2_plane::default(); VIDEO_MAX_PLANES];
        let mut buf = raw_buffer(desc, &mut planes);
        unsafe { vidioc_qbuf(self.raw(), &mut buf) }?;
        Ok(())
    }

    fn dqbuf(&self, queue: QueueType, memory: Memory) -> IoctlResult<BufferDescriptor> {
        let mut planes = [v4l2_plane::default(); VIDEO_MAX_PLANES];
        let mut buf = v4l2_buffer {
            type_: queue.raw(),
            memory: memory.raw(),
            ..Default::default()
        };
        if queue.is_multiplanar() {
            buf.length = VIDEO_MAX_PLANES as u32;
            buf.m.planes = planes.as_mut_ptr();
        }
        unsafe { vidioc_dqbuf(self.raw(), &mut buf) }?;
        Ok(from_raw_buffer(&buf, &planes, queue, memory))
    }

    fn streamon(&self, queue: QueueType) -> IoctlResult<()> {
        let kind = queue.raw() as c_int;
        unsafe { vidioc_streamon(self.raw(), &kind) }?;
        Ok(())
    }

    fn streamoff(&self, queue: QueueType) -> IoctlResult<()> {
        let kind = queue.raw() as c_int;
        unsafe { vidioc_streamoff(self.raw(), &kind) }?;
        Ok(())
    }

    fn g_fmt(&self, queue: QueueType) -> IoctlResult<PixFormat> {
        let mut raw = v4l2_format {
            type_: queue.raw(),
            ..Default::default()
        };
        unsafe { vidioc_g_fmt(self.raw(), &mut raw) }?;
        Ok(from_raw_format(&raw))
    }

    fn s_fmt(&self, fmt: &PixFormat) -> IoctlResult<PixFormat> {
        let mut raw = raw_format(fmt);
        unsafe { vidioc_s_fmt(self.raw(), &mut raw) }?;
        Ok(from_raw_format(&raw))
    }

    fn try_fmt(&self, fmt: &PixFormat) -> IoctlResult<PixFormat> {
        let mut raw = raw_format(fmt);
        unsafe { vidioc_try_fmt(self.raw(), &mut raw) }?;
        Ok(from_raw_format(&raw))
    }

    fn g_ctrl(&self, id: u32) -> IoctlResult<i32> {
        let mut ctrl = v4l2_control { id, value: 0 };
        unsafe { vidioc_g_ctrl(self.raw(), &mut ctrl) }?;
        Ok(ctrl.value)
    }

    fn s_ctrl(&self, id: u32, value: i32) -> IoctlResult<()> {
        let mut ctrl = v4l2_control { id, value };
        unsafe { vidioc_s_ctrl(self.raw(), &mut ctrl) }?;
        Ok(())
    }

    fn s_ext_ctrl(&self, id: u32, payload: &[u8]) -> IoctlResult<()> {
        let mut data = payload.to_vec();
        let mut ctrl = v4l2_ext_control {
            id,
            size: data.len() as u32,
            reserved2: [0],
            value: v4l2_ext_control_value {
                ptr: data.as_mut_ptr().cast(),
            },
        };
        let mut ctrls = v4l2_ext_controls {
            which: 0,
            count: 1,
            error_idx: 0,
            request_fd: 0,
            reserved: [0],
            controls: &mut ctrl,
        };
        unsafe { vidioc_s_ext_ctrls(self.raw(), &mut ctrls) }?;
        Ok(())
    }

    fn g_selection(&self, queue: QueueType, target: u32) -> IoctlResult<Rect> {
        let mut sel = v4l2_selection {
            type_: queue.raw(),
            target,
            ..Default::default()
        };
        unsafe { vidioc_g_selection(self.raw(), &mut sel) }?;
        Ok(Rect {
            left: sel.r.left,
            top: sel.r.top,
            width: sel.r.width,
            height: sel.r.height,
        })
    }

    fn s_selection(&self, queue: QueueType, target: u32, rect: Rect) -> IoctlResult<Rect> {
        let mut sel = v4l2_selection {
            type_: queue.raw(),
            target,
            r: v4l2_rect {
                left: rect.left,
                top: rect.top,
                width: rect.width,
                height: rect.height,
            },
            ..Default::default()
        };
        unsafe { vidioc_s_selection(self.raw(), &mut sel) }?;
        Ok(Rect {
            left: sel.r.left,
            top: sel.r.top,
            width: sel.r.width,
            height: sel.r.height,
        })
    }

    fn encoder_cmd(&self, cmd: u32, try_only: bool) -> IoctlResult<()> {
        let mut arg = v4l2_encoder_cmd {
            cmd,
            ..Default::default()
        };
        if try_only {
            unsafe { vidioc_try_encoder_cmd(self.raw(), &mut arg) }?;
        } else {
            unsafe { vidioc_encoder_cmd(self.raw(), &mut arg) }?;
        }
        Ok(())
    }

    fn decoder_cmd(&self, cmd: u32, try_only: bool) -> IoctlResult<()> {
        let mut arg = v4l2_decoder_cmd {
            cmd,
            ..Default::default()
        };
        if try_only {
            unsafe { vidioc_try_decoder_cmd(self.raw(), &mut arg) }?;
        } else {
            unsafe { vidioc_decoder_cmd(self.raw(), &mut arg) }?;
        }
        Ok(())
    }

    fn subscribe_event(&self, kind: u32) -> IoctlResult<()> {
        let sub = v4l2_event_subscription {
            type_: kind,
            ..Default::default()
        };
        unsafe { vidioc_subscribe_event(self.raw(), &sub) }?;
        Ok(())
    }

    fn dqevent(&self) -> IoctlResult<DeviceEvent> {
        let mut ev = v4l2_event::default();
        unsafe { vidioc_dqevent(self.raw(), &mut ev) }?;
        let kind = match ev.type_ {
            V4L2_EVENT_SOURCE_CHANGE => EventKind::SourceChange {
                changes: ev.src_changes(),
            },
            V4L2_EVENT_EOS => EventKind::Eos,
            other => EventKind::Other(other),
        };
        Ok(DeviceEvent {
            kind,
            pending: ev.pending,
        })
    }

    fn poll(&self, interest: Readiness, timeout: Duration) -> IoctlResult<Readiness> {
        let mut events = 0;
        if interest.input {
            events |= libc::POLLOUT;
        }
        if interest.output {
            events |= libc::POLLIN;
        }
        if interest.event {
            events |= libc::POLLPRI;
        }
        let mut pfd = pollfd {
            fd: self.raw(),
            events,
            revents: 0,
        };
        let ms = timeout.as_millis().min(c_int::MAX as u128) as c_int;
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        if ret < 0 {
            return Err(Errno::last());
        }
        Ok(Readiness {
            input: pfd.revents & libc::POLLOUT != 0,
            output: pfd.revents & libc::POLLIN != 0,
            event: pfd.revents & libc::POLLPRI != 0,
            error: pfd.revents & libc::POLLERR != 0,
        })
    }

    fn map_plane(&self, offset: u32, len: usize) -> IoctlResult<Mapping> {
        let ptr = unsafe {
            mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_SHARED,
                self.raw(),
                offset as libc::off_t,
            )
        };
        if ptr == MAP_FAILED {
            return Err(Errno::last());
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(Errno::ENOMEM)?;
        Ok(Mapping::Mmap { ptr, len })
    }
}
