// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! One slot of a kernel buffer queue.
//!
//! A [`Buffer`] is owned either by the application or by the kernel. The
//! owner only changes on a successful queue (application to kernel) or
//! dequeue (kernel to application), both driven by [`crate::port::Port`].
//! Plane memory is never handed out while the kernel owns the slot.

use std::os::fd::RawFd;

use tracing::{trace, warn};
use v4l2_sys::{
    V4L2_BUF_FLAG_ERROR, V4L2_BUF_FLAG_KEYFRAME, V4L2_BUF_FLAG_LAST, V4L2_CID_VENDOR_LTR_MODE,
    V4L2_CID_VENDOR_QP_EPR, V4L2_CID_VENDOR_ROI, V4L2_FIELD_INTERLACED, V4L2_FIELD_NONE,
    V4L2_SEL_TGT_CROP,
};

use crate::{
    device::{BufferDescriptor, Device, Mapping, Memory, PlaneLocation, QueueType, Rect},
    error::{Error, Result},
    media::MediaBuffer,
};

pub const VENDOR_FLAG_INTERLACED: u32 = 1 << 0;
pub const VENDOR_FLAG_ROTATE_90: u32 = 1 << 1;
pub const VENDOR_FLAG_ROTATE_180: u32 = 1 << 2;
pub const VENDOR_FLAG_HFLIP: u32 = 1 << 3;
pub const VENDOR_FLAG_VFLIP: u32 = 1 << 4;
pub const VENDOR_FLAG_DOWNSCALE: u32 = 1 << 5;
pub const VENDOR_FLAG_ROI: u32 = 1 << 6;
pub const VENDOR_FLAG_QP_EPR: u32 = 1 << 7;

/// Image rotation applied by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    /// No rotation (0 degrees)
    #[default]
    Rotation0,
    /// Rotate 90 degrees clockwise
    Rotation90,
    /// Rotate 180 degrees
    Rotation180,
    /// Rotate 270 degrees clockwise (90 degrees counter-clockwise)
    Rotation270,
}

impl Rotation {
    pub fn degrees(self) -> i32 {
        match self {
            Rotation::Rotation0 => 0,
            Rotation::Rotation90 => 90,
            Rotation::Rotation180 => 180,
            Rotation::Rotation270 => 270,
        }
    }

    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Rotation0),
            90 => Some(Rotation::Rotation90),
            180 => Some(Rotation::Rotation180),
            270 => Some(Rotation::Rotation270),
            _ => None,
        }
    }
}

/// Image mirroring applied by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mirror {
    /// No mirroring
    #[default]
    None,
    /// Flip horizontally (left-right)
    Horizontal,
    /// Flip vertically (top-bottom)
    Vertical,
    /// Flip both horizontally and vertically (180-degree rotation)
    Both,
}

impl Mirror {
    pub fn hflip(self) -> bool {
        matches!(self, Mirror::Horizontal | Mirror::Both)
    }

    pub fn vflip(self) -> bool {
        matches!(self, Mirror::Vertical | Mirror::Both)
    }
}

/// Encoder region of interest with its QP delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Roi {
    pub rect: Rect,
    pub qp_delta: i32,
}

impl Roi {
    /// Payload of the vendor ROI control: left, top, width, height and the
    /// QP delta as little-endian 32-bit words.
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[0..4].copy_from_slice(&self.rect.left.to_le_bytes());
        out[4..8].copy_from_slice(&self.rect.top.to_le_bytes());
        out[8..12].copy_from_slice(&self.rect.width.to_le_bytes());
        out[12..16].copy_from_slice(&self.rect.height.to_le_bytes());
        out[16..20].copy_from_slice(&self.qp_delta.to_le_bytes());
        out
    }
}

/// Per-slot configuration applied when the slot is queued.
///
/// `crop`, `roi`, `qp` and `ltr` are one-shot: they are consumed by the next
/// queue operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideConfig {
    pub interlaced: bool,
    pub rotation: Rotation,
    pub mirror: Mirror,
    pub downscale: bool,
    pub crop: Option<Rect>,
    pub roi: Option<Roi>,
    pub qp: Option<i32>,
    pub ltr: Option<i32>,
}

impl SideConfig {
    pub fn vendor_flags(&self) -> u32 {
        let mut flags = 0;
        if self.interlaced {
            flags |= VENDOR_FLAG_INTERLACED;
        }
        flags |= match self.rotation {
            Rotation::Rotation0 => 0,
            Rotation::Rotation90 => VENDOR_FLAG_ROTATE_90,
            Rotation::Rotation180 => VENDOR_FLAG_ROTATE_180,
            Rotation::Rotation270 => VENDOR_FLAG_ROTATE_90 | VENDOR_FLAG_ROTATE_180,
        };
        if self.mirror.hflip() {
            flags |= VENDOR_FLAG_HFLIP;
        }
        if self.mirror.vflip() {
            flags |= VENDOR_FLAG_VFLIP;
        }
        if self.downscale {
            flags |= VENDOR_FLAG_DOWNSCALE;
        }
        if self.roi.is_some() {
            flags |= VENDOR_FLAG_ROI;
        }
        if self.qp.is_some() {
            flags |= VENDOR_FLAG_QP_EPR;
        }
        flags
    }
}

pub struct Buffer {
    desc: BufferDescriptor,
    mappings: Vec<Option<Mapping>>,
    queued: bool,
    side: SideConfig,
    crop: Option<Rect>,
    attached: Option<MediaBuffer>,
}

impl Buffer {
    /// Builds a slot from a queried descriptor, mapping MMAP planes.
    pub fn create(device: &dyn Device, desc: BufferDescriptor) -> Result<Self> {
        let mut mappings = Vec::with_capacity(desc.planes.len());
        for plane in &desc.planes {
            let mapping = match (desc.memory, plane.location) {
                (Memory::Mmap, PlaneLocation::Offset(offset)) if plane.length > 0 => Some(
                    device
                        .map_plane(offset, plane.length as usize)
                        .map_err(Error::ioctl("mmap"))?,
                ),
                _ => None,
            };
            mappings.push(mapping);
        }
        trace!(
            "buffer {} {} planes:{} created",
            desc.index,
            desc.queue,
            desc.planes.len()
        );
        Ok(Self {
            desc,
            mappings,
            queued: false,
            side: SideConfig::default(),
            crop: None,
            attached: None,
        })
    }

    pub fn index(&self) -> u32 {
        self.desc.index
    }

    pub fn queue_type(&self) -> QueueType {
        self.desc.queue
    }

    pub fn memory(&self) -> Memory {
        self.desc.memory
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.desc
    }

    pub(crate) fn descriptor_mut(&mut self) -> &mut BufferDescriptor {
        &mut self.desc
    }

    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub(crate) fn set_queued(&mut self, queued: bool) {
        self.queued = queued;
    }

    pub fn plane_count(&self) -> usize {
        self.desc.planes.len()
    }

    /// Capacity of `plane` in bytes.
    pub fn plane_len(&self, plane: usize) -> Option<usize> {
        self.desc.planes.get(plane).map(|p| p.length as usize)
    }

    pub fn bytes_used(&self) -> usize {
        self.desc.bytes_used()
    }

    pub fn timestamp(&self) -> u64 {
        self.desc.timestamp
    }

    pub fn set_timestamp(&mut self, pts: u64) {
        self.desc.timestamp = pts;
    }

    pub fn flags(&self) -> u32 {
        self.desc.flags
    }

    pub fn is_last(&self) -> bool {
        self.desc.has_flag(V4L2_BUF_FLAG_LAST)
    }

    pub fn is_error(&self) -> bool {
        self.desc.has_flag(V4L2_BUF_FLAG_ERROR)
    }

    pub fn is_keyframe(&self) -> bool {
        self.desc.has_flag(V4L2_BUF_FLAG_KEYFRAME)
    }

    /// Marks the slot as the end-of-stream unit.
    pub fn set_eos(&mut self, eos: bool) {
        if eos {
            self.desc.flags |= V4L2_BUF_FLAG_LAST;
        } else {
            self.desc.flags &= !V4L2_BUF_FLAG_LAST;
        }
    }

    /// Crop rectangle reported by the driver on the last dequeue.
    pub fn crop(&self) -> Option<Rect> {
        self.crop
    }

    pub(crate) fn set_crop(&mut self, crop: Option<Rect>) {
        self.crop = crop;
    }

    pub fn side(&self) -> &SideConfig {
        &self.side
    }

    pub fn side_mut(&mut self) -> &mut SideConfig {
        &mut self.side
    }

    fn check_owned(&self) -> Result<()> {
        if self.queued {
            Err(Error::BufferQueued(self.desc.index))
        } else {
            Ok(())
        }
    }

    pub fn set_bytes_used(&mut self, plane: usize, used: usize) -> Result<()> {
        self.check_owned()?;
        let index = self.desc.index;
        let count = self.desc.planes.len();
        let p = self
            .desc
            .planes
            .get_mut(plane)
            .ok_or(Error::InvalidIndex { index, count })?;
        if p.length > 0 && used > p.length as usize {
            return Err(Error::BufferTooSmall {
                need: used,
                have: p.length as usize,
            });
        }
        p.bytes_used = used as u32;
        Ok(())
    }

    /// Runs `f` over the valid bytes of a mapped plane.
    pub fn with_plane<R>(&self, plane: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.check_owned()?;
        let used = self.desc.planes.get(plane).map(|p| p.bytes_used as usize);
        match (self.mappings.get(plane), used) {
            (Some(Some(map)), Some(used)) => {
                let data = map.as_slice();
                Ok(f(&data[..used.min(data.len())]))
            }
            _ => Err(Error::InvalidState("plane is not mapped")),
        }
    }

    /// Runs `f` over the whole capacity of a mapped plane.
    pub fn with_plane_mut<R>(&mut self, plane: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.check_owned()?;
        match self.mappings.get_mut(plane) {
            Some(Some(map)) => Ok(f(map.as_mut_slice())),
            _ => Err(Error::InvalidState("plane is not mapped")),
        }
    }

    /// Copies `data` into the mapped planes in order, filling each one to
    /// capacity before moving on, and sets the bytes used.
    pub fn write_payload(&mut self, data: &[u8]) -> Result<()> {
        self.check_owned()?;
        let capacity: usize = self
            .mappings
            .iter()
            .map(|m| m.as_ref().map(Mapping::len).unwrap_or(0))
            .sum();
        if data.len() > capacity {
            return Err(Error::BufferTooSmall {
                need: data.len(),
                have: capacity,
            });
        }
        let mut rest = data;
        for (plane, map) in self.desc.planes.iter_mut().zip(self.mappings.iter_mut()) {
            let n = match map {
                Some(map) => {
                    let n = rest.len().min(map.len());
                    map.as_mut_slice()[..n].copy_from_slice(&rest[..n]);
                    n
                }
                None => 0,
            };
            plane.bytes_used = n as u32;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Copies the valid bytes of every mapped plane.
    pub fn read_payload(&self) -> Result<Vec<Vec<u8>>> {
        (0..self.plane_count())
            .map(|plane| self.with_plane(plane, <[u8]>::to_vec))
            .collect()
    }

    /// Points `plane` at caller memory for a USERPTR queue.
    pub fn set_user_ptr(&mut self, plane: usize, ptr: usize, len: usize) -> Result<()> {
        self.check_owned()?;
        if self.desc.memory != Memory::UserPtr {
            return Err(Error::InvalidState("queue does not use user pointers"));
        }
        if ptr == 0 {
            return Err(Error::NullArgument("user pointer"));
        }
        let index = self.desc.index;
        let count = self.desc.planes.len();
        let p = self
            .desc
            .planes
            .get_mut(plane)
            .ok_or(Error::InvalidIndex { index, count })?;
        p.location = PlaneLocation::UserPtr(ptr);
        p.length = len as u32;
        Ok(())
    }

    /// Points `plane` at a caller DMA-BUF for a DMABUF queue. `offset` is
    /// where the plane data starts inside the buffer.
    pub fn set_external_dma_fd(
        &mut self,
        plane: usize,
        fd: RawFd,
        offset: usize,
        len: usize,
    ) -> Result<()> {
        self.check_owned()?;
        if self.desc.memory != Memory::DmaBuf {
            return Err(Error::InvalidState("queue does not use dma-buf"));
        }
        if fd < 0 {
            return Err(Error::NullArgument("dma-buf descriptor"));
        }
        let index = self.desc.index;
        let count = self.desc.planes.len();
        let p = self
            .desc
            .planes
            .get_mut(plane)
            .ok_or(Error::InvalidIndex { index, count })?;
        p.location = PlaneLocation::Fd(fd);
        p.data_offset = offset as u32;
        p.length = (offset + len) as u32;
        Ok(())
    }

    /// Attaches a media buffer for zero-copy submission. The slot keeps a
    /// reference until [`Buffer::detach`], so the memory outlives the kernel's
    /// use of it.
    pub fn attach(&mut self, media: MediaBuffer) -> Result<()> {
        self.check_owned()?;
        let planes = self.plane_count();
        let separate = self.desc.queue.is_multiplanar() && media.plane_count() >= planes;
        match self.desc.memory {
            Memory::UserPtr => {
                if separate {
                    for plane in 0..planes {
                        let (ptr, len) = media
                            .plane_ptr(plane)
                            .ok_or(Error::InvalidState("media has no cpu mapping"))?;
                        self.set_user_ptr(plane, ptr, len)?;
                        self.desc.planes[plane].bytes_used = media.bytes_used(plane) as u32;
                    }
                } else {
                    let (ptr, _) = media
                        .plane_ptr(0)
                        .ok_or(Error::InvalidState("media has no cpu mapping"))?;
                    let total = (0..media.plane_count())
                        .filter_map(|p| media.capacity(p))
                        .sum();
                    self.set_user_ptr(0, ptr, total)?;
                    self.desc.planes[0].bytes_used = media.payload_len() as u32;
                }
            }
            Memory::DmaBuf => {
                if separate {
                    for plane in 0..planes {
                        let (fd, offset, len) = media
                            .plane_fd(plane)
                            .ok_or(Error::InvalidState("media is not dma-buf backed"))?;
                        self.set_external_dma_fd(plane, fd, offset, len)?;
                        self.desc.planes[plane].bytes_used =
                            (offset + media.bytes_used(plane)) as u32;
                    }
                } else {
                    let (fd, offset, _) = media
                        .plane_fd(0)
                        .ok_or(Error::InvalidState("media is not dma-buf backed"))?;
                    let total = (0..media.plane_count())
                        .filter_map(|p| media.capacity(p))
                        .sum();
                    self.set_external_dma_fd(0, fd, offset, total)?;
                    self.desc.planes[0].bytes_used = (offset + media.payload_len()) as u32;
                }
            }
            Memory::Mmap => return Err(Error::InvalidState("mmap slots cannot attach memory")),
        }
        self.attached = Some(media);
        Ok(())
    }

    pub fn attached(&self) -> Option<&MediaBuffer> {
        self.attached.as_ref()
    }

    pub fn detach(&mut self) -> Option<MediaBuffer> {
        self.attached.take()
    }

    /// Applies the side configuration ahead of submission: vendor flags on
    /// the descriptor, then the one-shot crop, ROI, QP and LTR controls.
    pub(crate) fn prepare(&mut self, device: &dyn Device) -> Result<()> {
        self.desc.vendor_flags = self.side.vendor_flags();
        self.desc.field = if self.side.interlaced {
            V4L2_FIELD_INTERLACED
        } else {
            V4L2_FIELD_NONE
        };

        if let Some(rect) = self.side.crop.take() {
            if let Err(e) = device.s_selection(self.desc.queue, V4L2_SEL_TGT_CROP, rect) {
                warn!("buffer {} crop {:?} rejected: {e}", self.desc.index, rect);
            }
        }
        if let Some(roi) = self.side.roi.take() {
            device
                .s_ext_ctrl(V4L2_CID_VENDOR_ROI, &roi.to_bytes())
                .map_err(Error::ioctl("VIDIOC_S_EXT_CTRLS(ROI)"))?;
        }
        if let Some(qp) = self.side.qp.take() {
            device
                .s_ctrl(V4L2_CID_VENDOR_QP_EPR, qp)
                .map_err(Error::ioctl("VIDIOC_S_CTRL(QP_EPR)"))?;
        }
        if let Some(ltr) = self.side.ltr.take() {
            device
                .s_ctrl(V4L2_CID_VENDOR_LTR_MODE, ltr)
                .map_err(Error::ioctl("VIDIOC_S_CTRL(LTR)"))?;
        }
        Ok(())
    }

    /// Takes over the descriptor the kernel returned on dequeue. Plane
    /// locations and lengths of attached memory are kept.
    pub(crate) fn complete(&mut self, done: BufferDescriptor) {
        let planes = self
            .desc
            .planes
            .iter()
            .zip(done.planes.iter())
            .map(|(mine, theirs)| {
                let mut plane = *mine;
                plane.bytes_used = theirs.bytes_used;
                plane.data_offset = theirs.data_offset;
                plane
            })
            .collect();
        self.desc = BufferDescriptor { planes, ..done };
        self.queued = false;
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("index", &self.desc.index)
            .field("queue", &self.desc.queue)
            .field("memory", &self.desc.memory)
            .field("queued", &self.queued)
            .field("bytes_used", &self.desc.bytes_used())
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        trace!("buffer {} {} destroyed", self.desc.index, self.desc.queue);
    }
}
