// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! One direction of a mem2mem codec.
//!
//! A [`Port`] owns the negotiated format and the slot array of one kernel
//! queue. It performs exactly the kernel calls it is asked for and never
//! retries; the owning [`crate::codec::Codec`] decides what to do with
//! transient outcomes.

use std::{
    fs::File,
    io::Write,
    path::PathBuf,
    sync::Arc,
};

use nix::errno::Errno;
use tracing::{debug, info, trace, warn};
use v4l2_sys::{
    V4L2_DEC_CMD_STOP, V4L2_ENC_CMD_STOP, V4L2_FIELD_INTERLACED, V4L2_FIELD_NONE,
    V4L2_SEL_TGT_COMPOSE,
};

use crate::{
    buffer::Buffer,
    device::{Device, Memory, PixFormat, PlaneLocation, QueueType},
    error::{Error, Result},
    fourcc::FourCC,
};

/// Offsets of mapped planes are page aligned; the low bits are cleared
/// before submission.
const MMAP_OFFSET_MASK: u32 = !0xfff;

/// Direction of a port as seen from the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Application to hardware: bitstream for a decoder, frames for an
    /// encoder. The V4L2 OUTPUT queue.
    Input,
    /// Hardware to application. The V4L2 CAPTURE queue.
    Output,
}

impl Direction {
    pub fn queue(self, multiplanar: bool) -> QueueType {
        match self {
            Direction::Input => QueueType::output(multiplanar),
            Direction::Output => QueueType::capture(multiplanar),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub direction: Direction,
    pub fourcc: FourCC,
    pub memory: Memory,
    /// Number of slots requested from the driver.
    pub buffer_count: u32,
    /// Force end-of-stream once this many frames went through the port.
    pub frame_limit: Option<u64>,
    /// Signal end-of-stream with a STOP command instead of an empty buffer.
    pub stop_command: bool,
    /// Append every payload passing the port to this file.
    pub dump_path: Option<PathBuf>,
}

impl PortConfig {
    pub fn new(direction: Direction, fourcc: FourCC) -> Self {
        Self {
            direction,
            fourcc,
            memory: Memory::Mmap,
            buffer_count: 4,
            frame_limit: None,
            stop_command: false,
            dump_path: None,
        }
    }
}

/// Result of [`Port::queue_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Submitted,
    /// The frame limit was reached; the slot went out as an empty
    /// end-of-stream unit.
    ForcedEos,
    /// End-of-stream was signalled with a STOP command; the slot stays with
    /// the application.
    Stopped,
}

/// Result of [`Port::dequeue_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueOutcome {
    /// Slot `index` is back with the application.
    Buffer(u32),
    /// Nothing completed yet.
    Again,
    /// The last buffer of the stream was already dequeued.
    Drained,
}

pub struct Port {
    device: Arc<dyn Device>,
    config: PortConfig,
    queue: QueueType,
    format: Option<PixFormat>,
    buffers: Vec<Buffer>,
    queued: usize,
    processed: u64,
    streaming: bool,
    generation: u32,
    dump: Option<File>,
}

impl Port {
    pub fn create(device: Arc<dyn Device>, config: PortConfig) -> Result<Self> {
        let queue = config.direction.queue(device.is_multiplanar());
        let dump = match &config.dump_path {
            Some(path) => Some(File::create(path).map_err(|source| Error::Open {
                path: path.clone(),
                source,
            })?),
            None => None,
        };
        debug!(
            "port {queue} {} memory:{:?} count:{} limit:{:?}",
            config.fourcc, config.memory, config.buffer_count, config.frame_limit
        );
        Ok(Self {
            device,
            config,
            queue,
            format: None,
            buffers: Vec::new(),
            queued: 0,
            processed: 0,
            streaming: false,
            generation: 0,
            dump,
        })
    }

    pub fn direction(&self) -> Direction {
        self.config.direction
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue
    }

    pub fn memory(&self) -> Memory {
        self.config.memory
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    pub fn format(&self) -> Option<&PixFormat> {
        self.format.as_ref()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Incremented on every successful allocation so media handed out from
    /// an older slot set can be recognised.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn buffer(&self, index: u32) -> Result<&Buffer> {
        let count = self.buffers.len();
        self.buffers
            .get(index as usize)
            .ok_or(Error::InvalidIndex { index, count })
    }

    pub fn buffer_mut(&mut self, index: u32) -> Result<&mut Buffer> {
        let count = self.buffers.len();
        self.buffers
            .get_mut(index as usize)
            .ok_or(Error::InvalidIndex { index, count })
    }

    /// Lowest-indexed slot currently owned by the application.
    pub fn next_free(&self) -> Option<u32> {
        self.buffers
            .iter()
            .find(|b| !b.is_queued())
            .map(Buffer::index)
    }

    pub fn queued_count(&self) -> usize {
        self.queued
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn frame_limit(&self) -> Option<u64> {
        self.config.frame_limit
    }

    pub fn set_frame_limit(&mut self, limit: Option<u64>) {
        self.config.frame_limit = limit;
    }

    pub fn reset_processed(&mut self) {
        self.processed = 0;
    }

    /// Clears the queued and processed bookkeeping without touching the
    /// kernel.
    pub fn reset_counters(&mut self) {
        self.queued = self.buffers.iter().filter(|b| b.is_queued()).count();
        self.processed = 0;
    }

    /// Reads the current format from the driver into the cache.
    pub fn refresh_format(&mut self) -> Result<&PixFormat> {
        let fmt = self
            .device
            .g_fmt(self.queue)
            .map_err(Error::ioctl("VIDIOC_G_FMT"))?;
        Ok(self.format.insert(fmt))
    }

    /// Negotiates `width`x`height` in the configured format.
    ///
    /// The request is tried first and only committed once the driver agreed
    /// to the format. On the input side the driver must also keep the
    /// geometry; on the output side it may dictate it.
    pub fn negotiate_format(
        &mut self,
        width: u32,
        height: u32,
        interlaced: bool,
    ) -> Result<&PixFormat> {
        let mut fmt = self
            .device
            .g_fmt(self.queue)
            .map_err(Error::ioctl("VIDIOC_G_FMT"))?;
        fmt.fourcc = self.config.fourcc;
        fmt.width = width;
        fmt.height = height;
        fmt.field = if interlaced {
            V4L2_FIELD_INTERLACED
        } else {
            V4L2_FIELD_NONE
        };

        let tried = self
            .device
            .try_fmt(&fmt)
            .map_err(Error::ioctl("VIDIOC_TRY_FMT"))?;
        if tried.fourcc != fmt.fourcc {
            return Err(Error::UnsupportedFormat {
                requested: fmt.fourcc,
                actual: tried.fourcc,
            });
        }
        if self.config.direction == Direction::Input
            && (tried.width, tried.height) != (width, height)
        {
            return Err(Error::GeometryMismatch {
                requested: (width, height),
                actual: (tried.width, tried.height),
            });
        }

        let set = self
            .device
            .s_fmt(&tried)
            .map_err(Error::ioctl("VIDIOC_S_FMT"))?;
        info!(
            "{} negotiated {}x{} {} planes:{} size:{}",
            self.queue,
            set.width,
            set.height,
            set.fourcc,
            set.planes.len(),
            set.size_image()
        );
        Ok(self.format.insert(set))
    }

    /// Replaces the slot set with `count` new slots.
    ///
    /// The existing set is always released first; `count == 0` only frees.
    /// Returns the number of slots the driver granted. On failure no slots
    /// remain allocated.
    pub fn allocate_buffers(&mut self, count: u32) -> Result<usize> {
        self.buffers.clear();
        self.queued = 0;
        self.device
            .reqbufs(self.queue, self.config.memory, 0)
            .map_err(Error::ioctl("VIDIOC_REQBUFS"))?;
        if count == 0 {
            debug!("{} buffers released", self.queue);
            return Ok(0);
        }

        let granted = self
            .device
            .reqbufs(self.queue, self.config.memory, count)
            .map_err(Error::ioctl("VIDIOC_REQBUFS"))?;
        if granted == 0 {
            return Err(Error::Allocation(format!(
                "{} granted no buffers",
                self.queue
            )));
        }

        let mut buffers = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let created = self
                .device
                .querybuf(self.queue, self.config.memory, index)
                .map_err(Error::ioctl("VIDIOC_QUERYBUF"))
                .and_then(|desc| Buffer::create(self.device.as_ref(), desc));
            match created {
                Ok(buf) => buffers.push(buf),
                Err(e) => {
                    drop(buffers);
                    if let Err(errno) = self.device.reqbufs(self.queue, self.config.memory, 0) {
                        warn!("{} release after failed allocation: {errno}", self.queue);
                    }
                    return Err(e);
                }
            }
        }

        self.buffers = buffers;
        self.generation = self.generation.wrapping_add(1);
        info!(
            "{} allocated {granted} buffers (requested {count}) generation:{}",
            self.queue, self.generation
        );
        Ok(granted as usize)
    }

    /// Hands slot `index` to the kernel.
    pub fn queue_buffer(&mut self, index: u32) -> Result<QueueOutcome> {
        let device = Arc::clone(&self.device);
        let limit_reached = self
            .config
            .frame_limit
            .is_some_and(|limit| self.processed >= limit);
        let direction = self.config.direction;

        let buf = self.buffer_mut(index)?;
        if buf.is_queued() {
            return Err(Error::BufferQueued(index));
        }
        buf.prepare(device.as_ref())?;

        let mut outcome = QueueOutcome::Submitted;
        if limit_reached {
            buf.set_eos(true);
            for plane in buf.descriptor_mut().planes.iter_mut() {
                plane.bytes_used = 0;
            }
            outcome = QueueOutcome::ForcedEos;
        }

        let mut desc = buf.descriptor().clone();
        let eos = buf.is_last();
        if desc.memory == Memory::Mmap {
            for plane in desc.planes.iter_mut() {
                if let PlaneLocation::Offset(offset) = plane.location {
                    plane.location = PlaneLocation::Offset(offset & MMAP_OFFSET_MASK);
                }
            }
        }
        let payload = desc.bytes_used();

        if direction == Direction::Input && eos && payload == 0 && self.config.stop_command {
            if self.stop()? {
                return Ok(QueueOutcome::Stopped);
            }
        }
        if direction == Direction::Input && payload > 0 {
            self.dump_slot(index);
        }

        self.device
            .qbuf(&desc)
            .map_err(Error::ioctl("VIDIOC_QBUF"))?;
        self.buffer_mut(index)?.set_queued(true);
        self.queued += 1;
        if direction == Direction::Input && payload > 0 {
            self.processed += 1;
        }
        trace!(
            "{} qbuf {index} bytes:{payload} eos:{eos} queued:{}",
            self.queue,
            self.queued
        );

        if direction == Direction::Input && eos && payload > 0 && self.config.stop_command {
            self.stop()?;
        }
        Ok(outcome)
    }

    /// Takes back the oldest completed slot without blocking.
    pub fn dequeue_buffer(&mut self) -> Result<DequeueOutcome> {
        let done = match self.device.dqbuf(self.queue, self.config.memory) {
            Ok(done) => done,
            Err(Errno::EAGAIN) => return Ok(DequeueOutcome::Again),
            Err(Errno::EPIPE) => {
                debug!("{} drained", self.queue);
                return Ok(DequeueOutcome::Drained);
            }
            Err(e) => return Err(Error::ioctl("VIDIOC_DQBUF")(e)),
        };

        let index = done.index;
        let queue = self.queue;
        let crop = match self.config.direction {
            Direction::Output => self.device.g_selection(queue, V4L2_SEL_TGT_COMPOSE).ok(),
            Direction::Input => None,
        };
        let buf = self.buffer_mut(index)?;
        if !buf.is_queued() {
            warn!("{queue} dequeued buffer {index} that was not queued");
        }
        buf.complete(done);
        if crop.is_some() {
            buf.set_crop(crop);
        }
        let payload = buf.bytes_used();
        self.queued = self.queued.saturating_sub(1);

        if self.config.direction == Direction::Output && payload > 0 {
            self.processed += 1;
            self.dump_slot(index);
        }
        trace!(
            "{queue} dqbuf {index} bytes:{payload} queued:{}",
            self.queued
        );
        Ok(DequeueOutcome::Buffer(index))
    }

    /// Resubmits every application-owned slot with vendor flags cleared.
    pub fn queue_all_buffers(&mut self, eos: bool) -> Result<()> {
        for index in 0..self.buffers.len() as u32 {
            let buf = self.buffer_mut(index)?;
            if buf.is_queued() {
                continue;
            }
            buf.set_eos(eos);
            buf.descriptor_mut().vendor_flags = 0;
            *buf.side_mut() = Default::default();
            if buf.queue_type().is_output() {
                for plane in buf.descriptor_mut().planes.iter_mut() {
                    plane.bytes_used = 0;
                }
            }
            self.queue_buffer(index)?;
        }
        Ok(())
    }

    pub fn stream_on(&mut self) -> Result<()> {
        self.device
            .streamon(self.queue)
            .map_err(Error::ioctl("VIDIOC_STREAMON"))?;
        self.streaming = true;
        debug!("{} stream on", self.queue);
        Ok(())
    }

    /// Stops the queue. The kernel returns every slot, so all of them are
    /// application-owned afterwards.
    pub fn stream_off(&mut self) -> Result<()> {
        self.device
            .streamoff(self.queue)
            .map_err(Error::ioctl("VIDIOC_STREAMOFF"))?;
        self.streaming = false;
        for buf in self.buffers.iter_mut() {
            buf.set_queued(false);
        }
        self.queued = 0;
        debug!("{} stream off", self.queue);
        Ok(())
    }

    /// Sends the STOP command matching this port's role. Returns `false`
    /// when the driver rejects the command in its TRY form.
    pub fn stop(&mut self) -> Result<bool> {
        let decoder = self.config.fourcc.is_compressed();
        let tried = if decoder {
            self.device.decoder_cmd(V4L2_DEC_CMD_STOP, true)
        } else {
            self.device.encoder_cmd(V4L2_ENC_CMD_STOP, true)
        };
        if let Err(e) = tried {
            debug!("{} stop command unsupported: {e}", self.queue);
            return Ok(false);
        }
        if decoder {
            self.device
                .decoder_cmd(V4L2_DEC_CMD_STOP, false)
                .map_err(Error::ioctl("VIDIOC_DECODER_CMD"))?;
        } else {
            self.device
                .encoder_cmd(V4L2_ENC_CMD_STOP, false)
                .map_err(Error::ioctl("VIDIOC_ENCODER_CMD"))?;
        }
        info!("{} stop command sent", self.queue);
        Ok(true)
    }

    fn dump_slot(&mut self, index: u32) {
        let Some(file) = self.dump.as_mut() else {
            return;
        };
        let Some(buf) = self.buffers.get(index as usize) else {
            return;
        };
        let data = match buf.attached() {
            Some(media) => media.to_vec(),
            None => buf.read_payload().ok().map(|planes| planes.concat()),
        };
        if let Some(data) = data {
            if let Err(e) = file.write_all(&data) {
                warn!("{} dump failed: {e}", self.queue);
                self.dump = None;
            }
        }
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("queue", &self.queue)
            .field("fourcc", &self.config.fourcc)
            .field("buffers", &self.buffers.len())
            .field("queued", &self.queued)
            .field("processed", &self.processed)
            .field("streaming", &self.streaming)
            .finish()
    }
}
