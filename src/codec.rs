// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Stateful mem2mem codec driven through two [`Port`]s.
//!
//! The [`Codec`] runs the buffer-queue protocol: format negotiation,
//! allocation, streaming, resolution-change renegotiation, end-of-stream
//! latching and flush. Calls into one codec must be serialised by the
//! caller; only the event thread runs concurrently and it only reads events.
//!
//! # Example
//!
//! ```no_run
//! use edgefirst_codec::{
//!     codec::{Codec, CodecConfig, Output},
//!     fourcc::{H264, NV12},
//!     media::MediaBuffer,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CodecConfig::decoder(H264, NV12, 1920, 1080);
//! let mut codec = Codec::open("/dev/video0", config)?;
//! codec.stream()?;
//! codec.handle_input(&MediaBuffer::packet(H264, vec![0, 0, 0, 1, 0x67], 0))?;
//! match codec.handle_output()? {
//!     Output::Frame(frame) => println!("decoded {frame}"),
//!     Output::ResolutionChanged => println!("now {:?}", codec.output_format()),
//!     _ => {}
//! }
//! codec.destroy()?;
//! # Ok(())
//! # }
//! ```

use std::{
    fmt,
    os::fd::RawFd,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use kanal::{Receiver, Sender};
use nix::errno::Errno;
use tracing::{debug, error, info, trace, warn};
use v4l2_sys::*;

use crate::{
    buffer::{Mirror, Roi, Rotation, SideConfig},
    device::{Device, DeviceEvent, Memory, PixFormat, Readiness, Rect, V4l2Device},
    dma::DmaHeap,
    error::{Error, Result},
    fourcc::{self, FourCC},
    media::{EndOfStream, MediaBuffer, Origin},
    port::{DequeueOutcome, Direction, Port, PortConfig, QueueOutcome},
    queue::BlockMode,
};

/// Slots added on top of the driver minimum after a resolution change.
pub const RESOLUTION_CHANGE_EXTRA_BUFFERS: u32 = 4;

/// Timeout of one readiness wait, both for the event thread and for
/// blocking data-path calls.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    Created,
    Streaming,
    ResolutionChanging,
    Flushed,
    Destroyed,
}

/// Outcome of [`Codec::handle_input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The unit was queued to the hardware.
    Accepted,
    /// No free slot; retry with the same unit.
    Again,
    /// The input direction has reached end-of-stream. Returned for the unit
    /// that ended the stream and for every call after it until a reset.
    EndOfStream,
}

/// Outcome of [`Codec::handle_output`].
#[derive(Debug, Clone)]
pub enum Output {
    Frame(MediaBuffer),
    /// The driver flagged the frame as decoded with errors.
    Corrupted(MediaBuffer),
    /// Nothing completed yet.
    Again,
    /// The output direction has drained.
    EndOfStream,
    /// Output geometry changed. Re-read [`Codec::output_format`] and
    /// [`Codec::output_fds`] before consuming more output.
    ResolutionChanged,
}

/// Decides whether an error-flagged output buffer is the terminal
/// end-of-stream marker or a corrupted frame.
pub trait EosPolicy: Send + Sync + fmt::Debug {
    fn is_terminal(&self, frame_pts: u64, input_eos: bool, eos_pts: Option<u64>) -> bool;
}

/// Terminal iff the frame carries the pts of the end-of-stream input unit.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtsMatch;

impl EosPolicy for PtsMatch {
    fn is_terminal(&self, frame_pts: u64, _input_eos: bool, eos_pts: Option<u64>) -> bool {
        eos_pts == Some(frame_pts)
    }
}

/// Terminal for any error frame once input end-of-stream was latched, for
/// backends that do not carry timestamps through.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorAfterEos;

impl EosPolicy for ErrorAfterEos {
    fn is_terminal(&self, _frame_pts: u64, input_eos: bool, _eos_pts: Option<u64>) -> bool {
        input_eos
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    Vbr,
    Cbr,
    ConstantQp,
}

/// Colour description signalled in the encoded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorDescription {
    pub primaries: u8,
    pub transfer: u8,
    pub matrix: u8,
    pub full_range: bool,
}

impl ColorDescription {
    fn to_bytes(self) -> [u8; 4] {
        [
            self.primaries,
            self.transfer,
            self.matrix,
            self.full_range as u8,
        ]
    }
}

/// Persistent encoder settings applied with [`Codec::apply_tuning`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuning {
    pub bitrate: Option<u32>,
    pub rate_control: Option<RateControl>,
    pub qp_range: Option<(u32, u32)>,
    pub gop: Option<u32>,
    pub profile: Option<i32>,
    pub level: Option<i32>,
    pub hrd_buffer_size: Option<u32>,
    pub ltr_mode: Option<i32>,
    pub color: Option<ColorDescription>,
}

#[derive(Debug, Clone)]
pub struct CodecConfig {
    pub width: u32,
    pub height: u32,
    pub input: PortConfig,
    pub output: PortConfig,
    /// Blocking mode makes data-path calls wait up to [`POLL_TIMEOUT`] for
    /// readiness before returning `Again`.
    pub block_mode: BlockMode,
    pub interlaced: bool,
    /// Watch for driver events on a dedicated thread instead of polling
    /// them from [`Codec::handle_event`].
    pub event_thread: bool,
    pub extra_output_buffers: u32,
    pub eos_policy: Arc<dyn EosPolicy>,
}

impl CodecConfig {
    pub fn new(input: PortConfig, output: PortConfig, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            input,
            output,
            block_mode: BlockMode::NonBlocking,
            interlaced: false,
            event_thread: false,
            extra_output_buffers: RESOLUTION_CHANGE_EXTRA_BUFFERS,
            eos_policy: Arc::new(PtsMatch),
        }
    }

    pub fn decoder(coding: FourCC, format: FourCC, width: u32, height: u32) -> Self {
        let mut output = PortConfig::new(Direction::Output, format);
        output.buffer_count = 8;
        let mut config = Self::new(
            PortConfig::new(Direction::Input, coding),
            output,
            width,
            height,
        );
        config.event_thread = true;
        config
    }

    pub fn encoder(format: FourCC, coding: FourCC, width: u32, height: u32) -> Self {
        Self::new(
            PortConfig::new(Direction::Input, format),
            PortConfig::new(Direction::Output, coding),
            width,
            height,
        )
    }
}

struct EventThread {
    handle: JoinHandle<()>,
    destroyed: Arc<AtomicBool>,
    events: Receiver<DeviceEvent>,
}

impl EventThread {
    fn spawn(device: Arc<dyn Device>) -> Result<Self> {
        let destroyed = Arc::new(AtomicBool::new(false));
        let (tx, events) = kanal::unbounded();
        let flag = Arc::clone(&destroyed);
        let handle = thread::Builder::new()
            .name("codec-events".to_string())
            .spawn(move || event_loop(device, flag, tx))?;
        Ok(Self {
            handle,
            destroyed,
            events,
        })
    }

    fn stop(self) {
        self.destroyed.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            error!("event thread panicked");
        }
    }
}

fn event_loop(device: Arc<dyn Device>, destroyed: Arc<AtomicBool>, tx: Sender<DeviceEvent>) {
    debug!("event thread started");
    while !destroyed.load(Ordering::Acquire) {
        match device.poll(Readiness::events(), POLL_TIMEOUT) {
            Ok(ready) if ready.event => loop {
                match device.dqevent() {
                    Ok(event) => {
                        trace!("event {:?}", event);
                        if tx.send(event).is_err() {
                            return;
                        }
                        if event.pending == 0 {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            },
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => {
                warn!("event poll failed: {e}");
                thread::sleep(POLL_TIMEOUT);
            }
        }
    }
    debug!("event thread stopped");
}

pub struct Codec {
    device: Arc<dyn Device>,
    input: Port,
    output: Port,
    config: CodecConfig,
    state: CodecState,
    input_eos: bool,
    eos_pts: Option<u64>,
    output_eos: bool,
    source_change: bool,
    // an interrupted reallocation, resumed by the next handle_output
    resize_pending: bool,
    events: Option<EventThread>,
    heap: Option<DmaHeap>,
    side: SideConfig,
}

impl Codec {
    /// Opens the device node and creates the codec on it.
    pub fn open(path: impl AsRef<Path>, config: CodecConfig) -> Result<Self> {
        let device = V4l2Device::open(path)?;
        Self::create(Arc::new(device), config)
    }

    /// Negotiates both formats and allocates both slot sets.
    ///
    /// Any failure releases what was set up so far; no codec is returned.
    pub fn create(device: Arc<dyn Device>, config: CodecConfig) -> Result<Self> {
        let mut input = Port::create(Arc::clone(&device), config.input.clone())?;
        let mut output = Port::create(Arc::clone(&device), config.output.clone())?;

        for kind in [V4L2_EVENT_SOURCE_CHANGE, V4L2_EVENT_EOS] {
            if let Err(e) = device.subscribe_event(kind) {
                debug!("event {kind} not supported: {e}");
            }
        }

        input.negotiate_format(config.width, config.height, config.interlaced)?;
        output.negotiate_format(config.width, config.height, false)?;

        input.allocate_buffers(config.input.buffer_count)?;
        let min = device
            .g_ctrl(V4L2_CID_MIN_BUFFERS_FOR_CAPTURE)
            .map(|v| v.max(0) as u32)
            .unwrap_or(0);
        output.allocate_buffers(min.max(config.output.buffer_count))?;

        let heap = if config.output.memory == Memory::DmaBuf {
            Some(DmaHeap::new()?)
        } else {
            None
        };

        let mut codec = Self {
            device: Arc::clone(&device),
            input,
            output,
            state: CodecState::Created,
            input_eos: false,
            eos_pts: None,
            output_eos: false,
            source_change: false,
            resize_pending: false,
            events: None,
            heap,
            side: SideConfig {
                interlaced: config.interlaced,
                ..Default::default()
            },
            config,
        };
        codec.attach_output_pool()?;
        if codec.config.event_thread {
            codec.events = Some(EventThread::spawn(device)?);
        }
        info!(
            "codec created {} -> {} {}x{}",
            codec.config.input.fourcc,
            codec.config.output.fourcc,
            codec.config.width,
            codec.config.height
        );
        Ok(codec)
    }

    pub fn state(&self) -> CodecState {
        self.state
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn is_encoder(&self) -> bool {
        self.config.output.fourcc.is_compressed()
    }

    pub fn input_port(&self) -> &Port {
        &self.input
    }

    pub fn output_port(&self) -> &Port {
        &self.output
    }

    pub fn input_format(&self) -> Option<&PixFormat> {
        self.input.format()
    }

    pub fn output_format(&self) -> Option<&PixFormat> {
        self.output.format()
    }

    pub fn input_eos(&self) -> bool {
        self.input_eos
    }

    pub fn eos_pts(&self) -> Option<u64> {
        self.eos_pts
    }

    pub fn output_eos(&self) -> bool {
        self.output_eos
    }

    /// Descriptor table of a DMABUF output pool. Position `i` is slot `i`;
    /// slots without a descriptor-backed buffer are `None`.
    pub fn output_fds(&self) -> Vec<Option<RawFd>> {
        self.output
            .buffers()
            .iter()
            .map(|b| b.attached().and_then(|m| m.plane_fd(0)).map(|p| p.0))
            .collect()
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state {
            CodecState::Streaming | CodecState::Flushed => Ok(()),
            CodecState::Created => Err(Error::InvalidState("codec is not streaming")),
            CodecState::ResolutionChanging => {
                Err(Error::InvalidState("resolution change in progress"))
            }
            CodecState::Destroyed => Err(Error::InvalidState("codec destroyed")),
        }
    }

    /// Attaches one media buffer per output slot when the output queue does
    /// not use driver-mapped memory.
    fn attach_output_pool(&mut self) -> Result<()> {
        let memory = self.output.memory();
        if memory == Memory::Mmap {
            return Ok(());
        }
        let fmt = self
            .output
            .format()
            .cloned()
            .ok_or(Error::InvalidState("output format not negotiated"))?;
        let generation = self.output.generation();
        for index in 0..self.output.buffer_count() as u32 {
            let size = self
                .output
                .buffer(index)?
                .plane_len(0)
                .filter(|len| *len > 0)
                .unwrap_or_else(|| fmt.size_image());
            let origin = Origin { index, generation };
            let media = match (memory, &self.heap) {
                (Memory::DmaBuf, Some(heap)) => MediaBuffer::dma_slot(
                    heap,
                    fmt.fourcc,
                    fmt.width,
                    fmt.height,
                    fmt.stride(),
                    size,
                    origin,
                )?,
                _ => MediaBuffer::from_planes(
                    fmt.fourcc,
                    fmt.width,
                    fmt.height,
                    fmt.stride(),
                    vec![vec![0; size]],
                )
                .with_origin(origin),
            };
            self.output.buffer_mut(index)?.attach(media)?;
        }
        debug!(
            "attached {} {:?} output buffers generation:{generation}",
            self.output.buffer_count(),
            memory
        );
        Ok(())
    }

    /// Starts both queues and hands every output slot to the hardware.
    pub fn stream(&mut self) -> Result<()> {
        match self.state {
            CodecState::Created | CodecState::Flushed => {}
            CodecState::Streaming => return Ok(()),
            _ => return Err(Error::InvalidState("codec cannot start streaming")),
        }
        if !self.input.is_streaming() {
            self.input.stream_on()?;
        }
        if !self.output.is_streaming() {
            self.output.stream_on()?;
        }
        self.output.queue_all_buffers(false)?;
        self.state = CodecState::Streaming;
        info!("codec streaming");
        Ok(())
    }

    /// Waits up to [`POLL_TIMEOUT`] for any readiness condition.
    pub fn poll(&self) -> Result<Readiness> {
        self.wait(Readiness::all())
    }

    fn wait(&self, interest: Readiness) -> Result<Readiness> {
        match self.device.poll(interest, POLL_TIMEOUT) {
            Ok(ready) => Ok(ready),
            Err(Errno::EINTR) => Ok(Readiness::default()),
            Err(e) => Err(Error::Poll(e)),
        }
    }

    /// Takes back input slots the hardware has consumed and drops their
    /// attached media.
    fn reclaim_input(&mut self) -> Result<()> {
        if self.input.queued_count() == 0 {
            return Ok(());
        }
        while let DequeueOutcome::Buffer(index) = self.input.dequeue_buffer()? {
            self.input.buffer_mut(index)?.detach();
        }
        Ok(())
    }

    /// Submits one bitstream unit (decode) or frame (encode).
    ///
    /// A unit with no payload or flagged end-of-stream latches input
    /// end-of-stream with its pts; from then on every call returns
    /// [`Status::EndOfStream`] until [`Codec::flush`] resets it.
    pub fn handle_input(&mut self, media: &MediaBuffer) -> Result<Status> {
        self.ensure_running()?;
        if self.input_eos {
            return Ok(Status::EndOfStream);
        }
        self.state = CodecState::Streaming;
        self.reclaim_input()?;

        let index = match self.input.next_free() {
            Some(index) => index,
            None if self.config.block_mode == BlockMode::Blocking => {
                self.wait(Readiness {
                    input: true,
                    ..Default::default()
                })?;
                self.reclaim_input()?;
                match self.input.next_free() {
                    Some(index) => index,
                    None => return Ok(Status::Again),
                }
            }
            None => return Ok(Status::Again),
        };

        let eos = media.eos().is_eos() || media.payload_len() == 0;
        let payload = media.eos() != EndOfStream::WithoutData && media.payload_len() > 0;
        let memory = self.input.memory();
        let fmt = self.input.format().cloned();
        let side = self.side.clone();

        let buf = self.input.buffer_mut(index)?;
        *buf.side_mut() = side;
        buf.set_timestamp(media.pts());
        buf.set_eos(eos);
        if memory == Memory::Mmap {
            if payload {
                copy_into_slot(buf, media, fmt.as_ref())?;
            }
        } else if let Err(e) = buf.attach(media.clone()) {
            if payload {
                return Err(e);
            }
            debug!("end-of-stream unit not attached: {e}");
        }
        if !payload {
            for plane in 0..buf.plane_count() {
                buf.set_bytes_used(plane, 0)?;
            }
        }

        let outcome = self.input.queue_buffer(index)?;
        self.side.crop = None;
        self.side.roi = None;
        self.side.qp = None;
        self.side.ltr = None;
        if eos || outcome != QueueOutcome::Submitted {
            self.input_eos = true;
            self.eos_pts = Some(media.pts());
            info!(
                "input end-of-stream pts:{} ({:?})",
                media.pts(),
                outcome
            );
            return Ok(Status::EndOfStream);
        }
        trace!("input {index} pts:{} bytes:{}", media.pts(), media.payload_len());
        Ok(Status::Accepted)
    }

    /// Retrieves the next completed output unit.
    pub fn handle_output(&mut self) -> Result<Output> {
        self.ensure_running()?;
        if self.resize_pending {
            return self.change_resolution();
        }
        if self.output_eos {
            return Ok(Output::EndOfStream);
        }
        self.handle_event()?;

        let mut outcome = self.output.dequeue_buffer()?;
        if outcome == DequeueOutcome::Again && self.config.block_mode == BlockMode::Blocking {
            let ready = self.wait(Readiness {
                output: true,
                event: self.events.is_none(),
                ..Default::default()
            })?;
            if ready.event || self.events.is_some() {
                self.handle_event()?;
            }
            outcome = self.output.dequeue_buffer()?;
        }
        self.reclaim_input()?;

        match outcome {
            DequeueOutcome::Again => Ok(Output::Again),
            DequeueOutcome::Drained if self.output_geometry_changed()? => {
                self.change_resolution()
            }
            DequeueOutcome::Drained => {
                self.output_eos = true;
                info!("output end-of-stream");
                Ok(Output::EndOfStream)
            }
            DequeueOutcome::Buffer(index) => self.complete_output(index),
        }
    }

    fn complete_output(&mut self, index: u32) -> Result<Output> {
        let buf = self.output.buffer(index)?;
        let pts = buf.timestamp();
        let bytes = buf.bytes_used();
        let last = buf.is_last();
        let corrupted = buf.is_error();

        // The source change event may still be in flight when the last
        // buffer of the old geometry arrives, so the format is checked too.
        if bytes == 0 || last {
            let latched = self.source_change;
            if self.output_geometry_changed()? {
                return self.change_resolution();
            }
            if latched && !last {
                self.output.queue_buffer(index)?;
                return Ok(Output::Again);
            }
        }

        if corrupted
            && self
                .config
                .eos_policy
                .is_terminal(pts, self.input_eos, self.eos_pts)
        {
            info!("terminal error frame pts:{pts}");
            self.output_eos = true;
            return Ok(Output::EndOfStream);
        }

        if bytes == 0 {
            if last {
                self.output_eos = true;
                info!("output end-of-stream pts:{pts}");
                return Ok(Output::EndOfStream);
            }
            if !corrupted {
                self.output.queue_buffer(index)?;
                return Ok(Output::Again);
            }
        }

        let media = self.output_media(index)?;
        media.set_pts(pts);
        media.set_corrupted(corrupted);
        if last {
            media.set_eos(EndOfStream::WithData);
            self.output_eos = true;
        }
        if corrupted {
            warn!("corrupted frame pts:{pts}");
            Ok(Output::Corrupted(media))
        } else {
            Ok(Output::Frame(media))
        }
    }

    /// Turns a dequeued output slot into a media buffer. Mapped slots are
    /// copied and resubmitted; pooled slots are handed out by reference
    /// until [`Codec::release_output`].
    fn output_media(&mut self, index: u32) -> Result<MediaBuffer> {
        let fmt = self
            .output
            .format()
            .cloned()
            .ok_or(Error::InvalidState("output format not negotiated"))?;
        let buf = self.output.buffer(index)?;
        let keyframe = buf.is_keyframe();
        let used = buf
            .descriptor()
            .planes
            .first()
            .map(|p| (p.bytes_used as usize).saturating_sub(p.data_offset as usize));
        let media = match buf.attached().cloned() {
            Some(media) => {
                if let Some(used) = used {
                    media.set_bytes_used(0, used.min(media.capacity(0).unwrap_or(0)))?;
                }
                media
            }
            None => {
                let planes = self.output.buffer(index)?.read_payload()?;
                let media = if fmt.fourcc.is_compressed() {
                    MediaBuffer::packet(fmt.fourcc, planes.concat(), 0)
                } else {
                    MediaBuffer::from_planes(
                        fmt.fourcc,
                        fmt.width,
                        fmt.height,
                        fmt.stride(),
                        planes,
                    )
                };
                self.output.queue_buffer(index)?;
                media
            }
        };
        if !fmt.fourcc.is_compressed() {
            media.set_geometry(fmt.width, fmt.height, fmt.stride());
        }
        media.set_keyframe(keyframe);
        Ok(media)
    }

    /// Gives a pooled output buffer back to the hardware.
    ///
    /// Returns `false` for buffers from an older slot set (handed out before
    /// a resolution change) or that are not pooled output buffers; those are
    /// simply dropped. A slot whose buffer still has other live clones stays
    /// with the application and also returns `false`; release the last clone
    /// to requeue it.
    pub fn release_output(&mut self, media: MediaBuffer) -> Result<bool> {
        let Some(origin) = media.origin() else {
            return Ok(false);
        };
        if origin.generation != self.output.generation() || self.output_eos {
            debug!("stale output buffer {:?} dropped", origin);
            return Ok(false);
        }
        let buf = self.output.buffer(origin.index)?;
        let owned = buf
            .attached()
            .is_some_and(|attached| attached.same_buffer(&media));
        if !owned || buf.is_queued() {
            return Ok(false);
        }
        drop(media);
        let held = self
            .output
            .buffer(origin.index)?
            .attached()
            .is_some_and(|attached| attached.ref_count() > 1);
        if held {
            debug!("output slot {} still referenced, kept", origin.index);
            return Ok(false);
        }
        self.output.queue_buffer(origin.index)?;
        Ok(true)
    }

    /// Whether the driver switched the output format since it was cached.
    /// Drains pending events first; a latched source change that brought
    /// no new format is cleared.
    fn output_geometry_changed(&mut self) -> Result<bool> {
        self.handle_event()?;
        let current = self
            .device
            .g_fmt(self.output.queue_type())
            .map_err(Error::ioctl("VIDIOC_G_FMT"))?;
        if self.format_changed(&current) {
            if !self.source_change {
                info!("output format changed ahead of its source change event");
            }
            return Ok(true);
        }
        if self.source_change {
            debug!("source change without new geometry");
            self.source_change = false;
        }
        Ok(false)
    }

    fn format_changed(&self, current: &PixFormat) -> bool {
        match self.output.format() {
            Some(cached) => {
                (cached.width, cached.height) != (current.width, current.height)
                    || cached.fourcc != current.fourcc
                    || cached.size_image() != current.size_image()
            }
            None => true,
        }
    }

    /// Reallocates the output port for the geometry the driver reports.
    ///
    /// On failure the codec stays usable and the next
    /// [`Codec::handle_output`] runs the whole sequence again.
    fn change_resolution(&mut self) -> Result<Output> {
        self.state = CodecState::ResolutionChanging;
        self.resize_pending = true;
        let result = self.reallocate_output();
        self.state = CodecState::Streaming;
        match result {
            Ok(()) => {
                self.resize_pending = false;
                self.source_change = false;
                Ok(Output::ResolutionChanged)
            }
            Err(e) => {
                warn!("resolution change failed, retried on next output: {e}");
                Err(e)
            }
        }
    }

    fn reallocate_output(&mut self) -> Result<()> {
        self.output.stream_off()?;
        let fmt = self.output.refresh_format()?.clone();
        info!(
            "resolution change to {}x{} {}",
            fmt.width, fmt.height, fmt.fourcc
        );
        self.output.allocate_buffers(0)?;
        self.output.negotiate_format(fmt.width, fmt.height, false)?;

        let min = self
            .device
            .g_ctrl(V4L2_CID_MIN_BUFFERS_FOR_CAPTURE)
            .map(|v| v.max(0) as u32)
            .unwrap_or(0);
        let count = min.max(self.config.output.buffer_count) + self.config.extra_output_buffers;
        self.output.allocate_buffers(count)?;
        self.attach_output_pool()?;
        self.output.stream_on()?;
        self.output.queue_all_buffers(false)?;
        self.output.reset_processed();
        Ok(())
    }

    /// Drains pending driver events and latches source changes.
    pub fn handle_event(&mut self) -> Result<()> {
        let mut pending = Vec::new();
        match &self.events {
            Some(thread) => {
                while let Ok(Some(event)) = thread.events.try_recv() {
                    pending.push(event);
                }
            }
            None => loop {
                match self.device.dqevent() {
                    Ok(event) => pending.push(event),
                    Err(Errno::ENOENT) | Err(Errno::EAGAIN) => break,
                    Err(e) => return Err(Error::ioctl("VIDIOC_DQEVENT")(e)),
                }
            },
        }
        for event in pending {
            if event.is_resolution_change() {
                info!("source change event");
                self.source_change = true;
            } else {
                debug!("event {:?}", event.kind);
            }
        }
        Ok(())
    }

    /// Resubmits every held output slot with end-of-stream cleared and resets
    /// the port bookkeeping. With `reset_eos` the latched end-of-stream
    /// state is cleared as well.
    ///
    /// Submission must have been stopped by the caller; the kernel queues
    /// are not drained.
    pub fn flush(&mut self, reset_eos: bool) -> Result<()> {
        match self.state {
            CodecState::Destroyed => return Err(Error::InvalidState("codec destroyed")),
            CodecState::Created => return Ok(()),
            _ => {}
        }
        self.reclaim_input()?;
        for index in 0..self.input.buffer_count() as u32 {
            let buf = self.input.buffer_mut(index)?;
            if !buf.is_queued() {
                buf.set_eos(false);
                buf.detach();
            }
        }

        if self.output_eos && reset_eos {
            let restart = if self.is_encoder() {
                self.device.encoder_cmd(V4L2_ENC_CMD_START, false)
            } else {
                self.device.decoder_cmd(V4L2_DEC_CMD_START, false)
            };
            if let Err(e) = restart {
                debug!("start command after drain: {e}");
            }
        }

        for index in 0..self.output.buffer_count() as u32 {
            let buf = self.output.buffer_mut(index)?;
            let held = buf.attached().is_some_and(|m| m.ref_count() > 1);
            if buf.is_queued() || held {
                continue;
            }
            buf.set_eos(false);
            buf.descriptor_mut().vendor_flags = 0;
            self.output.queue_buffer(index)?;
        }

        self.input.reset_counters();
        self.output.reset_counters();
        if reset_eos {
            self.input_eos = false;
            self.eos_pts = None;
            self.output_eos = false;
        }
        self.state = CodecState::Flushed;
        info!("codec flushed reset_eos:{reset_eos}");
        Ok(())
    }

    fn teardown(&mut self) {
        if self.state == CodecState::Destroyed {
            return;
        }
        self.state = CodecState::Destroyed;
        if let Some(events) = self.events.take() {
            events.stop();
        }
        for port in [&mut self.input, &mut self.output] {
            if port.is_streaming() {
                if let Err(e) = port.stream_off() {
                    warn!("{e}");
                }
            }
            if let Err(e) = port.allocate_buffers(0) {
                warn!("{e}");
            }
        }
        info!("codec destroyed");
    }

    /// Stops both queues, joins the event thread and frees every slot. The
    /// device is closed when the codec is dropped.
    pub fn destroy(mut self) -> Result<()> {
        self.teardown();
        Ok(())
    }

    fn ctrl(&self, id: u32, value: i32, name: &'static str) -> Result<()> {
        debug!("{name} = {value}");
        self.device.s_ctrl(id, value).map_err(Error::ioctl(name))
    }

    fn is_hevc(&self) -> bool {
        self.config.output.fourcc == fourcc::HEVC || self.config.input.fourcc == fourcc::HEVC
    }

    pub fn set_bitrate(&mut self, bps: u32) -> Result<()> {
        self.ctrl(
            V4L2_CID_MPEG_VIDEO_BITRATE,
            bps.min(i32::MAX as u32) as i32,
            "VIDIOC_S_CTRL(BITRATE)",
        )
    }

    pub fn set_rate_control(&mut self, mode: RateControl) -> Result<()> {
        let value = match mode {
            RateControl::Vbr => 0,
            RateControl::Cbr => 1,
            RateControl::ConstantQp => 2,
        };
        self.ctrl(
            V4L2_CID_MPEG_VIDEO_FRAME_RC_ENABLE,
            (mode != RateControl::ConstantQp) as i32,
            "VIDIOC_S_CTRL(FRAME_RC_ENABLE)",
        )?;
        self.ctrl(
            V4L2_CID_MPEG_VIDEO_BITRATE_MODE,
            value,
            "VIDIOC_S_CTRL(BITRATE_MODE)",
        )
    }

    /// Vendor rate-control mode, for modes beyond the standard ones.
    pub fn set_vendor_rc_mode(&mut self, mode: i32) -> Result<()> {
        self.ctrl(V4L2_CID_VENDOR_RC_MODE, mode, "VIDIOC_S_CTRL(RC_MODE)")
    }

    pub fn set_qp_range(&mut self, min: u32, max: u32) -> Result<()> {
        if min > max {
            return Err(Error::InvalidState("minimum qp above maximum"));
        }
        let (min_id, max_id) = if self.is_hevc() {
            (
                V4L2_CID_MPEG_VIDEO_HEVC_MIN_QP,
                V4L2_CID_MPEG_VIDEO_HEVC_MAX_QP,
            )
        } else {
            (
                V4L2_CID_MPEG_VIDEO_H264_MIN_QP,
                V4L2_CID_MPEG_VIDEO_H264_MAX_QP,
            )
        };
        self.ctrl(min_id, min as i32, "VIDIOC_S_CTRL(MIN_QP)")?;
        self.ctrl(max_id, max as i32, "VIDIOC_S_CTRL(MAX_QP)")
    }

    pub fn set_gop(&mut self, gop: u32) -> Result<()> {
        self.ctrl(
            V4L2_CID_MPEG_VIDEO_GOP_SIZE,
            gop as i32,
            "VIDIOC_S_CTRL(GOP_SIZE)",
        )
    }

    pub fn set_profile(&mut self, profile: i32) -> Result<()> {
        let id = if self.is_hevc() {
            V4L2_CID_MPEG_VIDEO_HEVC_PROFILE
        } else {
            V4L2_CID_MPEG_VIDEO_H264_PROFILE
        };
        self.ctrl(id, profile, "VIDIOC_S_CTRL(PROFILE)")
    }

    pub fn set_level(&mut self, level: i32) -> Result<()> {
        let id = if self.is_hevc() {
            V4L2_CID_MPEG_VIDEO_HEVC_LEVEL
        } else {
            V4L2_CID_MPEG_VIDEO_H264_LEVEL
        };
        self.ctrl(id, level, "VIDIOC_S_CTRL(LEVEL)")
    }

    pub fn set_hrd_buffer_size(&mut self, size: u32) -> Result<()> {
        self.ctrl(
            V4L2_CID_VENDOR_HRD_BUFFER_SIZE,
            size as i32,
            "VIDIOC_S_CTRL(HRD_BUFFER_SIZE)",
        )
    }

    pub fn set_ltr_mode(&mut self, mode: i32) -> Result<()> {
        self.ctrl(V4L2_CID_VENDOR_LTR_MODE, mode, "VIDIOC_S_CTRL(LTR_MODE)")
    }

    pub fn set_color_description(&mut self, color: ColorDescription) -> Result<()> {
        self.device
            .s_ext_ctrl(V4L2_CID_VENDOR_COLOR_DESC, &color.to_bytes())
            .map_err(Error::ioctl("VIDIOC_S_EXT_CTRLS(COLOR_DESC)"))
    }

    pub fn set_sei_user_data(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::NullArgument("sei user data"));
        }
        self.device
            .s_ext_ctrl(V4L2_CID_VENDOR_SEI_USER_DATA, data)
            .map_err(Error::ioctl("VIDIOC_S_EXT_CTRLS(SEI_USER_DATA)"))
    }

    pub fn force_key_frame(&mut self) -> Result<()> {
        self.ctrl(
            V4L2_CID_MPEG_VIDEO_FORCE_KEY_FRAME,
            1,
            "VIDIOC_S_CTRL(FORCE_KEY_FRAME)",
        )
    }

    /// Enables hardware down-scaling by `ratio` using the vendor `mode`.
    pub fn set_downscale(&mut self, ratio: u32, mode: i32) -> Result<()> {
        let enable = ratio > 1;
        self.ctrl(
            V4L2_CID_VENDOR_DOWNSCALE_FRAME,
            enable as i32,
            "VIDIOC_S_CTRL(DOWNSCALE_FRAME)",
        )?;
        if enable {
            self.ctrl(
                V4L2_CID_VENDOR_DOWNSCALE_RATIO,
                ratio as i32,
                "VIDIOC_S_CTRL(DOWNSCALE_RATIO)",
            )?;
            self.ctrl(
                V4L2_CID_VENDOR_DOWNSCALE_MODE,
                mode,
                "VIDIOC_S_CTRL(DOWNSCALE_MODE)",
            )?;
        }
        self.side.downscale = enable;
        Ok(())
    }

    pub fn set_rotation(&mut self, rotation: Rotation) -> Result<()> {
        if let Err(e) = self.device.s_ctrl(V4L2_CID_ROTATE, rotation.degrees()) {
            debug!("V4L2_CID_ROTATE unsupported ({e}), using buffer flags");
        }
        self.side.rotation = rotation;
        Ok(())
    }

    pub fn set_mirror(&mut self, mirror: Mirror) -> Result<()> {
        for (id, on) in [
            (V4L2_CID_HFLIP, mirror.hflip()),
            (V4L2_CID_VFLIP, mirror.vflip()),
        ] {
            if let Err(e) = self.device.s_ctrl(id, on as i32) {
                debug!("flip control {id:#x} unsupported ({e}), using buffer flags");
            }
        }
        self.side.mirror = mirror;
        Ok(())
    }

    /// Crop applied to the next input unit.
    pub fn set_crop(&mut self, rect: Rect) {
        self.side.crop = Some(rect);
    }

    /// Region of interest applied to the next input frame.
    pub fn set_roi(&mut self, roi: Roi) {
        self.side.roi = Some(roi);
    }

    /// QP override for the next input frame.
    pub fn set_frame_qp(&mut self, qp: i32) {
        self.side.qp = Some(qp);
    }

    /// Long-term reference mode for the next input frame.
    pub fn set_frame_ltr(&mut self, mode: i32) {
        self.side.ltr = Some(mode);
    }

    pub fn apply_tuning(&mut self, tuning: &Tuning) -> Result<()> {
        if let Some(mode) = tuning.rate_control {
            self.set_rate_control(mode)?;
        }
        if let Some(bps) = tuning.bitrate {
            self.set_bitrate(bps)?;
        }
        if let Some((min, max)) = tuning.qp_range {
            self.set_qp_range(min, max)?;
        }
        if let Some(gop) = tuning.gop {
            self.set_gop(gop)?;
        }
        if let Some(profile) = tuning.profile {
            self.set_profile(profile)?;
        }
        if let Some(level) = tuning.level {
            self.set_level(level)?;
        }
        if let Some(size) = tuning.hrd_buffer_size {
            self.set_hrd_buffer_size(size)?;
        }
        if let Some(mode) = tuning.ltr_mode {
            self.set_ltr_mode(mode)?;
        }
        if let Some(color) = tuning.color {
            self.set_color_description(color)?;
        }
        Ok(())
    }
}

impl Drop for Codec {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Codec")
            .field("state", &self.state)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("input_eos", &self.input_eos)
            .field("eos_pts", &self.eos_pts)
            .field("output_eos", &self.output_eos)
            .finish()
    }
}

/// Copies `media` into a mapped input slot, repacking rows when the driver
/// stride differs from the media stride.
fn copy_into_slot(
    buf: &mut crate::buffer::Buffer,
    media: &MediaBuffer,
    fmt: Option<&PixFormat>,
) -> Result<()> {
    let src_stride = media.stride() as usize;
    let dst_stride = fmt.map(|f| f.stride() as usize).unwrap_or(0);
    let layout = media.format().plane_layout(media.width(), media.height());

    let layout = match layout {
        Some(layout) if src_stride > 0 && dst_stride > 0 && src_stride != dst_stride => layout,
        _ => {
            let data = media
                .to_vec()
                .ok_or(Error::InvalidState("media has no cpu mapping"))?;
            return buf.write_payload(&data);
        }
    };

    let base = layout[0].0.max(1);
    let mut planes = Vec::with_capacity(media.plane_count());
    for plane in 0..media.plane_count() {
        let packed_stride = layout.get(plane).map(|p| p.0).unwrap_or(base);
        let src = packed_stride * src_stride / base;
        let dst = packed_stride * dst_stride / base;
        let packed = media
            .read_plane(plane, |data| repack(data, src, dst))
            .ok_or(Error::InvalidState("media has no cpu mapping"))?;
        planes.push(packed);
    }

    if buf.plane_count() == planes.len() {
        for (index, data) in planes.iter().enumerate() {
            let len = data.len();
            buf.with_plane_mut(index, |dst| {
                let n = len.min(dst.len());
                dst[..n].copy_from_slice(&data[..n]);
            })?;
            buf.set_bytes_used(index, len)?;
        }
        Ok(())
    } else {
        buf.write_payload(&planes.concat())
    }
}

/// Re-lays rows of `src_stride` bytes at `dst_stride`, padding with zeros.
fn repack(src: &[u8], src_stride: usize, dst_stride: usize) -> Vec<u8> {
    if src_stride == 0 || dst_stride == 0 {
        return src.to_vec();
    }
    let rows = src.len() / src_stride.max(1);
    let row = src_stride.min(dst_stride);
    let mut out = vec![0u8; rows * dst_stride];
    for (i, chunk) in src.chunks_exact(src_stride).enumerate() {
        out[i * dst_stride..i * dst_stride + row].copy_from_slice(&chunk[..row]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pts_match_policy() {
        let policy = PtsMatch;
        assert!(policy.is_terminal(40, true, Some(40)));
        assert!(!policy.is_terminal(33, true, Some(40)));
        assert!(!policy.is_terminal(40, false, None));
    }

    #[test]
    fn error_after_eos_policy() {
        let policy = ErrorAfterEos;
        assert!(policy.is_terminal(1, true, Some(40)));
        assert!(!policy.is_terminal(40, false, None));
    }

    #[test]
    fn repack_pads_rows() {
        let src = [1, 2, 3, 4, 5, 6];
        assert_eq!(repack(&src, 3, 4), vec![1, 2, 3, 0, 4, 5, 6, 0]);
        assert_eq!(repack(&src, 3, 2), vec![1, 2, 4, 5]);
    }
}
