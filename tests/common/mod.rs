// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

#![allow(dead_code)]

//! Recording stand-in for a mem2mem device node.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use edgefirst_codec::{
    device::{
        BufferDescriptor, Device, DeviceEvent, EventKind, IoctlResult, Mapping, Memory,
        PixFormat, PlaneFormat, PlaneLocation, QueueType, Readiness, Rect,
    },
    fourcc::{self, FourCC},
};
use nix::errno::Errno;
use v4l2_sys::*;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Reqbufs(QueueType, u32),
    Querybuf(QueueType, u32),
    Qbuf(BufferDescriptor),
    Dqbuf(QueueType, u32),
    StreamOn(QueueType),
    StreamOff(QueueType),
    SFmt(QueueType, u32, u32),
    SCtrl(u32, i32),
    SExtCtrl(u32, Vec<u8>),
    SSelection(QueueType, u32, Rect),
    EncoderCmd(u32, bool),
    DecoderCmd(u32, bool),
    Subscribe(u32),
}

struct State {
    formats: HashMap<QueueType, PixFormat>,
    allocated: HashMap<QueueType, u32>,
    streaming: HashSet<QueueType>,
    pending: HashMap<QueueType, VecDeque<BufferDescriptor>>,
    done: HashMap<QueueType, VecDeque<BufferDescriptor>>,
    drained: HashSet<QueueType>,
    events: VecDeque<DeviceEvent>,
    ctrls: HashMap<u32, i32>,
    unsupported_ctrls: HashSet<u32>,
    rejected: HashSet<FourCC>,
    max_size: (u32, u32),
    fail_querybuf: Option<u32>,
    fail_qbuf: Option<QueueType>,
    stop_supported: bool,
    drain_on_eos: bool,
    loopback: bool,
    calls: Vec<Call>,
}

/// Fake device with single-plane queues by default.
///
/// Input buffers complete as soon as they are queued (loopback) and an
/// empty end-of-stream input buffer drains the capture queue, the way a
/// decoder reports the last frame. Capture buffers only complete when a
/// test calls [`FakeDevice::complete_capture`].
pub struct FakeDevice {
    multiplanar: bool,
    state: Mutex<State>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub fn multiplanar() -> Arc<Self> {
        Self::build(true)
    }

    fn build(multiplanar: bool) -> Arc<Self> {
        let output = QueueType::output(multiplanar);
        let capture = QueueType::capture(multiplanar);
        let mut formats = HashMap::new();
        formats.insert(output, PixFormat::new(output, fourcc::H264, 0, 0));
        formats.insert(capture, PixFormat::new(capture, fourcc::NV12, 0, 0));
        let mut ctrls = HashMap::new();
        ctrls.insert(V4L2_CID_MIN_BUFFERS_FOR_CAPTURE, 4);
        Arc::new(Self {
            multiplanar,
            state: Mutex::new(State {
                formats,
                allocated: HashMap::new(),
                streaming: HashSet::new(),
                pending: HashMap::new(),
                done: HashMap::new(),
                drained: HashSet::new(),
                events: VecDeque::new(),
                ctrls,
                unsupported_ctrls: HashSet::new(),
                rejected: HashSet::new(),
                max_size: (8192, 8192),
                fail_querybuf: None,
                fail_qbuf: None,
                stop_supported: true,
                drain_on_eos: true,
                loopback: true,
                calls: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn output_queue(&self) -> QueueType {
        QueueType::output(self.multiplanar)
    }

    pub fn capture_queue(&self) -> QueueType {
        QueueType::capture(self.multiplanar)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Position of the first recorded call matching `f` at or after `from`.
    pub fn position(&self, from: usize, f: impl Fn(&Call) -> bool) -> Option<usize> {
        self.lock()
            .calls
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, call)| f(call))
            .map(|(i, _)| i)
    }

    pub fn ctrl(&self, id: u32) -> Option<i32> {
        self.lock().ctrls.get(&id).copied()
    }

    pub fn allocated(&self, queue: QueueType) -> u32 {
        self.lock().allocated.get(&queue).copied().unwrap_or(0)
    }

    pub fn pending(&self, queue: QueueType) -> usize {
        self.lock().pending.get(&queue).map(VecDeque::len).unwrap_or(0)
    }

    pub fn set_min_capture_buffers(&self, count: i32) {
        self.lock()
            .ctrls
            .insert(V4L2_CID_MIN_BUFFERS_FOR_CAPTURE, count);
    }

    pub fn set_loopback(&self, loopback: bool) {
        self.lock().loopback = loopback;
    }

    pub fn set_drain_on_eos(&self, drain: bool) {
        self.lock().drain_on_eos = drain;
    }

    pub fn set_stop_supported(&self, supported: bool) {
        self.lock().stop_supported = supported;
    }

    pub fn set_max_size(&self, width: u32, height: u32) {
        self.lock().max_size = (width, height);
    }

    pub fn reject_fourcc(&self, fourcc: FourCC) {
        self.lock().rejected.insert(fourcc);
    }

    pub fn unsupported_ctrl(&self, id: u32) {
        self.lock().unsupported_ctrls.insert(id);
    }

    pub fn fail_querybuf_at(&self, index: u32) {
        self.lock().fail_querybuf = Some(index);
    }

    /// Fails the next QBUF on `queue` with `EIO`.
    pub fn fail_next_qbuf(&self, queue: QueueType) {
        self.lock().fail_qbuf = Some(queue);
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.fail_querybuf = None;
        state.fail_qbuf = None;
    }

    /// Completes the oldest queued capture buffer. Returns `false` when no
    /// capture buffer is queued.
    pub fn complete_capture(&self, bytes: u32, pts: u64, flags: u32) -> bool {
        let queue = self.capture_queue();
        let mut state = self.lock();
        complete(&mut state, queue, bytes, pts, flags)
    }

    /// Completes the oldest queued input buffer when loopback is off.
    pub fn complete_input(&self) -> bool {
        let queue = self.output_queue();
        let mut state = self.lock();
        let Some(desc) = state.pending.get_mut(&queue).and_then(VecDeque::pop_front) else {
            return false;
        };
        state.done.entry(queue).or_default().push_back(desc);
        true
    }

    /// Switches the capture geometry, signals it and returns the last
    /// buffer of the old geometry empty with the LAST flag.
    pub fn inject_resolution_change(&self, width: u32, height: u32) {
        self.push_event(DeviceEvent {
            kind: EventKind::SourceChange {
                changes: V4L2_EVENT_SRC_CH_RESOLUTION,
            },
            pending: 0,
        });
        self.inject_format_change(width, height);
    }

    /// Same as [`FakeDevice::inject_resolution_change`] with the source
    /// change event left out, as if it had not been dequeued yet.
    pub fn inject_format_change(&self, width: u32, height: u32) {
        let queue = self.capture_queue();
        let mut state = self.lock();
        let current = state.formats[&queue].clone();
        let resized = self.sized(PixFormat {
            width,
            height,
            ..current
        });
        state.formats.insert(queue, resized);
        complete(&mut state, queue, 0, 0, V4L2_BUF_FLAG_LAST);
    }

    pub fn push_event(&self, event: DeviceEvent) {
        self.lock().events.push_back(event);
    }

    /// Fills in plane strides and sizes the way a driver would.
    fn sized(&self, mut fmt: PixFormat) -> PixFormat {
        fmt.planes = match fmt.fourcc.plane_layout(fmt.width, fmt.height) {
            Some(layout) if self.multiplanar => layout
                .iter()
                .map(|(stride, size)| PlaneFormat {
                    bytes_per_line: *stride as u32,
                    size_image: *size as u32,
                })
                .collect(),
            Some(layout) => vec![PlaneFormat {
                bytes_per_line: layout[0].0 as u32,
                size_image: layout.iter().map(|(_, size)| *size as u32).sum(),
            }],
            None => vec![PlaneFormat {
                bytes_per_line: 0,
                size_image: (fmt.width * fmt.height).max(64 * 1024),
            }],
        };
        fmt
    }

    fn adjust(&self, state: &State, fmt: &PixFormat) -> PixFormat {
        let mut fmt = fmt.clone();
        if state.rejected.contains(&fmt.fourcc) {
            fmt.fourcc = state.formats[&fmt.queue].fourcc;
        }
        fmt.width = fmt.width.min(state.max_size.0);
        fmt.height = fmt.height.min(state.max_size.1);
        self.sized(fmt)
    }
}

fn complete(state: &mut State, queue: QueueType, bytes: u32, pts: u64, flags: u32) -> bool {
    let Some(mut desc) = state.pending.get_mut(&queue).and_then(VecDeque::pop_front) else {
        return false;
    };
    desc.planes[0].bytes_used = bytes;
    for plane in desc.planes.iter_mut().skip(1) {
        plane.bytes_used = 0;
    }
    desc.timestamp = pts;
    desc.flags = flags;
    state.done.entry(queue).or_default().push_back(desc);
    true
}

impl Device for FakeDevice {
    fn is_multiplanar(&self) -> bool {
        self.multiplanar
    }

    fn reqbufs(&self, queue: QueueType, _memory: Memory, count: u32) -> IoctlResult<u32> {
        let mut state = self.lock();
        state.calls.push(Call::Reqbufs(queue, count));
        if state.streaming.contains(&queue) {
            return Err(Errno::EBUSY);
        }
        state.pending.remove(&queue);
        state.done.remove(&queue);
        state.allocated.insert(queue, count);
        Ok(count)
    }

    fn querybuf(
        &self,
        queue: QueueType,
        memory: Memory,
        index: u32,
    ) -> IoctlResult<BufferDescriptor> {
        let mut state = self.lock();
        state.calls.push(Call::Querybuf(queue, index));
        if state.fail_querybuf == Some(index) {
            return Err(Errno::ENOMEM);
        }
        if index >= state.allocated.get(&queue).copied().unwrap_or(0) {
            return Err(Errno::EINVAL);
        }
        let fmt = &state.formats[&queue];
        let mut desc = BufferDescriptor::new(queue, memory, index, fmt.planes.len());
        for (plane, (desc_plane, fmt_plane)) in
            desc.planes.iter_mut().zip(fmt.planes.iter()).enumerate()
        {
            desc_plane.length = fmt_plane.size_image;
            if memory == Memory::Mmap {
                desc_plane.location = PlaneLocation::Offset((index << 16) | ((plane as u32) << 12));
            }
        }
        Ok(desc)
    }

    fn qbuf(&self, desc: &BufferDescriptor) -> IoctlResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::Qbuf(desc.clone()));
        let queue = desc.queue;
        if state.fail_qbuf == Some(queue) {
            state.fail_qbuf = None;
            return Err(Errno::EIO);
        }
        if desc.index >= state.allocated.get(&queue).copied().unwrap_or(0) {
            return Err(Errno::EINVAL);
        }
        let owned_by_kernel = state
            .pending
            .get(&queue)
            .into_iter()
            .chain(state.done.get(&queue))
            .flatten()
            .any(|d| d.index == desc.index);
        if owned_by_kernel {
            return Err(Errno::EINVAL);
        }

        let mut desc = desc.clone();
        if queue.is_output() {
            let eos = desc.has_flag(V4L2_BUF_FLAG_LAST) && desc.bytes_used() == 0;
            if state.loopback {
                state.done.entry(queue).or_default().push_back(desc);
            } else {
                state.pending.entry(queue).or_default().push_back(desc);
            }
            if eos && state.drain_on_eos {
                let capture = self.capture_queue();
                complete(&mut state, capture, 0, 0, V4L2_BUF_FLAG_LAST);
                state.drained.insert(capture);
            }
        } else {
            desc.flags = 0;
            state.pending.entry(queue).or_default().push_back(desc);
        }
        Ok(())
    }

    fn dqbuf(&self, queue: QueueType, _memory: Memory) -> IoctlResult<BufferDescriptor> {
        let mut state = self.lock();
        match state.done.get_mut(&queue).and_then(VecDeque::pop_front) {
            Some(desc) => {
                state.calls.push(Call::Dqbuf(queue, desc.index));
                Ok(desc)
            }
            None if state.drained.contains(&queue) => Err(Errno::EPIPE),
            None => Err(Errno::EAGAIN),
        }
    }

    fn streamon(&self, queue: QueueType) -> IoctlResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::StreamOn(queue));
        state.streaming.insert(queue);
        Ok(())
    }

    fn streamoff(&self, queue: QueueType) -> IoctlResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::StreamOff(queue));
        state.streaming.remove(&queue);
        state.pending.remove(&queue);
        state.done.remove(&queue);
        state.drained.remove(&queue);
        Ok(())
    }

    fn g_fmt(&self, queue: QueueType) -> IoctlResult<PixFormat> {
        self.lock().formats.get(&queue).cloned().ok_or(Errno::EINVAL)
    }

    fn s_fmt(&self, fmt: &PixFormat) -> IoctlResult<PixFormat> {
        let mut state = self.lock();
        state
            .calls
            .push(Call::SFmt(fmt.queue, fmt.width, fmt.height));
        if state.allocated.get(&fmt.queue).copied().unwrap_or(0) > 0 {
            return Err(Errno::EBUSY);
        }
        let set = self.adjust(&state, fmt);
        state.formats.insert(fmt.queue, set.clone());
        Ok(set)
    }

    fn try_fmt(&self, fmt: &PixFormat) -> IoctlResult<PixFormat> {
        let state = self.lock();
        Ok(self.adjust(&state, fmt))
    }

    fn g_ctrl(&self, id: u32) -> IoctlResult<i32> {
        self.lock().ctrls.get(&id).copied().ok_or(Errno::EINVAL)
    }

    fn s_ctrl(&self, id: u32, value: i32) -> IoctlResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::SCtrl(id, value));
        if state.unsupported_ctrls.contains(&id) {
            return Err(Errno::EINVAL);
        }
        state.ctrls.insert(id, value);
        Ok(())
    }

    fn s_ext_ctrl(&self, id: u32, payload: &[u8]) -> IoctlResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::SExtCtrl(id, payload.to_vec()));
        if state.unsupported_ctrls.contains(&id) {
            return Err(Errno::EINVAL);
        }
        Ok(())
    }

    fn g_selection(&self, queue: QueueType, _target: u32) -> IoctlResult<Rect> {
        let state = self.lock();
        let fmt = state.formats.get(&queue).ok_or(Errno::EINVAL)?;
        Ok(Rect {
            left: 0,
            top: 0,
            width: fmt.width,
            height: fmt.height,
        })
    }

    fn s_selection(&self, queue: QueueType, target: u32, rect: Rect) -> IoctlResult<Rect> {
        self.lock()
            .calls
            .push(Call::SSelection(queue, target, rect));
        Ok(rect)
    }

    fn encoder_cmd(&self, cmd: u32, try_only: bool) -> IoctlResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::EncoderCmd(cmd, try_only));
        self.command(&mut state, cmd, try_only)
    }

    fn decoder_cmd(&self, cmd: u32, try_only: bool) -> IoctlResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::DecoderCmd(cmd, try_only));
        self.command(&mut state, cmd, try_only)
    }

    fn subscribe_event(&self, kind: u32) -> IoctlResult<()> {
        self.lock().calls.push(Call::Subscribe(kind));
        Ok(())
    }

    fn dqevent(&self) -> IoctlResult<DeviceEvent> {
        let mut state = self.lock();
        let pending = state.events.len().saturating_sub(1) as u32;
        state
            .events
            .pop_front()
            .map(|event| DeviceEvent { pending, ..event })
            .ok_or(Errno::ENOENT)
    }

    fn poll(&self, interest: Readiness, timeout: Duration) -> IoctlResult<Readiness> {
        let ready = {
            let state = self.lock();
            let output = self.output_queue();
            let capture = self.capture_queue();
            let queued = |q: &QueueType| {
                state.pending.get(q).map(VecDeque::len).unwrap_or(0)
                    + state.done.get(q).map(VecDeque::len).unwrap_or(0)
            };
            Readiness {
                input: interest.input
                    && (queued(&output) < state.allocated.get(&output).copied().unwrap_or(0) as usize
                        || state.done.get(&output).is_some_and(|d| !d.is_empty())),
                output: interest.output
                    && (state.done.get(&capture).is_some_and(|d| !d.is_empty())
                        || state.drained.contains(&capture)),
                event: interest.event && !state.events.is_empty(),
                error: false,
            }
        };
        if ready.is_empty() {
            thread::sleep(timeout.min(Duration::from_millis(5)));
        }
        Ok(ready)
    }

    fn map_plane(&self, _offset: u32, len: usize) -> IoctlResult<Mapping> {
        Ok(Mapping::anonymous(len))
    }
}

impl FakeDevice {
    fn command(&self, state: &mut State, cmd: u32, try_only: bool) -> IoctlResult<()> {
        if !state.stop_supported && cmd == V4L2_DEC_CMD_STOP {
            return Err(Errno::ENOTTY);
        }
        if try_only {
            return Ok(());
        }
        let capture = self.capture_queue();
        match cmd {
            V4L2_DEC_CMD_STOP => {
                complete(state, capture, 0, 0, V4L2_BUF_FLAG_LAST);
                state.drained.insert(capture);
            }
            V4L2_DEC_CMD_START => {
                state.drained.remove(&capture);
            }
            _ => {}
        }
        Ok(())
    }
}
