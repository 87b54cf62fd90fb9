// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Decoder and encoder channels layered over a [`Codec`].
//!
//! [`Decoder`] and [`Encoder`] are the synchronous per-direction entry points.
//! Either can be moved onto a [`ChannelWorker`], which drives the codec from
//! its own thread and exchanges media through [`AsyncQueue`]s.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, info, warn};

use crate::{
    codec::{Codec, CodecConfig, Output, Status, Tuning},
    device::PixFormat,
    error::{Error, Result},
    fourcc::FourCC,
    media::MediaBuffer,
    queue::{AsyncQueue, BlockMode, PopOutcome, PushOutcome},
};

/// Decodes bitstream packets into frames.
#[derive(Debug)]
pub struct Decoder {
    codec: Codec,
}

impl Decoder {
    /// Opens `path` as a decoder from `coding` to `format`. `width` and
    /// `height` are the expected geometry; the driver may change it.
    pub fn open(
        path: impl AsRef<Path>,
        coding: FourCC,
        format: FourCC,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        Self::with_config(path, CodecConfig::decoder(coding, format, width, height))
    }

    pub fn with_config(path: impl AsRef<Path>, config: CodecConfig) -> Result<Self> {
        if !config.input.fourcc.is_compressed() {
            return Err(Error::UnsupportedFormat {
                requested: config.input.fourcc,
                actual: config.output.fourcc,
            });
        }
        let mut codec = Codec::open(path, config)?;
        codec.stream()?;
        Ok(Self { codec })
    }

    /// Wraps a created codec and starts streaming.
    pub fn from_codec(mut codec: Codec) -> Result<Self> {
        codec.stream()?;
        Ok(Self { codec })
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn codec_mut(&mut self) -> &mut Codec {
        &mut self.codec
    }

    /// Queues one packet. An empty packet ends the stream.
    pub fn decode(&mut self, packet: &MediaBuffer) -> Result<Status> {
        self.codec.handle_input(packet)
    }

    pub fn frame(&mut self) -> Result<Output> {
        self.codec.handle_output()
    }

    /// Returns a pooled frame to the decoder.
    pub fn release(&mut self, frame: MediaBuffer) -> Result<bool> {
        self.codec.release_output(frame)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.codec.flush(true)
    }

    pub fn into_worker(self, depth: usize) -> Result<ChannelWorker> {
        ChannelWorker::spawn(self.codec, depth)
    }

    pub fn destroy(self) -> Result<()> {
        self.codec.destroy()
    }
}

/// Encodes frames into bitstream packets.
#[derive(Debug)]
pub struct Encoder {
    codec: Codec,
}

impl Encoder {
    pub fn open(
        path: impl AsRef<Path>,
        format: FourCC,
        coding: FourCC,
        width: u32,
        height: u32,
        tuning: &Tuning,
    ) -> Result<Self> {
        Self::with_config(
            path,
            CodecConfig::encoder(format, coding, width, height),
            tuning,
        )
    }

    pub fn with_config(
        path: impl AsRef<Path>,
        config: CodecConfig,
        tuning: &Tuning,
    ) -> Result<Self> {
        if !config.output.fourcc.is_compressed() {
            return Err(Error::UnsupportedFormat {
                requested: config.output.fourcc,
                actual: config.input.fourcc,
            });
        }
        Self::from_codec(Codec::open(path, config)?, tuning)
    }

    /// Applies `tuning` to a created codec and starts streaming.
    pub fn from_codec(mut codec: Codec, tuning: &Tuning) -> Result<Self> {
        codec.apply_tuning(tuning)?;
        codec.stream()?;
        Ok(Self { codec })
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn codec_mut(&mut self) -> &mut Codec {
        &mut self.codec
    }

    /// Queues one frame. A frame flagged end-of-stream ends the stream.
    pub fn encode(&mut self, frame: &MediaBuffer) -> Result<Status> {
        self.codec.handle_input(frame)
    }

    pub fn packet(&mut self) -> Result<Output> {
        self.codec.handle_output()
    }

    pub fn release(&mut self, packet: MediaBuffer) -> Result<bool> {
        self.codec.release_output(packet)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.codec.flush(true)
    }

    pub fn into_worker(self, depth: usize) -> Result<ChannelWorker> {
        ChannelWorker::spawn(self.codec, depth)
    }

    pub fn destroy(self) -> Result<()> {
        self.codec.destroy()
    }
}

/// What a [`ChannelWorker`] hands to its consumer.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Buffer(MediaBuffer),
    Corrupted(MediaBuffer),
    /// Output geometry changed; the new output format.
    ResolutionChanged(PixFormat),
    EndOfStream,
}

struct Queues {
    input: AsyncQueue<MediaBuffer>,
    output: AsyncQueue<ChannelEvent>,
    returns: AsyncQueue<MediaBuffer>,
    stop: AtomicBool,
}

/// Drives a streaming [`Codec`] on a worker thread.
///
/// Producers [`submit`](ChannelWorker::submit) input units, consumers
/// [`receive`](ChannelWorker::receive) output events and give pooled output
/// buffers back with [`give_back`](ChannelWorker::give_back).
pub struct ChannelWorker {
    queues: Arc<Queues>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl ChannelWorker {
    /// Spawns the worker. `depth` bounds both the input and output queues.
    pub fn spawn(codec: Codec, depth: usize) -> Result<Self> {
        let queues = Arc::new(Queues {
            input: AsyncQueue::new(depth, BlockMode::Blocking, BlockMode::NonBlocking),
            output: AsyncQueue::new(depth, BlockMode::Blocking, BlockMode::Blocking),
            returns: AsyncQueue::new(
                codec.output_port().buffer_count().max(1),
                BlockMode::Blocking,
                BlockMode::NonBlocking,
            ),
            stop: AtomicBool::new(false),
        });
        let shared = Arc::clone(&queues);
        let handle = thread::Builder::new()
            .name("codec-channel".to_string())
            .spawn(move || run(codec, shared))?;
        Ok(Self {
            queues,
            handle: Some(handle),
        })
    }

    /// Blocks until the worker has room for `media`.
    pub fn submit(&self, media: MediaBuffer) -> PushOutcome<MediaBuffer> {
        self.queues.input.push(media)
    }

    /// Blocks until the worker produced an event.
    pub fn receive(&self) -> PopOutcome<ChannelEvent> {
        self.queues.output.pop()
    }

    /// Returns a pooled output buffer to the codec.
    pub fn give_back(&self, media: MediaBuffer) -> PushOutcome<MediaBuffer> {
        self.queues.returns.push(media)
    }

    pub fn pending_input(&self) -> usize {
        self.queues.input.len()
    }

    /// Releases every blocked caller, joins the worker and destroys the
    /// codec. Returns the error that stopped the worker, if any.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.queues.stop.store(true, Ordering::Release);
        self.queues.input.set_wait_exit();
        self.queues.output.set_wait_exit();
        self.queues.returns.set_wait_exit();
        let result = match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or(Err(Error::InvalidState("channel worker panicked"))),
            None => Ok(()),
        };
        drop(self.queues.input.drain());
        drop(self.queues.output.drain());
        drop(self.queues.returns.drain());
        result
    }
}

impl Drop for ChannelWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.shutdown() {
                warn!("channel worker: {e}");
            }
        }
    }
}

fn run(mut codec: Codec, queues: Arc<Queues>) -> Result<()> {
    let result = pump(&mut codec, &queues);
    // nothing consumes these once the worker is gone
    queues.input.set_wait_exit();
    queues.returns.set_wait_exit();
    if let Err(e) = &result {
        warn!("channel worker stopped: {e}");
        queues.output.set_wait_exit();
    }
    let destroyed = codec.destroy();
    result.and(destroyed)
}

fn pump(codec: &mut Codec, queues: &Queues) -> Result<()> {
    let mut pending: Option<MediaBuffer> = None;
    let mut input_done = false;
    debug!("channel worker started");

    while !queues.stop.load(Ordering::Acquire) {
        while let PopOutcome::Item(media) = queues.returns.pop() {
            codec.release_output(media)?;
        }

        let mut progressed = false;
        if !input_done {
            if pending.is_none() {
                match queues.input.pop() {
                    PopOutcome::Item(media) => pending = Some(media),
                    PopOutcome::Empty => {}
                    PopOutcome::Exit => break,
                }
            }
            if let Some(media) = pending.take() {
                match codec.handle_input(&media)? {
                    Status::Accepted => progressed = true,
                    Status::Again => pending = Some(media),
                    Status::EndOfStream => {
                        input_done = true;
                        progressed = true;
                    }
                }
            }
        }

        let event = match codec.handle_output()? {
            Output::Frame(media) => ChannelEvent::Buffer(media),
            Output::Corrupted(media) => ChannelEvent::Corrupted(media),
            Output::ResolutionChanged => match codec.output_format() {
                Some(fmt) => ChannelEvent::ResolutionChanged(fmt.clone()),
                None => continue,
            },
            Output::EndOfStream => ChannelEvent::EndOfStream,
            Output::Again => {
                if !progressed {
                    codec.poll()?;
                }
                continue;
            }
        };
        let eos = matches!(event, ChannelEvent::EndOfStream);
        if let PushOutcome::Exit(_) = queues.output.push(event) {
            break;
        }
        if eos {
            info!("channel reached end-of-stream");
            break;
        }
    }
    debug!("channel worker finished");
    Ok(())
}
