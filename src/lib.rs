// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst Codec Library
//!
//! This library drives hardware video codecs exposed by the kernel as
//! stateful V4L2 mem2mem devices. It implements the buffer-queue protocol
//! (format negotiation, buffer allocation, queue/dequeue, streaming,
//! resolution change, end-of-stream and flush) on top of a reference counted
//! media buffer model with zero-copy DMA buffers.
//!
//! ## Features
//!
//! - **Codec State Machine**: [`codec::Codec`] pairs the two queues of a
//!   device and handles resolution changes, error frames and end-of-stream.
//! - **DMA Buffer Management**: Allocate DMA heap buffers and hand them to the
//!   codec without copies.
//! - **Media Buffers**: [`media::MediaBuffer`] is a shared handle whose memory
//!   is released with the last reference.
//! - **Channels**: [`channel::Decoder`] and [`channel::Encoder`] entry points
//!   and a worker thread pumping [`queue::AsyncQueue`]s.
//! - **Backend Registry**: [`backend::Registry`] selects a codec backend by
//!   identifier.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_codec::{
//!     channel::Decoder,
//!     codec::Output,
//!     fourcc::{H264, NV12},
//!     media::MediaBuffer,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut decoder = Decoder::open("/dev/video0", H264, NV12, 1920, 1080)?;
//! decoder.decode(&MediaBuffer::packet(H264, std::fs::read("frame.h264")?, 0))?;
//! decoder.decode(&MediaBuffer::packet(H264, Vec::new(), 1))?;
//! loop {
//!     match decoder.frame()? {
//!         Output::Frame(frame) => println!("{frame}"),
//!         Output::EndOfStream => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: Kernel 5.10+ with V4L2 mem2mem codec and DMA heap support
//!
//! ## Safety
//!
//! This library uses `unsafe` code for ioctls, memory mapping and DMA buffer
//! access. All unsafe operations are isolated to the `device`, `dma` and
//! `media` modules and the `v4l2-sys` crate, and wrapped with safe APIs.

pub mod backend;
pub mod buffer;
pub mod channel;
pub mod codec;
pub mod device;
pub mod dma;
pub mod error;
pub mod fourcc;
pub mod media;
pub mod port;
pub mod queue;

pub use error::{Error, Result};
