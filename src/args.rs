// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_codec::{
    backend::V4L2_M2M,
    buffer::{Mirror, Rotation},
    codec::{CodecConfig, RateControl, Tuning},
    device::Memory,
    fourcc::{self, FourCC},
};
use std::path::PathBuf;

/// Direction of the codec session.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum Mode {
    /// Elementary stream in, raw frames out
    Decode,
    /// Raw frames in, elementary stream out
    Encode,
}

/// Compressed stream format.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum CodingSetting {
    H264,
    Hevc,
    Vp8,
    Vp9,
    Av1,
    Jpeg,
}

impl From<CodingSetting> for FourCC {
    fn from(value: CodingSetting) -> Self {
        match value {
            CodingSetting::H264 => fourcc::H264,
            CodingSetting::Hevc => fourcc::HEVC,
            CodingSetting::Vp8 => fourcc::VP80,
            CodingSetting::Vp9 => fourcc::VP90,
            CodingSetting::Av1 => fourcc::AV1,
            CodingSetting::Jpeg => fourcc::JPEG,
        }
    }
}

/// Raw frame format.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum PixelSetting {
    Nv12,
    Nv21,
    I420,
    Yuyv,
    Rgba,
}

impl From<PixelSetting> for FourCC {
    fn from(value: PixelSetting) -> Self {
        match value {
            PixelSetting::Nv12 => fourcc::NV12,
            PixelSetting::Nv21 => fourcc::NV21,
            PixelSetting::I420 => fourcc::I420,
            PixelSetting::Yuyv => fourcc::YUYV,
            PixelSetting::Rgba => fourcc::RGBA,
        }
    }
}

/// Memory used for the codec output queue.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum MemorySetting {
    /// Driver allocated and mapped, frames are copied out
    Mmap,
    /// Process heap buffers lent to the driver
    Userptr,
    /// DMA heap buffers shared with the driver (zero-copy)
    Dmabuf,
}

impl From<MemorySetting> for Memory {
    fn from(value: MemorySetting) -> Self {
        match value {
            MemorySetting::Mmap => Memory::Mmap,
            MemorySetting::Userptr => Memory::UserPtr,
            MemorySetting::Dmabuf => Memory::DmaBuf,
        }
    }
}

/// Image mirroring options.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum MirrorSetting {
    /// No mirroring
    None,
    /// Flip horizontally (left-right)
    Horizontal,
    /// Flip vertically (top-bottom)
    Vertical,
    /// Flip both horizontally and vertically (180-degree rotation)
    Both,
}

impl From<MirrorSetting> for Mirror {
    fn from(value: MirrorSetting) -> Self {
        match value {
            MirrorSetting::None => Mirror::None,
            MirrorSetting::Horizontal => Mirror::Horizontal,
            MirrorSetting::Vertical => Mirror::Vertical,
            MirrorSetting::Both => Mirror::Both,
        }
    }
}

/// Encoding bitrate presets.
///
/// Controls the trade-off between video quality and file size.
/// Higher bitrates produce better quality but larger files.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum BitratePreset {
    /// Automatic bitrate selection based on resolution
    Auto,
    /// 5 Mbps (suitable for 720p)
    Mbps5,
    /// 25 Mbps (suitable for 1080p)
    Mbps25,
    /// 50 Mbps (suitable for high-quality 1080p)
    Mbps50,
    /// 100 Mbps (suitable for 4K or very high quality)
    Mbps100,
}

impl BitratePreset {
    pub fn bits_per_second(self, width: u32, height: u32) -> u32 {
        match self {
            BitratePreset::Auto => match width.saturating_mul(height) {
                0..=921_600 => 5_000_000,
                921_601..=2_073_600 => 25_000_000,
                _ => 50_000_000,
            },
            BitratePreset::Mbps5 => 5_000_000,
            BitratePreset::Mbps25 => 25_000_000,
            BitratePreset::Mbps50 => 50_000_000,
            BitratePreset::Mbps100 => 100_000_000,
        }
    }
}

/// Command-line arguments for the EdgeFirst codec tool.
///
/// Arguments can be specified via command line or environment variables.
///
/// # Example
///
/// ```bash
/// # Via command line
/// edgefirst-codec --device /dev/video1 --input clip.h264 --output clip.nv12
///
/// # Via environment variables
/// export DEVICE=/dev/video2
/// export MODE=encode
/// edgefirst-codec --input clip.nv12 --output clip.h264
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Codec device path (e.g., /dev/video0)
    #[arg(short, long, env = "DEVICE", default_value = "/dev/video0")]
    pub device: PathBuf,

    /// Codec backend identifier
    #[arg(long, env = "BACKEND", default_value = V4L2_M2M)]
    pub backend: String,

    /// Decode or encode
    #[arg(short, long, env = "MODE", default_value = "decode", value_enum)]
    pub mode: Mode,

    /// Input file (elementary stream or raw frames)
    #[arg(short, long, env = "INPUT")]
    pub input: PathBuf,

    /// Output file (raw frames or elementary stream)
    #[arg(short, long, env = "OUTPUT")]
    pub output: PathBuf,

    /// Compressed stream format
    #[arg(long, env = "CODEC", default_value = "h264", value_enum)]
    pub codec: CodingSetting,

    /// Raw frame format
    #[arg(long, env = "FORMAT", default_value = "nv12", value_enum)]
    pub format: PixelSetting,

    /// Frame resolution in pixels (width height)
    #[arg(
        long,
        env = "SIZE",
        default_value = "1920 1080",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub size: Vec<u32>,

    /// Memory type of the codec output queue
    #[arg(long, env = "MEMORY", default_value = "mmap", value_enum)]
    pub memory: MemorySetting,

    /// Number of input queue buffers
    #[arg(long, env = "INPUT_BUFFERS", default_value = "4")]
    pub input_buffers: u32,

    /// Number of output queue buffers (the driver minimum wins if larger)
    #[arg(long, env = "OUTPUT_BUFFERS", default_value = "8")]
    pub output_buffers: u32,

    /// Stop after this many input frames
    #[arg(long, env = "FRAME_LIMIT")]
    pub frame_limit: Option<u64>,

    /// Signal end-of-stream with a STOP command instead of an empty buffer
    #[arg(long, env = "STOP_COMMAND")]
    pub stop_command: bool,

    /// Bytes per input packet when decoding an elementary stream
    #[arg(long, env = "CHUNK_SIZE", default_value = "65536")]
    pub chunk_size: usize,

    /// Encoding bitrate preset
    #[arg(long, env = "BITRATE", default_value = "auto", value_enum)]
    pub bitrate: BitratePreset,

    /// Encoding group of pictures length
    #[arg(long, env = "GOP")]
    pub gop: Option<u32>,

    /// Encoding rotation in degrees (0, 90, 180 or 270)
    #[arg(long, env = "ROTATION", default_value = "0")]
    pub rotation: i32,

    /// Image mirroring setting
    #[arg(long, env = "MIRROR", default_value = "none", value_enum)]
    pub mirror: MirrorSetting,

    /// Save every payload passing the codec queues into this directory
    #[arg(long, env = "DUMP_DIR")]
    pub dump_dir: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Send logs to the systemd journal
    #[arg(long, env = "JOURNALD")]
    pub journald: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl Args {
    pub fn width(&self) -> u32 {
        self.size.first().copied().unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        self.size.get(1).copied().unwrap_or(0)
    }

    pub fn rotation(&self) -> Option<Rotation> {
        Rotation::from_degrees(self.rotation)
    }

    /// Codec configuration for the selected mode.
    pub fn codec_config(&self) -> CodecConfig {
        let coding = FourCC::from(self.codec);
        let format = FourCC::from(self.format);
        let mut config = match self.mode {
            Mode::Decode => CodecConfig::decoder(coding, format, self.width(), self.height()),
            Mode::Encode => CodecConfig::encoder(format, coding, self.width(), self.height()),
        };
        config.input.buffer_count = self.input_buffers;
        config.input.frame_limit = self.frame_limit;
        config.input.stop_command = self.stop_command;
        config.output.buffer_count = self.output_buffers;
        config.output.memory = self.memory.into();
        if let Some(dir) = &self.dump_dir {
            config.input.dump_path = Some(dir.join(format!("input.{}", config.input.fourcc)));
            config.output.dump_path = Some(dir.join(format!("output.{}", config.output.fourcc)));
        }
        config
    }

    /// Encoder settings derived from the presets.
    pub fn tuning(&self) -> Tuning {
        Tuning {
            bitrate: Some(self.bitrate.bits_per_second(self.width(), self.height())),
            rate_control: Some(RateControl::Cbr),
            gop: self.gop,
            ..Default::default()
        }
    }
}
