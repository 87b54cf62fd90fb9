// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use args::{Args, Mode};
use clap::Parser;
use edgefirst_codec::{
    backend::Registry,
    channel::{Decoder, Encoder},
    codec::{Codec, Output, Status},
    fourcc::FourCC,
    media::MediaBuffer,
};
use std::{
    error::Error,
    fs::File,
    io::{BufWriter, Read, Write},
    iter,
    time::Instant,
};
use tracing::{debug, info, info_span, warn};
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, Layer};

mod args;

fn init_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let stdout_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_filter(level);

    let journald = if args.journald {
        match tracing_journald::layer() {
            Ok(layer) => Some(layer.with_filter(level)),
            Err(e) => {
                eprintln!("journald unavailable: {e}");
                None
            }
        }
    } else {
        None
    };

    let tracy = if args.tracy {
        tracy_client::Client::start();
        Some(tracing_tracy::TracyLayer::default().with_filter(level))
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(stdout_log)
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(&args)?;

    let registry = Registry::with_defaults();
    let config = args.codec_config();
    info!(
        "{:?} {} -> {} {}x{} on {:?} backend:{}",
        args.mode,
        config.input.fourcc,
        config.output.fourcc,
        args.width(),
        args.height(),
        args.device,
        args.backend
    );
    let codec = registry.create(&args.backend, Some(args.device.as_path()), config)?;

    let mut input = Vec::new();
    File::open(&args.input)?.read_to_end(&mut input)?;
    let mut output = BufWriter::new(File::create(&args.output)?);

    let start = Instant::now();
    let frames = match args.mode {
        Mode::Decode => decode(codec, &args, &input, &mut output)?,
        Mode::Encode => encode(codec, &args, &input, &mut output)?,
    };
    output.flush()?;

    let elapsed = start.elapsed();
    info!(
        "{} units in {:.2?} ({:.1} fps)",
        frames,
        elapsed,
        frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}

fn decode(
    codec: Codec,
    args: &Args,
    input: &[u8],
    output: &mut impl Write,
) -> Result<u64, Box<dyn Error>> {
    let coding = FourCC::from(args.codec);
    let chunk = args.chunk_size.max(1);
    let mut decoder = Decoder::from_codec(codec)?;

    let packets = input
        .chunks(chunk)
        .enumerate()
        .map(|(pts, data)| MediaBuffer::packet(coding, data.to_vec(), pts as u64));
    let eos_pts = input.len().div_ceil(chunk) as u64;
    let count = pump(
        decoder.codec_mut(),
        packets.chain(iter::once(MediaBuffer::packet(coding, Vec::new(), eos_pts))),
        output,
    )?;
    decoder.destroy()?;
    Ok(count)
}

fn encode(
    codec: Codec,
    args: &Args,
    input: &[u8],
    output: &mut impl Write,
) -> Result<u64, Box<dyn Error>> {
    let format = FourCC::from(args.format);
    let (width, height) = (args.width(), args.height());
    let frame_size = format
        .frame_size(width, height)
        .filter(|size| *size > 0)
        .ok_or("raw format has no frame size")?;
    if input.len() % frame_size != 0 {
        warn!(
            "input is not a whole number of {}x{} {} frames, trailing {} bytes ignored",
            width,
            height,
            format,
            input.len() % frame_size
        );
    }

    let mut encoder = Encoder::from_codec(codec, &args.tuning())?;
    if let Some(rotation) = args.rotation() {
        encoder.codec_mut().set_rotation(rotation)?;
    }
    encoder.codec_mut().set_mirror(args.mirror.into())?;

    let frames = input
        .chunks_exact(frame_size)
        .enumerate()
        .filter_map(|(pts, data)| match raw_frame(format, width, height, data) {
            Ok(frame) => {
                frame.set_pts(pts as u64);
                Some(frame)
            }
            Err(e) => {
                warn!("frame {pts} skipped: {e}");
                None
            }
        });
    let eos_pts = (input.len() / frame_size) as u64;
    let coding = FourCC::from(args.codec);
    let count = pump(
        encoder.codec_mut(),
        frames.chain(iter::once(MediaBuffer::packet(coding, Vec::new(), eos_pts))),
        output,
    )?;
    encoder.destroy()?;
    Ok(count)
}

/// Splits one packed raw frame into the planes of a heap frame.
fn raw_frame(
    format: FourCC,
    width: u32,
    height: u32,
    data: &[u8],
) -> edgefirst_codec::Result<MediaBuffer> {
    let frame = MediaBuffer::frame(format, width, height)?;
    let mut offset = 0;
    for plane in 0..frame.plane_count() {
        frame.write_plane(plane, |dst| {
            let src = &data[offset.min(data.len())..];
            let n = dst.len().min(src.len());
            dst[..n].copy_from_slice(&src[..n]);
            offset += dst.len();
        });
    }
    Ok(frame)
}

/// Feeds `units` and writes every output unit until the codec drains.
fn pump(
    codec: &mut Codec,
    mut units: impl Iterator<Item = MediaBuffer>,
    output: &mut impl Write,
) -> Result<u64, Box<dyn Error>> {
    let mut pending = units.next();
    let mut count = 0;

    loop {
        let _span = info_span!("pump").entered();
        let mut progressed = false;
        if let Some(unit) = pending.take() {
            match codec.handle_input(&unit)? {
                Status::Accepted => {
                    pending = units.next();
                    progressed = true;
                }
                Status::Again => pending = Some(unit),
                Status::EndOfStream => progressed = true,
            }
        }

        match codec.handle_output()? {
            Output::Frame(media) | Output::Corrupted(media) => {
                if media.is_corrupted() {
                    warn!("writing corrupted unit pts:{}", media.pts());
                }
                if let Some(data) = media.to_vec() {
                    output.write_all(&data)?;
                }
                debug!("output {media}");
                count += 1;
                codec.release_output(media)?;
            }
            Output::ResolutionChanged => {
                if let Some(fmt) = codec.output_format() {
                    info!(
                        "output now {}x{} {} stride:{}",
                        fmt.width,
                        fmt.height,
                        fmt.fourcc,
                        fmt.stride()
                    );
                }
            }
            Output::EndOfStream => break,
            Output::Again => {
                if !progressed {
                    codec.poll()?;
                }
            }
        }
    }
    Ok(count)
}
