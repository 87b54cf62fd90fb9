// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod common;

use std::{sync::Arc, thread, time::Duration};

use common::{Call, FakeDevice};
use edgefirst_codec::{
    buffer::{Roi, Rotation, VENDOR_FLAG_ROTATE_90},
    codec::{Codec, CodecConfig, CodecState, ErrorAfterEos, Output, Status, Tuning},
    device::{Device, DeviceEvent, EventKind, Memory, Rect},
    fourcc::{H264, NV12},
    media::{EndOfStream, MediaBuffer},
    Error,
};
use nix::errno::Errno;
use v4l2_sys::*;

fn decoder_config(width: u32, height: u32) -> CodecConfig {
    let mut config = CodecConfig::decoder(H264, NV12, width, height);
    config.event_thread = false;
    config
}

fn streaming(fake: &Arc<FakeDevice>, config: CodecConfig) -> Codec {
    let device: Arc<dyn Device> = fake.clone();
    let mut codec = Codec::create(device, config).unwrap();
    codec.stream().unwrap();
    codec
}

fn packet(pts: u64) -> MediaBuffer {
    MediaBuffer::packet(H264, vec![0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00], pts)
}

#[test]
fn test_create_negotiates_and_allocates() {
    let fake = FakeDevice::new();
    fake.set_min_capture_buffers(10);
    let device: Arc<dyn Device> = fake.clone();
    let codec = Codec::create(device, decoder_config(1920, 1080)).unwrap();

    assert_eq!(codec.state(), CodecState::Created);
    assert_eq!(codec.input_port().buffer_count(), 4);
    assert_eq!(codec.output_port().buffer_count(), 10);
    let fmt = codec.output_format().unwrap();
    assert_eq!((fmt.width, fmt.height, fmt.fourcc), (1920, 1080, NV12));
    assert!(fake.calls().contains(&Call::Subscribe(V4L2_EVENT_SOURCE_CHANGE)));

    assert!(matches!(
        codec.input_port().buffer(4),
        Err(Error::InvalidIndex { index: 4, count: 4 })
    ));
}

#[test]
fn test_data_path_requires_streaming() {
    let fake = FakeDevice::new();
    let device: Arc<dyn Device> = fake.clone();
    let mut codec = Codec::create(device, decoder_config(640, 480)).unwrap();
    assert!(matches!(
        codec.handle_input(&packet(0)),
        Err(Error::InvalidState(_))
    ));
    codec.stream().unwrap();
    assert_eq!(codec.state(), CodecState::Streaming);
    assert_eq!(fake.pending(fake.capture_queue()), 8);
}

#[test]
fn test_decode_frames() {
    let fake = FakeDevice::new();
    let mut codec = streaming(&fake, decoder_config(640, 480));

    assert_eq!(codec.handle_input(&packet(40)).unwrap(), Status::Accepted);
    assert!(matches!(codec.handle_output().unwrap(), Output::Again));

    assert!(fake.complete_capture(640 * 480 * 3 / 2, 40, V4L2_BUF_FLAG_KEYFRAME));
    let Output::Frame(frame) = codec.handle_output().unwrap() else {
        panic!("expected a frame");
    };
    assert_eq!(frame.pts(), 40);
    assert_eq!(frame.payload_len(), 640 * 480 * 3 / 2);
    assert_eq!((frame.width(), frame.height(), frame.stride()), (640, 480, 640));
    assert!(frame.is_keyframe());
    assert!(!frame.is_corrupted());

    // mapped slots are copied out and handed straight back
    assert_eq!(frame.ref_count(), 1);
    assert_eq!(codec.output_port().queued_count(), 8);
    assert!(!codec.release_output(frame).unwrap());
}

#[test]
fn test_resolution_change() {
    let fake = FakeDevice::new();
    let mut codec = streaming(&fake, decoder_config(1920, 1080));
    assert_eq!(codec.output_port().buffer_count(), 8);
    let generation = codec.output_port().generation();

    fake.clear_calls();
    fake.inject_resolution_change(1280, 720);
    assert!(matches!(
        codec.handle_output().unwrap(),
        Output::ResolutionChanged
    ));

    let fmt = codec.output_format().unwrap();
    assert_eq!((fmt.width, fmt.height), (1280, 720));
    assert_eq!(codec.output_port().buffer_count(), 12);
    assert_eq!(codec.output_port().generation(), generation + 1);
    assert_eq!(codec.output_port().queued_count(), 12);
    assert_eq!(codec.output_port().processed(), 0);
    assert_eq!(codec.state(), CodecState::Streaming);

    // reported once
    assert!(matches!(codec.handle_output().unwrap(), Output::Again));

    let capture = fake.capture_queue();
    let off = fake.position(0, |c| *c == Call::StreamOff(capture)).unwrap();
    let freed = fake.position(off, |c| *c == Call::Reqbufs(capture, 0)).unwrap();
    let set = fake
        .position(freed, |c| *c == Call::SFmt(capture, 1280, 720))
        .unwrap();
    let allocated = fake.position(set, |c| *c == Call::Reqbufs(capture, 12)).unwrap();
    let on = fake.position(allocated, |c| *c == Call::StreamOn(capture)).unwrap();
    fake.position(on, |c| matches!(c, Call::Qbuf(d) if d.queue == capture))
        .unwrap();

    assert!(fake.complete_capture(1280 * 720 * 3 / 2, 3, 0));
    let Output::Frame(frame) = codec.handle_output().unwrap() else {
        panic!("expected a frame");
    };
    assert_eq!((frame.width(), frame.height()), (1280, 720));
}

#[test]
fn test_resolution_change_through_event_thread() {
    for _ in 0..5 {
        let fake = FakeDevice::new();
        let mut codec = streaming(&fake, CodecConfig::decoder(H264, NV12, 1920, 1080));

        fake.inject_resolution_change(720, 480);
        assert!(matches!(
            codec.handle_output().unwrap(),
            Output::ResolutionChanged
        ));
        assert_eq!(codec.output_format().unwrap().width, 720);

        // the event forwarded afterwards brings nothing new
        thread::sleep(Duration::from_millis(20));
        assert!(fake.complete_capture(720 * 480 * 3 / 2, 1, 0));
        assert!(matches!(codec.handle_output().unwrap(), Output::Frame(_)));
        assert!(!codec.output_eos());
        codec.destroy().unwrap();
    }
}

#[test]
fn test_last_buffer_before_source_change_event() {
    let fake = FakeDevice::new();
    let mut codec = streaming(&fake, decoder_config(1920, 1080));

    fake.inject_format_change(1280, 720);
    assert!(matches!(
        codec.handle_output().unwrap(),
        Output::ResolutionChanged
    ));
    assert_eq!(codec.output_format().unwrap().height, 720);
    assert_eq!(codec.output_port().buffer_count(), 12);

    // late event: latched, then cleared by the unchanged format
    fake.push_event(DeviceEvent {
        kind: EventKind::SourceChange {
            changes: V4L2_EVENT_SRC_CH_RESOLUTION,
        },
        pending: 0,
    });
    assert!(fake.complete_capture(1280 * 720 * 3 / 2, 1, 0));
    assert!(matches!(codec.handle_output().unwrap(), Output::Frame(_)));

    let eos = MediaBuffer::packet(H264, Vec::new(), 2);
    assert_eq!(codec.handle_input(&eos).unwrap(), Status::EndOfStream);
    assert!(matches!(codec.handle_output().unwrap(), Output::EndOfStream));
    assert_eq!(codec.output_port().buffer_count(), 12);
}

#[test]
fn test_failed_resolution_change_is_retried() {
    let fake = FakeDevice::new();
    let mut codec = streaming(&fake, decoder_config(640, 480));

    fake.fail_querybuf_at(0);
    fake.inject_resolution_change(1280, 720);
    let err = codec.handle_output().unwrap_err();
    assert_eq!(err.errno(), Some(Errno::ENOMEM));
    assert_eq!(codec.state(), CodecState::Streaming);

    fake.clear_faults();
    assert!(matches!(
        codec.handle_output().unwrap(),
        Output::ResolutionChanged
    ));
    assert_eq!(codec.output_format().unwrap().width, 1280);
    assert_eq!(codec.output_port().buffer_count(), 12);
    assert_eq!(codec.output_port().queued_count(), 12);
    assert!(matches!(codec.handle_output().unwrap(), Output::Again));
}

#[test]
fn test_source_change_without_new_geometry() {
    let fake = FakeDevice::new();
    let mut codec = streaming(&fake, decoder_config(640, 480));
    fake.push_event(DeviceEvent {
        kind: EventKind::SourceChange {
            changes: V4L2_EVENT_SRC_CH_RESOLUTION,
        },
        pending: 0,
    });
    assert!(fake.complete_capture(0, 0, 0));
    assert!(matches!(codec.handle_output().unwrap(), Output::Again));
    assert_eq!(codec.output_port().buffer_count(), 8);
    assert_eq!(codec.output_port().queued_count(), 8);

    assert!(fake.complete_capture(1024, 1, 0));
    assert!(matches!(codec.handle_output().unwrap(), Output::Frame(_)));
}

#[test]
fn test_end_of_stream_latches() {
    let fake = FakeDevice::new();
    let mut codec = streaming(&fake, decoder_config(640, 480));

    assert_eq!(codec.handle_input(&packet(0)).unwrap(), Status::Accepted);
    let eos = MediaBuffer::packet(H264, Vec::new(), 1);
    assert_eq!(codec.handle_input(&eos).unwrap(), Status::EndOfStream);
    assert!(codec.input_eos());
    assert_eq!(codec.eos_pts(), Some(1));
    assert_eq!(codec.handle_input(&packet(2)).unwrap(), Status::EndOfStream);

    assert!(matches!(codec.handle_output().unwrap(), Output::EndOfStream));
    assert!(codec.output_eos());
    assert!(matches!(codec.handle_output().unwrap(), Output::EndOfStream));
}

#[test]
fn test_eos_flag_on_unit_with_data() {
    let fake = FakeDevice::new();
    fake.set_drain_on_eos(false);
    let mut codec = streaming(&fake, decoder_config(640, 480));

    let last = packet(7);
    last.set_eos(EndOfStream::WithData);
    assert_eq!(codec.handle_input(&last).unwrap(), Status::EndOfStream);
    assert_eq!(codec.eos_pts(), Some(7));
    let Some(Call::Qbuf(desc)) = fake
        .calls()
        .into_iter()
        .rev()
        .find(|c| matches!(c, Call::Qbuf(d) if d.queue == fake.output_queue()))
    else {
        panic!("expected qbuf");
    };
    assert!(desc.has_flag(V4L2_BUF_FLAG_LAST));
    assert_eq!(desc.bytes_used(), 8);
}

#[test]
fn test_error_frames() {
    let fake = FakeDevice::new();
    fake.set_drain_on_eos(false);
    let mut codec = streaming(&fake, decoder_config(640, 480));

    codec.handle_input(&packet(3)).unwrap();
    assert!(fake.complete_capture(100, 3, V4L2_BUF_FLAG_ERROR));
    let Output::Corrupted(frame) = codec.handle_output().unwrap() else {
        panic!("expected a corrupted frame");
    };
    assert!(frame.is_corrupted());
    assert_eq!(frame.pts(), 3);

    let eos = MediaBuffer::packet(H264, Vec::new(), 7);
    assert_eq!(codec.handle_input(&eos).unwrap(), Status::EndOfStream);
    assert!(fake.complete_capture(0, 7, V4L2_BUF_FLAG_ERROR));
    assert!(matches!(codec.handle_output().unwrap(), Output::EndOfStream));
    assert!(codec.output_eos());
}

#[test]
fn test_error_after_eos_policy() {
    let fake = FakeDevice::new();
    fake.set_drain_on_eos(false);
    let mut config = decoder_config(640, 480);
    config.eos_policy = Arc::new(ErrorAfterEos);
    let mut codec = streaming(&fake, config);

    assert!(fake.complete_capture(100, 1, V4L2_BUF_FLAG_ERROR));
    assert!(matches!(codec.handle_output().unwrap(), Output::Corrupted(_)));

    codec
        .handle_input(&MediaBuffer::packet(H264, Vec::new(), 50))
        .unwrap();
    assert!(fake.complete_capture(0, 99, V4L2_BUF_FLAG_ERROR));
    assert!(matches!(codec.handle_output().unwrap(), Output::EndOfStream));
}

#[test]
fn test_stop_command_and_flush() {
    let fake = FakeDevice::new();
    let mut config = decoder_config(640, 480);
    config.input.stop_command = true;
    let mut codec = streaming(&fake, config);

    codec.handle_input(&packet(0)).unwrap();
    let eos = MediaBuffer::packet(H264, Vec::new(), 1);
    assert_eq!(codec.handle_input(&eos).unwrap(), Status::EndOfStream);
    assert!(fake
        .calls()
        .contains(&Call::DecoderCmd(V4L2_DEC_CMD_STOP, false)));
    assert!(matches!(codec.handle_output().unwrap(), Output::EndOfStream));

    codec.flush(true).unwrap();
    assert_eq!(codec.state(), CodecState::Flushed);
    assert!(!codec.input_eos());
    assert!(!codec.output_eos());
    assert_eq!(codec.eos_pts(), None);
    assert!(fake
        .calls()
        .contains(&Call::DecoderCmd(V4L2_DEC_CMD_START, false)));
    assert_eq!(codec.output_port().queued_count(), 8);

    assert_eq!(codec.handle_input(&packet(2)).unwrap(), Status::Accepted);
    assert_eq!(codec.state(), CodecState::Streaming);
    assert!(matches!(codec.handle_output().unwrap(), Output::Again));
}

#[test]
fn test_flush_keeps_latches_without_reset() {
    let fake = FakeDevice::new();
    let mut codec = streaming(&fake, decoder_config(640, 480));
    codec
        .handle_input(&MediaBuffer::packet(H264, Vec::new(), 0))
        .unwrap();
    codec.flush(false).unwrap();
    assert!(codec.input_eos());
    assert_eq!(codec.handle_input(&packet(1)).unwrap(), Status::EndOfStream);
}

#[test]
fn test_frame_limit() {
    let fake = FakeDevice::new();
    let mut config = decoder_config(640, 480);
    config.input.frame_limit = Some(2);
    let mut codec = streaming(&fake, config);

    assert_eq!(codec.handle_input(&packet(0)).unwrap(), Status::Accepted);
    assert_eq!(codec.handle_input(&packet(1)).unwrap(), Status::Accepted);
    assert_eq!(codec.handle_input(&packet(2)).unwrap(), Status::EndOfStream);
    assert_eq!(codec.eos_pts(), Some(1));
}

#[test]
fn test_input_backpressure() {
    let fake = FakeDevice::new();
    fake.set_loopback(false);
    let mut codec = streaming(&fake, decoder_config(640, 480));

    for pts in 0..4 {
        assert_eq!(codec.handle_input(&packet(pts)).unwrap(), Status::Accepted);
    }
    assert_eq!(codec.handle_input(&packet(4)).unwrap(), Status::Again);

    assert!(fake.complete_input());
    assert_eq!(codec.handle_input(&packet(4)).unwrap(), Status::Accepted);
}

#[test]
fn test_pooled_output_release() {
    let fake = FakeDevice::new();
    let mut config = decoder_config(320, 240);
    config.output.memory = Memory::UserPtr;
    let mut codec = streaming(&fake, config);

    assert!(fake.complete_capture(320 * 240, 5, 0));
    let Output::Frame(frame) = codec.handle_output().unwrap() else {
        panic!("expected a frame");
    };
    assert_eq!(frame.ref_count(), 2);
    assert_eq!(frame.payload_len(), 320 * 240);
    assert_eq!(codec.output_port().queued_count(), 7);

    assert_eq!(codec.output_fds(), vec![None; 8]);

    // another handle is still alive, the slot stays with the application
    let copy = frame.clone();
    assert!(!codec.release_output(frame).unwrap());
    assert_eq!(codec.output_port().queued_count(), 7);
    let index = copy.origin().unwrap().index;
    assert!(!codec.output_port().buffer(index).unwrap().is_queued());
    assert!(codec.release_output(copy).unwrap());
    assert_eq!(codec.output_port().queued_count(), 8);

    assert!(fake.complete_capture(320 * 240, 6, 0));
    let Output::Frame(stale) = codec.handle_output().unwrap() else {
        panic!("expected a frame");
    };
    fake.inject_resolution_change(640, 480);
    assert!(matches!(
        codec.handle_output().unwrap(),
        Output::ResolutionChanged
    ));
    assert!(!codec.release_output(stale).unwrap());
    assert_eq!(codec.output_fds().len(), 12);
}

#[test]
fn test_one_shot_side_config_survives_failed_queue() {
    let fake = FakeDevice::new();
    let mut codec = streaming(&fake, CodecConfig::encoder(NV12, H264, 320, 240));
    codec.set_roi(Roi {
        rect: Rect {
            left: 16,
            top: 16,
            width: 32,
            height: 32,
        },
        qp_delta: 2,
    });
    fake.clear_calls();

    let frame = MediaBuffer::frame(NV12, 320, 240).unwrap();
    fake.fail_next_qbuf(fake.output_queue());
    let err = codec.handle_input(&frame).unwrap_err();
    assert_eq!(err.errno(), Some(Errno::EIO));
    assert_eq!(codec.handle_input(&frame).unwrap(), Status::Accepted);
    assert_eq!(codec.handle_input(&frame).unwrap(), Status::Accepted);

    let calls = fake.calls();
    let roi: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, Call::SExtCtrl(V4L2_CID_VENDOR_ROI, _)))
        .map(|(i, _)| i)
        .collect();
    let queued: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, Call::Qbuf(d) if d.queue == fake.output_queue()))
        .map(|(i, _)| i)
        .collect();
    // failed attempt and its retry carry the ROI, the next frame does not
    assert_eq!(queued.len(), 3);
    assert_eq!(roi.len(), 2);
    assert!(roi[1] > queued[0] && roi[1] < queued[1]);
}

#[test]
fn test_encoder_controls_and_side_config() {
    let fake = FakeDevice::new();
    let device: Arc<dyn Device> = fake.clone();
    let mut codec = Codec::create(device, CodecConfig::encoder(NV12, H264, 640, 480)).unwrap();
    let tuning = Tuning {
        bitrate: Some(5_000_000),
        gop: Some(30),
        qp_range: Some((10, 40)),
        ..Default::default()
    };
    codec.apply_tuning(&tuning).unwrap();
    codec.stream().unwrap();
    assert!(codec.is_encoder());
    assert_eq!(fake.ctrl(V4L2_CID_MPEG_VIDEO_BITRATE), Some(5_000_000));
    assert_eq!(fake.ctrl(V4L2_CID_MPEG_VIDEO_GOP_SIZE), Some(30));
    assert_eq!(fake.ctrl(V4L2_CID_MPEG_VIDEO_H264_MIN_QP), Some(10));
    assert!(matches!(
        codec.set_qp_range(40, 10),
        Err(Error::InvalidState(_))
    ));

    fake.unsupported_ctrl(V4L2_CID_ROTATE);
    codec.set_rotation(Rotation::Rotation90).unwrap();
    codec.set_frame_qp(22);
    codec.set_roi(Roi {
        rect: Rect {
            left: 0,
            top: 0,
            width: 64,
            height: 64,
        },
        qp_delta: -4,
    });
    fake.clear_calls();

    let frame = MediaBuffer::frame(NV12, 640, 480).unwrap();
    frame.set_pts(1);
    assert_eq!(codec.handle_input(&frame).unwrap(), Status::Accepted);
    frame.set_pts(2);
    assert_eq!(codec.handle_input(&frame).unwrap(), Status::Accepted);

    let calls = fake.calls();
    let qp = calls
        .iter()
        .filter(|c| **c == Call::SCtrl(V4L2_CID_VENDOR_QP_EPR, 22))
        .count();
    let roi = calls
        .iter()
        .filter(|c| matches!(c, Call::SExtCtrl(V4L2_CID_VENDOR_ROI, _)))
        .count();
    assert_eq!((qp, roi), (1, 1));
    let rotated = calls
        .iter()
        .filter(|c| {
            matches!(c, Call::Qbuf(d) if d.queue == fake.output_queue()
                && d.vendor_flags & VENDOR_FLAG_ROTATE_90 != 0)
        })
        .count();
    assert_eq!(rotated, 2);
    let sizes: Vec<usize> = calls
        .iter()
        .filter_map(|c| match c {
            Call::Qbuf(d) if d.queue == fake.output_queue() => Some(d.bytes_used()),
            _ => None,
        })
        .collect();
    assert_eq!(sizes, vec![640 * 480 * 3 / 2; 2]);

    assert!(fake.complete_capture(2048, 1, V4L2_BUF_FLAG_KEYFRAME));
    let Output::Frame(packet) = codec.handle_output().unwrap() else {
        panic!("expected a packet");
    };
    assert_eq!(packet.format(), H264);
    assert_eq!(packet.payload_len(), 2048);
    assert!(packet.is_keyframe());
}

#[test]
fn test_destroy_releases_everything() {
    let fake = FakeDevice::new();
    let codec = streaming(&fake, decoder_config(640, 480));
    codec.destroy().unwrap();
    assert_eq!(fake.allocated(fake.output_queue()), 0);
    assert_eq!(fake.allocated(fake.capture_queue()), 0);
    assert!(fake.calls().contains(&Call::StreamOff(fake.capture_queue())));
}
