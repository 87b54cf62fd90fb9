// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod common;

use std::{
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

use common::FakeDevice;
use edgefirst_codec::{
    channel::{ChannelEvent, Decoder, Encoder},
    codec::{Codec, CodecConfig, Output, Status, Tuning},
    device::{Device, Memory},
    fourcc::{H264, HEVC, NV12},
    media::MediaBuffer,
    queue::{PopOutcome, PushOutcome},
};
use v4l2_sys::*;

fn decoder(fake: &Arc<FakeDevice>, memory: Memory) -> Decoder {
    let mut config = CodecConfig::decoder(H264, NV12, 320, 240);
    config.event_thread = false;
    config.output.memory = memory;
    let device: Arc<dyn Device> = fake.clone();
    Decoder::from_codec(Codec::create(device, config).unwrap()).unwrap()
}

#[test]
fn test_decoder_round_trip() {
    let fake = FakeDevice::new();
    let mut decoder = decoder(&fake, Memory::Mmap);

    let packet = MediaBuffer::packet(H264, vec![0, 0, 0, 1, 0x65], 0);
    assert_eq!(decoder.decode(&packet).unwrap(), Status::Accepted);
    assert!(fake.complete_capture(320 * 240 * 3 / 2, 0, 0));
    assert!(matches!(decoder.frame().unwrap(), Output::Frame(_)));

    let eos = MediaBuffer::packet(H264, Vec::new(), 1);
    assert_eq!(decoder.decode(&eos).unwrap(), Status::EndOfStream);
    assert!(matches!(decoder.frame().unwrap(), Output::EndOfStream));

    decoder.flush().unwrap();
    assert!(!decoder.codec().input_eos());
    decoder.destroy().unwrap();
}

#[test]
fn test_encoder_applies_tuning() {
    let fake = FakeDevice::new();
    let device: Arc<dyn Device> = fake.clone();
    let codec = Codec::create(device, CodecConfig::encoder(NV12, HEVC, 320, 240)).unwrap();
    let tuning = Tuning {
        qp_range: Some((18, 36)),
        profile: Some(1),
        ..Default::default()
    };
    let mut encoder = Encoder::from_codec(codec, &tuning).unwrap();
    assert_eq!(fake.ctrl(V4L2_CID_MPEG_VIDEO_HEVC_MIN_QP), Some(18));
    assert_eq!(fake.ctrl(V4L2_CID_MPEG_VIDEO_HEVC_MAX_QP), Some(36));
    assert_eq!(fake.ctrl(V4L2_CID_MPEG_VIDEO_HEVC_PROFILE), Some(1));

    let frame = MediaBuffer::frame(NV12, 320, 240).unwrap();
    assert_eq!(encoder.encode(&frame).unwrap(), Status::Accepted);
    assert!(fake.complete_capture(512, 0, V4L2_BUF_FLAG_KEYFRAME));
    let Output::Frame(packet) = encoder.packet().unwrap() else {
        panic!("expected a packet");
    };
    assert_eq!(packet.format(), HEVC);
    assert!(!encoder.release(packet).unwrap());
}

#[test]
fn test_worker_pumps_until_end_of_stream() {
    let fake = FakeDevice::new();
    let worker = decoder(&fake, Memory::UserPtr).into_worker(4).unwrap();

    let packet = MediaBuffer::packet(H264, vec![0, 0, 0, 1, 0x65], 0);
    assert!(matches!(worker.submit(packet), PushOutcome::Pushed));
    assert!(fake.complete_capture(1000, 0, 0));

    let PopOutcome::Item(ChannelEvent::Buffer(frame)) = worker.receive() else {
        panic!("expected a frame");
    };
    assert_eq!(frame.payload_len(), 1000);
    assert!(frame.origin().is_some());
    assert!(matches!(worker.give_back(frame), PushOutcome::Pushed));

    assert!(matches!(
        worker.submit(MediaBuffer::packet(H264, Vec::new(), 1)),
        PushOutcome::Pushed
    ));
    assert!(matches!(
        worker.receive(),
        PopOutcome::Item(ChannelEvent::EndOfStream)
    ));
    worker.stop().unwrap();
}

#[test]
fn test_worker_reports_resolution_change() {
    let fake = FakeDevice::new();
    let worker = decoder(&fake, Memory::Mmap).into_worker(2).unwrap();
    fake.inject_resolution_change(640, 360);

    let PopOutcome::Item(ChannelEvent::ResolutionChanged(fmt)) = worker.receive() else {
        panic!("expected a resolution change");
    };
    assert_eq!((fmt.width, fmt.height), (640, 360));

    // dropping the worker releases it without an explicit stop
    drop(worker);
    assert_eq!(fake.allocated(fake.capture_queue()), 0);
}

#[test]
fn test_worker_resolution_change_with_event_thread() {
    let fake = FakeDevice::new();
    let device: Arc<dyn Device> = fake.clone();
    let codec = Codec::create(device, CodecConfig::decoder(H264, NV12, 320, 240)).unwrap();
    let worker = Decoder::from_codec(codec).unwrap().into_worker(2).unwrap();
    fake.inject_resolution_change(1280, 720);

    let PopOutcome::Item(ChannelEvent::ResolutionChanged(fmt)) = worker.receive() else {
        panic!("expected a resolution change");
    };
    assert_eq!((fmt.width, fmt.height), (1280, 720));

    assert!(fake.complete_capture(1280 * 720 * 3 / 2, 3, 0));
    let PopOutcome::Item(ChannelEvent::Buffer(frame)) = worker.receive() else {
        panic!("expected a frame");
    };
    assert_eq!(frame.pts(), 3);
    drop(frame);
    worker.stop().unwrap();
}

#[test]
fn test_give_back_after_worker_exit() {
    let fake = FakeDevice::new();
    let worker = Arc::new(decoder(&fake, Memory::Mmap).into_worker(2).unwrap());

    assert!(matches!(
        worker.submit(MediaBuffer::packet(H264, Vec::new(), 0)),
        PushOutcome::Pushed
    ));
    assert!(matches!(
        worker.receive(),
        PopOutcome::Item(ChannelEvent::EndOfStream)
    ));

    // more returns than the pool holds, with nobody left to take them
    let (tx, rx) = mpsc::channel();
    let returning = Arc::clone(&worker);
    thread::spawn(move || {
        let mut last = None;
        for pts in 0..20 {
            last = Some(returning.give_back(MediaBuffer::packet(H264, Vec::new(), pts)));
        }
        let _ = tx.send(last);
    });
    let last = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("give_back blocked after the worker exited");
    assert!(matches!(last, Some(PushOutcome::Exit(_))));
    assert!(matches!(
        worker.submit(MediaBuffer::packet(H264, Vec::new(), 1)),
        PushOutcome::Exit(_)
    ));
}
