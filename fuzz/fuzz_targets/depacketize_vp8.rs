// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use libfuzzer_sys::fuzz_target;
use restitch::codec::PayloadKind;
use restitch::frame::VideoFrames;
use restitch::rtp::{Depad, RtpPacket};

fuzz_target!(|data: &[u8]| {
    // Carve the input into pseudo-packets and push them through the
    // depacketizer; parse failures are fine, panics are not.
    let pkts: Vec<_> = data
        .chunks(64)
        .filter_map(|chunk| RtpPacket::parse(PayloadKind::Vp8, Depad::Strip, chunk).ok())
        .map(Ok)
        .collect();
    if let Ok(frames) = VideoFrames::new(pkts) {
        for frame in frames {
            if frame.is_err() {
                break;
            }
        }
    }
});
