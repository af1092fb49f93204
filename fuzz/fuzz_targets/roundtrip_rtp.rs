// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use libfuzzer_sys::fuzz_target;
use restitch::codec::PayloadKind;
use restitch::rtp::{Depad, RtpPacket};

fuzz_target!(|data: &[u8]| {
    // Decoding without depadding must reproduce the input bytes exactly.
    if let Ok(pkt) = RtpPacket::parse(PayloadKind::Raw, Depad::Verbatim, data) {
        assert_eq!(&pkt.to_bytes()[..], data);
    }
});
