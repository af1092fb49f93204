// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific logic for the payload kinds found in WebRTC gateway
//! captures.
//!
//! Currently this consists of payload-level parsing for each codec (the
//! per-packet fields the cursor and the depacketizers need: frame starts,
//! key frames, dimensions, sample counts) plus small stream probes that
//! derive container-level parameters from a window of packets.

use std::num::NonZeroU32;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::rtp::RtpPacket;

pub mod opus;
pub mod vp8;

/// The broad media class of a stream, as recorded in archive headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// The closed set of payload kinds a reader can be configured with.
///
/// `Raw` keeps payload bytes opaque; such packets have no clock rate, so
/// time-domain operations on them report [`Error::Unavailable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    Vp8,
    Opus,
    Raw,
}

impl PayloadKind {
    /// The RTP clock rate of this kind, if it has one.
    pub fn clock_rate(self) -> Option<NonZeroU32> {
        match self {
            PayloadKind::Vp8 => NonZeroU32::new(vp8::CLOCK_RATE),
            PayloadKind::Opus => NonZeroU32::new(opus::CLOCK_RATE),
            PayloadKind::Raw => None,
        }
    }

    pub fn media(self) -> Option<MediaKind> {
        match self {
            PayloadKind::Vp8 => Some(MediaKind::Video),
            PayloadKind::Opus => Some(MediaKind::Audio),
            PayloadKind::Raw => None,
        }
    }

    /// Materializes the kind-specific payload from one packet's payload
    /// bytes.
    pub fn parse_payload(self, buf: &[u8]) -> Result<Payload> {
        Ok(match self {
            PayloadKind::Vp8 => Payload::Vp8(vp8::Vp8Payload::parse(buf)?),
            PayloadKind::Opus => Payload::Opus(opus::OpusPayload::parse(buf)?),
            PayloadKind::Raw => Payload::Raw(Bytes::copy_from_slice(buf)),
        })
    }
}

/// A decoded RTP payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Vp8(vp8::Vp8Payload),
    Opus(opus::OpusPayload),
    Raw(Bytes),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Vp8(_) => PayloadKind::Vp8,
            Payload::Opus(_) => PayloadKind::Opus,
            Payload::Raw(_) => PayloadKind::Raw,
        }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Payload::Vp8(p) => p.encode(out),
            Payload::Opus(p) => p.encode(out),
            Payload::Raw(b) => out.extend_from_slice(b),
        }
    }

    /// The bytes a depacketizer concatenates into frames: the fragment
    /// after any payload descriptors for video, the whole packet for audio.
    pub fn frame_data(&self) -> &Bytes {
        match self {
            Payload::Vp8(p) => &p.data,
            Payload::Opus(p) => &p.data,
            Payload::Raw(b) => b,
        }
    }

    /// True on the first packet of an encoded frame. Audio packets each
    /// carry a whole frame, so they're all starts.
    pub fn is_start_of_frame(&self) -> bool {
        match self {
            Payload::Vp8(p) => p.is_start_of_frame(),
            Payload::Opus(_) => true,
            Payload::Raw(_) => false,
        }
    }

    /// True on the first packet of a self-contained frame. Audio frames
    /// never depend on a predecessor.
    pub fn is_key_frame(&self) -> bool {
        match self {
            Payload::Vp8(p) => p.is_key_frame(),
            Payload::Opus(_) => true,
            Payload::Raw(_) => false,
        }
    }

    pub fn width(&self) -> Option<u16> {
        match self {
            Payload::Vp8(p) => p.width(),
            _ => None,
        }
    }

    pub fn height(&self) -> Option<u16> {
        match self {
            Payload::Vp8(p) => p.height(),
            _ => None,
        }
    }

    /// Samples carried by this packet (audio only).
    pub fn nb_samples(&self) -> Result<u32> {
        match self {
            Payload::Opus(p) => p.nb_samples(),
            _ => Err(Error::Unavailable("sample count of a non-audio payload")),
        }
    }

    /// Channels coded by this packet (audio only).
    pub fn nb_channels(&self) -> Result<u8> {
        match self {
            Payload::Opus(p) => p.nb_channels(),
            _ => Err(Error::Unavailable("channel count of a non-audio payload")),
        }
    }
}

/// Audio channel layout, as the muxer profile wants it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl ChannelLayout {
    pub fn nb_channels(self) -> u8 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }
}

/// Returns `(width, height)` from the first key-frame-start packet.
pub fn probe_video_dimensions<I>(packets: I) -> Result<(u16, u16)>
where
    I: IntoIterator<Item = Result<RtpPacket>>,
{
    for pkt in packets {
        let pkt = pkt?;
        if let Payload::Vp8(p) = &pkt.payload {
            if p.is_key_frame() {
                let h = p.key_frame_header()?;
                return Ok((h.width(), h.height()));
            }
        }
    }
    Err(Error::Unavailable("no key frame to probe dimensions from"))
}

/// The usual window for [`estimate_video_frame_rate`].
pub const DEFAULT_FRAME_RATE_WINDOW: usize = 10;

/// Estimates the stream's frame rate in frames per second by timing
/// `window` start-of-frame packets. `window` is clamped to at least 2.
pub fn estimate_video_frame_rate<I>(packets: I, window: usize) -> Result<f64>
where
    I: IntoIterator<Item = Result<RtpPacket>>,
{
    let window = window.max(2);
    let mut first = None;
    let mut last = None;
    let mut seen = 0;
    for pkt in packets {
        let pkt = pkt?;
        if !pkt.payload.is_start_of_frame() {
            continue;
        }
        let secs = pkt
            .secs()
            .ok_or(Error::Unavailable("packet kind has no clock rate"))?;
        if first.is_none() {
            first = Some(secs);
        }
        last = Some(secs);
        seen += 1;
        if seen == window {
            break;
        }
    }
    match (first, last) {
        (Some(f), Some(l)) if seen == window && l > f => Ok((window - 1) as f64 / (l - f)),
        _ => Err(Error::Unavailable(
            "too few start-of-frame packets to estimate a frame rate",
        )),
    }
}

/// Maps the first packet's channel count to a layout.
pub fn probe_audio_channel_layout<I>(packets: I) -> Result<ChannelLayout>
where
    I: IntoIterator<Item = Result<RtpPacket>>,
{
    for pkt in packets {
        let pkt = pkt?;
        return match pkt.payload.nb_channels()? {
            1 => Ok(ChannelLayout::Mono),
            2 => Ok(ChannelLayout::Stereo),
            n => Err(Error::Malformed(format!("unsupported channel count {}", n))),
        };
    }
    Err(Error::Unavailable("no packets to probe a channel layout from"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{Depad, RtpPacket};

    fn vp8_packet(timestamp: u32, payload: &[u8]) -> Result<RtpPacket> {
        let mut buf = vec![0x80, 0x60, 0x00, 0x01];
        buf.extend_from_slice(&timestamp.to_be_bytes());
        buf.extend_from_slice(&0xdead_beefu32.to_be_bytes());
        buf.extend_from_slice(payload);
        RtpPacket::parse(PayloadKind::Vp8, Depad::Strip, &buf)
    }

    const KEY_START: [u8; 11] = [
        0x10, 0x10, 0x00, 0x00, 0x9d, 0x01, 0x2a, 0x40, 0x01, 0xf0, 0x00,
    ];
    const INTER_START: [u8; 4] = [0x10, 0x01, 0x00, 0x00];
    const CONTINUATION: [u8; 2] = [0x00, 0xaa];

    #[test]
    fn dimensions_skip_to_key_frame() {
        let pkts = vec![
            vp8_packet(0, &CONTINUATION),
            vp8_packet(0, &INTER_START),
            vp8_packet(3000, &KEY_START),
        ];
        assert_eq!(probe_video_dimensions(pkts).unwrap(), (320, 240));
    }

    #[test]
    fn dimensions_unavailable_without_key_frame() {
        let pkts = vec![vp8_packet(0, &INTER_START)];
        assert!(matches!(
            probe_video_dimensions(pkts),
            Err(Error::Unavailable(_))
        ));
    }

    #[test]
    fn frame_rate_from_window() {
        // 10 frame starts, one every 3000 ticks at 90 kHz = 30 fps.
        let pkts: Vec<_> = (0..10)
            .flat_map(|i| {
                vec![
                    vp8_packet(i * 3000, &INTER_START),
                    vp8_packet(i * 3000, &CONTINUATION),
                ]
            })
            .collect();
        let rate = estimate_video_frame_rate(pkts, 10).unwrap();
        assert!((rate - 30.0).abs() < 1e-9);
    }

    #[test]
    fn frame_rate_needs_full_window() {
        let pkts: Vec<_> = (0..5).map(|i| vp8_packet(i * 3000, &INTER_START)).collect();
        assert!(matches!(
            estimate_video_frame_rate(pkts, 10),
            Err(Error::Unavailable(_))
        ));
    }

    #[test]
    fn channel_layout_from_first_packet() {
        let mut buf = vec![0x80, 0xe0, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 1];
        buf.push(0xfc); // celt, stereo
        let pkt = RtpPacket::parse(PayloadKind::Opus, Depad::Strip, &buf);
        assert_eq!(
            probe_audio_channel_layout(vec![pkt]).unwrap(),
            ChannelLayout::Stereo
        );
    }
}
