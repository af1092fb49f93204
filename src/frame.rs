// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encoded frames and the depacketizers that assemble them from RTP
//! packets.
//!
//! A [`Frame`] is what the external muxer consumes: a presentation
//! timestamp (milliseconds by default), flags, and the encoded bytes,
//! mirroring an `AVPacket`. [`Frames`] depacketizes audio (one packet per
//! frame); [`VideoFrames`] reassembles video frames from their fragments,
//! synchronizing to the first key frame before emitting anything.

use bytes::{Bytes, BytesMut};
use log::debug;

use crate::codec::vp8;
use crate::error::{Error, Result};
use crate::reader::read_full;
use crate::rtp::RtpPacket;

/// One encoded frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// Presentation timestamp, in the consumer's time base (1/1000 by
    /// default).
    pub pts: i64,
    pub flags: u32,
    pub data: Bytes,
}

impl Frame {
    /// The frame can be decoded without reference to any other
    /// (`AV_PKT_FLAG_KEY`).
    pub const FLAG_KEY_FRAME: u32 = 1 << 0;

    /// The frame's data is known damaged (`AV_PKT_FLAG_CORRUPT`).
    pub const FLAG_CORRUPT: u32 = 1 << 1;

    pub fn is_key_frame(&self) -> bool {
        self.flags & Self::FLAG_KEY_FRAME != 0
    }

    pub fn is_corrupt(&self) -> bool {
        self.flags & Self::FLAG_CORRUPT != 0
    }

    /// Reads one packed frame (`pts: i64, flags: i32, len: i32, data`,
    /// little-endian). A clean end of input yields `None`.
    pub fn read_from<R: std::io::Read>(src: &mut R) -> Result<Option<Frame>> {
        let mut header = [0u8; 16];
        match read_full(src, &mut header)? {
            0 => return Ok(None),
            n if n < header.len() => {
                return Err(Error::Truncated {
                    expected: header.len(),
                    got: n,
                })
            }
            _ => {}
        }
        let pts = i64::from_le_bytes([
            header[0], header[1], header[2], header[3], header[4], header[5], header[6], header[7],
        ]);
        let flags = i32::from_le_bytes([header[8], header[9], header[10], header[11]]) as u32;
        let len = i32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        if len < 0 {
            return Err(Error::Malformed(format!("negative frame length {}", len)));
        }
        let len = len as usize;
        let mut data = vec![0u8; len];
        let n = read_full(src, &mut data)?;
        if n < len {
            return Err(Error::Truncated {
                expected: len,
                got: n,
            });
        }
        Ok(Some(Frame {
            pts,
            flags,
            data: Bytes::from(data),
        }))
    }

    /// The inverse of [`read_from`](Self::read_from).
    pub fn write_to<W: std::io::Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(&self.pts.to_le_bytes())?;
        out.write_all(&(self.flags as i32).to_le_bytes())?;
        out.write_all(&(self.data.len() as i32).to_le_bytes())?;
        out.write_all(&self.data)?;
        Ok(())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("pts", &self.pts)
            .field("flags", &self.flags)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// A [`Frame`] known to hold encoded video, with dimensions derivable
/// from the bitstream on key frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoFrame(pub Frame);

impl VideoFrame {
    pub fn pts(&self) -> i64 {
        self.0.pts
    }

    pub fn flags(&self) -> u32 {
        self.0.flags
    }

    pub fn data(&self) -> &Bytes {
        &self.0.data
    }

    pub fn is_key_frame(&self) -> bool {
        self.0.is_key_frame()
    }

    pub fn is_corrupt(&self) -> bool {
        self.0.is_corrupt()
    }

    pub fn into_frame(self) -> Frame {
        self.0
    }

    /// `(width, height)`, available on key frames only.
    pub fn dimensions(&self) -> Option<(u16, u16)> {
        let header = vp8::FrameHeader::parse(&self.0.data).ok()?;
        if !header.is_key_frame() {
            return None;
        }
        let key = vp8::KeyFrameHeader::parse(&self.0.data[vp8::FrameHeader::SIZE..]).ok()?;
        Some((key.width(), key.height()))
    }

    pub fn width(&self) -> Option<u16> {
        self.dimensions().map(|d| d.0)
    }

    pub fn height(&self) -> Option<u16> {
        self.dimensions().map(|d| d.1)
    }
}

/// Audio depacketizer: one packet in, one key frame out, with the pts
/// rebased so the first frame lands at `pts_delay`.
pub struct Frames<I> {
    packets: I,
    pts_delay: i64,
    pts_offset: Option<i64>,
    pts_from: fn(&RtpPacket) -> Option<f64>,
}

impl<I: Iterator<Item = Result<RtpPacket>>> Frames<I> {
    pub fn new(packets: impl IntoIterator<Item = Result<RtpPacket>, IntoIter = I>) -> Self {
        Self::with_delay(packets, 0)
    }

    pub fn with_delay(
        packets: impl IntoIterator<Item = Result<RtpPacket>, IntoIter = I>,
        pts_delay: i64,
    ) -> Self {
        Frames {
            packets: packets.into_iter(),
            pts_delay,
            pts_offset: None,
            pts_from: RtpPacket::msecs,
        }
    }

    /// Overrides the packet-to-milliseconds projection.
    pub fn with_projection(mut self, pts_from: fn(&RtpPacket) -> Option<f64>) -> Self {
        self.pts_from = pts_from;
        self
    }
}

impl<I: Iterator<Item = Result<RtpPacket>>> Iterator for Frames<I> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let pkt = match self.packets.next()? {
            Ok(pkt) => pkt,
            Err(e) => return Some(Err(e)),
        };
        let msecs = match (self.pts_from)(&pkt) {
            Some(msecs) => msecs as i64,
            None => return Some(Err(Error::Unavailable("packet kind has no clock rate"))),
        };
        let offset = *self.pts_offset.get_or_insert(self.pts_delay - msecs);
        Some(Ok(Frame {
            pts: msecs + offset,
            flags: Frame::FLAG_KEY_FRAME,
            data: pkt.payload.frame_data().clone(),
        }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    PreStart,
    PreKey,
    Assembling,
    Done,
}

/// Video depacketizer: concatenates payload fragments between successive
/// start-of-frame packets into whole frames.
///
/// Construction drains the input up to the first start-of-frame packet,
/// then up to the first key frame, so the first emitted frame is always
/// decodable; the counts of packets dropped on the way are kept for
/// diagnostics. The pts of the first frame is `pts_delay`.
pub struct VideoFrames<I> {
    packets: I,
    held: Option<RtpPacket>,
    state: State,
    pts_offset: i64,
    pts_delay: i64,
    start_frame_offset: u64,
    key_frame_offset: u64,
}

impl<I: Iterator<Item = Result<RtpPacket>>> VideoFrames<I> {
    pub fn new(packets: impl IntoIterator<Item = Result<RtpPacket>, IntoIter = I>) -> Result<Self> {
        Self::with_delay(packets, 0)
    }

    pub fn with_delay(
        packets: impl IntoIterator<Item = Result<RtpPacket>, IntoIter = I>,
        pts_delay: i64,
    ) -> Result<Self> {
        let mut frames = VideoFrames {
            packets: packets.into_iter(),
            held: None,
            state: State::PreStart,
            pts_offset: 0,
            pts_delay,
            start_frame_offset: 0,
            key_frame_offset: 0,
        };
        frames.sync()?;
        Ok(frames)
    }

    /// Packets dropped before the first start-of-frame.
    pub fn start_frame_offset(&self) -> u64 {
        self.start_frame_offset
    }

    /// Start-of-frame packets dropped before the first key frame.
    pub fn key_frame_offset(&self) -> u64 {
        self.key_frame_offset
    }

    fn sync(&mut self) -> Result<()> {
        loop {
            match self.state {
                State::PreStart => match self.pull()? {
                    None => self.state = State::Done,
                    Some(pkt) if pkt.payload.is_start_of_frame() => {
                        self.held = Some(pkt);
                        self.state = State::PreKey;
                    }
                    Some(_) => {
                        debug!("dropping non-frame-start packet");
                        self.start_frame_offset += 1;
                    }
                },
                State::PreKey => {
                    let held_is_key = self
                        .held
                        .as_ref()
                        .map(|pkt| pkt.payload.is_key_frame())
                        .unwrap_or(false);
                    if held_is_key {
                        self.state = State::Assembling;
                        continue;
                    }
                    if self.held.take().is_some() {
                        // a start-of-frame that opens a non-key frame
                        debug!("dropping pre-key start-of-frame packet");
                        self.key_frame_offset += 1;
                    }
                    match self.pull()? {
                        None => self.state = State::Done,
                        Some(pkt) if pkt.payload.is_key_frame() => {
                            self.held = Some(pkt);
                            self.state = State::Assembling;
                        }
                        Some(pkt) if pkt.payload.is_start_of_frame() => {
                            // counted when the loop takes it back out
                            self.held = Some(pkt);
                        }
                        Some(_) => debug!("dropping pre-key-frame packet"),
                    }
                }
                State::Assembling => {
                    let msecs = match self.held.as_ref().and_then(RtpPacket::msecs) {
                        Some(msecs) => msecs as i64,
                        None => {
                            return Err(Error::Unavailable("packet kind has no clock rate"))
                        }
                    };
                    self.pts_offset = self.pts_delay - msecs;
                    return Ok(());
                }
                State::Done => return Ok(()),
            }
        }
    }

    fn pull(&mut self) -> Result<Option<RtpPacket>> {
        self.packets.next().transpose()
    }
}

impl<I: Iterator<Item = Result<RtpPacket>>> Iterator for VideoFrames<I> {
    type Item = Result<VideoFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state != State::Assembling {
            return None;
        }
        let first = loop {
            match self.held.take() {
                Some(pkt) if pkt.payload.is_start_of_frame() => break pkt,
                Some(pkt) => {
                    // resync: a frame boundary was expected
                    debug!("dropping non-frame-start packet {:?}", pkt);
                    match self.pull() {
                        Ok(Some(next)) => self.held = Some(next),
                        Ok(None) => {
                            self.state = State::Done;
                            return None;
                        }
                        Err(e) => {
                            self.state = State::Done;
                            return Some(Err(e));
                        }
                    }
                }
                None => {
                    self.state = State::Done;
                    return None;
                }
            }
        };

        let msecs = match first.msecs() {
            Some(msecs) => msecs as i64,
            None => {
                self.state = State::Done;
                return Some(Err(Error::Unavailable("packet kind has no clock rate")));
            }
        };
        let mut flags = 0;
        if first.payload.is_key_frame() {
            flags |= Frame::FLAG_KEY_FRAME;
        }
        let mut data = BytesMut::from(&first.payload.frame_data()[..]);
        loop {
            match self.pull() {
                Ok(Some(pkt)) => {
                    if pkt.payload.is_start_of_frame() {
                        self.held = Some(pkt);
                        break;
                    }
                    data.extend_from_slice(pkt.payload.frame_data());
                }
                Ok(None) => {
                    self.held = None;
                    self.state = State::Done;
                    break;
                }
                Err(e) => {
                    self.state = State::Done;
                    return Some(Err(e));
                }
            }
        }
        Some(Ok(VideoFrame(Frame {
            pts: msecs + self.pts_offset,
            flags,
            data: data.freeze(),
        })))
    }
}
