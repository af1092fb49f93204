// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP packet model; see [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use bytes::{BufMut, Bytes, BytesMut};
use pretty_hex::PrettyHex;
use smallvec::SmallVec;

use crate::codec::{Payload, PayloadKind};
use crate::error::{Error, Result};

/// The fixed 12-byte RTP header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub mark: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub const SIZE: usize = 12;

    pub const VERSION: u8 = 2;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Truncated {
                expected: Self::SIZE,
                got: buf.len(),
            });
        }
        let version = buf[0] >> 6;
        if version != Self::VERSION {
            return Err(Error::Malformed(format!(
                "RTP version {} (expected {})",
                version,
                Self::VERSION
            )));
        }
        Ok(RtpHeader {
            padding: (buf[0] & 0x20) != 0,
            extension: (buf[0] & 0x10) != 0,
            csrc_count: buf[0] & 0x0f,
            mark: (buf[1] & 0x80) != 0,
            payload_type: buf[1] & 0x7f,
            sequence_number: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(
            (Self::VERSION << 6)
                | (u8::from(self.padding) << 5)
                | (u8::from(self.extension) << 4)
                | (self.csrc_count & 0x0f),
        );
        out.put_u8((u8::from(self.mark) << 7) | (self.payload_type & 0x7f));
        out.put_u16(self.sequence_number);
        out.put_u32(self.timestamp);
        out.put_u32(self.ssrc);
    }
}

/// Whether a packet decoder should honor the header's padding bit.
///
/// Capture formats differ here: pcap records carry packets exactly as they
/// crossed the wire, while the gateway's record files store them already
/// de-padded (with the padding bit still set). This is an explicit
/// per-source flag so neither path relies on a magic default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Depad {
    /// Strip trailing padding when the header's padding bit is set.
    Strip,
    /// Keep the payload bytes exactly as framed.
    Verbatim,
}

/// One archived RTP packet: header, contributing sources, and a decoded
/// payload.
#[derive(Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub csrcs: SmallVec<[u32; 2]>,
    pub payload: Payload,

    /// Length of the stripped padding, 0 when none was present or
    /// [`Depad::Verbatim`] was in effect.
    pub pad_len: u8,
}

impl RtpPacket {
    /// Decodes one packet from `buf`, which must span the packet exactly
    /// (the framing layer knows its length).
    pub fn parse(kind: PayloadKind, depad: Depad, buf: &[u8]) -> Result<Self> {
        let header = RtpHeader::parse(buf)?;
        let mut rest = &buf[RtpHeader::SIZE..];

        let mut csrcs = SmallVec::new();
        if header.csrc_count > 0 {
            let len = 4 * usize::from(header.csrc_count);
            if rest.len() < len {
                return Err(Error::Truncated {
                    expected: RtpHeader::SIZE + len,
                    got: buf.len(),
                });
            }
            for chunk in rest[..len].chunks_exact(4) {
                csrcs.push(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
            rest = &rest[len..];
        }

        let pad_len = if matches!(depad, Depad::Strip) && header.padding {
            let pad = *rest.last().ok_or(Error::Truncated {
                expected: buf.len() + 1,
                got: buf.len(),
            })?;
            if pad == 0 || usize::from(pad) > rest.len() {
                return Err(Error::Malformed(format!(
                    "pad length {} out of range for {}-byte payload",
                    pad,
                    rest.len()
                )));
            }
            log::debug!("stripping {} byte rtp pad", pad);
            rest = &rest[..rest.len() - usize::from(pad)];
            pad
        } else {
            0
        };

        Ok(RtpPacket {
            header,
            csrcs,
            payload: kind.parse_payload(rest)?,
            pad_len,
        })
    }

    /// Serializes the packet, restoring any stripped padding as zero bytes
    /// terminated by the pad length.
    pub fn encode(&self, out: &mut BytesMut) {
        self.header.encode(out);
        for csrc in &self.csrcs {
            out.put_u32(*csrc);
        }
        self.payload.encode(out);
        if self.pad_len > 0 {
            out.put_bytes(0, usize::from(self.pad_len) - 1);
            out.put_u8(self.pad_len);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }

    /// The raw RTP timestamp.
    pub fn ticks(&self) -> u32 {
        self.header.timestamp
    }

    /// The timestamp in seconds of the payload kind's clock, or `None` for
    /// kinds without one. Timestamps are assumed monotonic; 32-bit wrap is
    /// not reconstructed.
    pub fn secs(&self) -> Option<f64> {
        self.payload
            .kind()
            .clock_rate()
            .map(|rate| f64::from(self.header.timestamp) / f64::from(rate.get()))
    }

    pub fn msecs(&self) -> Option<f64> {
        self.secs().map(|s| s * 1000.0)
    }

    /// `secs()` for contexts that need a clock: unknown kinds are an error
    /// rather than a guess.
    pub(crate) fn clocked_secs(&self) -> Result<f64> {
        self.secs()
            .ok_or(Error::Unavailable("packet kind has no clock rate"))
    }
}

impl std::fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpPacket")
            .field("header", &self.header)
            .field("csrcs", &self.csrcs)
            .field("pad_len", &self.pad_len)
            .field("payload", &self.payload.frame_data().hex_dump())
            .finish()
    }
}
