// SPDX-License-Identifier: MIT OR Apache-2.0

//! VP8 as specified in [RFC 7741](https://datatracker.ietf.org/doc/html/rfc7741)
//! (payload descriptor) and [RFC 6386 section 9.1](https://datatracker.ietf.org/doc/html/rfc6386#section-9.1)
//! (frame header / key frame header).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const CLOCK_RATE: u32 = 90_000;

/// The mandatory first byte of every VP8 RTP payload.
///
/// ```text
///  0 1 2 3 4 5 6 7
/// +-+-+-+-+-+-+-+-+
/// |X|R|N|S|  PID  |
/// +-+-+-+-+-+-+-+-+
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub x: bool,
    pub r: bool,
    pub n: bool,
    pub s: bool,
    pub pid: u8,
}

impl Descriptor {
    fn parse(b: u8) -> Self {
        Descriptor {
            x: (b & 0x80) != 0,
            r: (b & 0x40) != 0,
            n: (b & 0x20) != 0,
            s: (b & 0x10) != 0,
            pid: b & 0x0f,
        }
    }

    fn pack(&self) -> u8 {
        (u8::from(self.x) << 7)
            | (u8::from(self.r) << 6)
            | (u8::from(self.n) << 5)
            | (u8::from(self.s) << 4)
            | (self.pid & 0x0f)
    }
}

/// The optional extension byte, present when `Descriptor::x` is set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extension {
    pub i: bool,
    pub l: bool,
    pub t: bool,
    pub k: bool,
    pub rsv: u8,
}

impl Extension {
    fn parse(b: u8) -> Self {
        Extension {
            i: (b & 0x80) != 0,
            l: (b & 0x40) != 0,
            t: (b & 0x20) != 0,
            k: (b & 0x10) != 0,
            rsv: b & 0x0f,
        }
    }

    fn pack(&self) -> u8 {
        (u8::from(self.i) << 7)
            | (u8::from(self.l) << 6)
            | (u8::from(self.t) << 5)
            | (u8::from(self.k) << 4)
            | (self.rsv & 0x0f)
    }
}

/// 7- or 15-bit picture id; two bytes on the wire when `m` is set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PictureId {
    pub m: bool,
    pub id: u16,
}

/// TID/Y/KEYIDX byte, present when `Extension::t` or `Extension::k` is set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LayerInfo {
    pub tid: u8,
    pub y: bool,
    pub keyidx: u8,
}

impl LayerInfo {
    fn parse(b: u8) -> Self {
        LayerInfo {
            tid: b >> 5,
            y: (b & 0x10) != 0,
            keyidx: b & 0x0f,
        }
    }

    fn pack(&self) -> u8 {
        (self.tid << 5) | (u8::from(self.y) << 4) | (self.keyidx & 0x0f)
    }
}

/// The uncompressed data chunk at the start of every encoded VP8 frame.
///
/// This is part of the frame data proper, so it is parsed on demand rather
/// than split off the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub p: bool,
    pub ver: u8,
    pub show: bool,
    size0: u8,
    size1: u8,
    size2: u8,
}

impl FrameHeader {
    pub const SIZE: usize = 3;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::Truncated {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        Ok(FrameHeader {
            p: (data[0] & 0x01) != 0,
            ver: (data[0] >> 1) & 0x07,
            show: (data[0] & 0x10) != 0,
            size0: (data[0] >> 5) & 0x07,
            size1: data[1],
            size2: data[2],
        })
    }

    /// True for an intra (key) frame.
    pub fn is_key_frame(&self) -> bool {
        !self.p
    }

    /// Size of the first data partition in bytes.
    pub fn first_partition_size(&self) -> u32 {
        u32::from(self.size0) | (u32::from(self.size1) << 3) | (u32::from(self.size2) << 11)
    }
}

/// The seven bytes following the frame header on key frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyFrameHeader {
    horz: u16,
    vert: u16,
}

impl KeyFrameHeader {
    pub const SIZE: usize = 7;

    pub const START_CODE: [u8; 3] = [0x9d, 0x01, 0x2a];

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::Truncated {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        if data[0..3] != Self::START_CODE {
            return Err(Error::Malformed(format!(
                "bad VP8 key frame start code {:02x} {:02x} {:02x}",
                data[0], data[1], data[2]
            )));
        }
        Ok(KeyFrameHeader {
            horz: u16::from_le_bytes([data[3], data[4]]),
            vert: u16::from_le_bytes([data[5], data[6]]),
        })
    }

    pub fn width(&self) -> u16 {
        self.horz & 0x3fff
    }

    pub fn width_scaling(&self) -> u8 {
        (self.horz >> 14) as u8
    }

    pub fn height(&self) -> u16 {
        self.vert & 0x3fff
    }

    pub fn height_scaling(&self) -> u8 {
        (self.vert >> 14) as u8
    }
}

/// One RTP packet's worth of VP8: the payload descriptor, its optional
/// extensions, and the frame data fragment that follows them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vp8Payload {
    pub desc: Descriptor,
    pub ext: Option<Extension>,
    pub picture_id: Option<PictureId>,
    pub tl0_pic_idx: Option<u8>,
    pub layer_info: Option<LayerInfo>,
    pub data: Bytes,
}

impl Vp8Payload {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut i = 0;
        let next = |i: &mut usize| -> Result<u8> {
            let b = buf.get(*i).copied().ok_or(Error::Truncated {
                expected: *i + 1,
                got: buf.len(),
            })?;
            *i += 1;
            Ok(b)
        };

        let desc = Descriptor::parse(next(&mut i)?);
        let ext = if desc.x {
            Some(Extension::parse(next(&mut i)?))
        } else {
            None
        };
        let picture_id = match ext {
            Some(e) if e.i => {
                let b = next(&mut i)?;
                if b & 0x80 != 0 {
                    let lo = next(&mut i)?;
                    Some(PictureId {
                        m: true,
                        id: (u16::from(b & 0x7f) << 8) | u16::from(lo),
                    })
                } else {
                    Some(PictureId {
                        m: false,
                        id: u16::from(b),
                    })
                }
            }
            _ => None,
        };
        let tl0_pic_idx = match ext {
            Some(e) if e.l => Some(next(&mut i)?),
            _ => None,
        };
        let layer_info = match ext {
            Some(e) if e.t || e.k => Some(LayerInfo::parse(next(&mut i)?)),
            _ => None,
        };
        Ok(Vp8Payload {
            desc,
            ext,
            picture_id,
            tl0_pic_idx,
            layer_info,
            data: Bytes::copy_from_slice(&buf[i..]),
        })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.desc.pack());
        if let Some(e) = self.ext {
            out.put_u8(e.pack());
        }
        if let Some(p) = self.picture_id {
            if p.m {
                out.put_u8(0x80 | ((p.id >> 8) as u8 & 0x7f));
                out.put_u8(p.id as u8);
            } else {
                out.put_u8(p.id as u8 & 0x7f);
            }
        }
        if let Some(t) = self.tl0_pic_idx {
            out.put_u8(t);
        }
        if let Some(l) = self.layer_info {
            out.put_u8(l.pack());
        }
        out.put_slice(&self.data);
    }

    /// True for the first fragment of an encoded frame.
    pub fn is_start_of_frame(&self) -> bool {
        self.desc.s && self.desc.pid == 0
    }

    /// The frame header carried by start-of-frame fragments.
    pub fn frame_header(&self) -> Result<FrameHeader> {
        if !self.is_start_of_frame() {
            return Err(Error::Malformed(
                "frame header requested on a non-start-of-frame VP8 payload".to_owned(),
            ));
        }
        FrameHeader::parse(&self.data)
    }

    pub fn key_frame_header(&self) -> Result<KeyFrameHeader> {
        let header = self.frame_header()?;
        if !header.is_key_frame() {
            return Err(Error::Malformed(
                "key frame header requested on a non-key VP8 frame".to_owned(),
            ));
        }
        KeyFrameHeader::parse(&self.data[FrameHeader::SIZE..])
    }

    pub fn is_key_frame(&self) -> bool {
        self.is_start_of_frame()
            && matches!(self.frame_header(), Ok(h) if h.is_key_frame())
    }

    pub fn width(&self) -> Option<u16> {
        self.key_frame_header().ok().map(|h| h.width())
    }

    pub fn height(&self) -> Option<u16> {
        self.key_frame_header().ok().map(|h| h.height())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 320x240 key frame start, as produced by libvpx.
    const KEY_FRAME: [u8; 11] = [
        0x10, 0x10, 0x00, 0x00, 0x9d, 0x01, 0x2a, 0x40, 0x01, 0xf0, 0x00,
    ];

    #[test]
    fn parse_key_frame_start() {
        let p = Vp8Payload::parse(&KEY_FRAME[..]).unwrap();
        assert!(p.desc.s);
        assert_eq!(p.desc.pid, 0);
        assert!(p.is_start_of_frame());
        assert!(p.is_key_frame());
        assert_eq!(p.width(), Some(320));
        assert_eq!(p.height(), Some(240));
        let h = p.frame_header().unwrap();
        assert!(h.is_key_frame());
        assert!(h.show);
        assert_eq!(h.ver, 0);
    }

    #[test]
    fn interframe_is_not_key() {
        // S=1, PID=0, frame header with P=1.
        let p = Vp8Payload::parse(&[0x10, 0x01, 0x00, 0x00]).unwrap();
        assert!(p.is_start_of_frame());
        assert!(!p.is_key_frame());
        assert_eq!(p.width(), None);
    }

    #[test]
    fn continuation_fragment() {
        // S=0: a continuation, never a frame start regardless of contents.
        let p = Vp8Payload::parse(&[0x00, 0xaa, 0xbb]).unwrap();
        assert!(!p.is_start_of_frame());
        assert!(!p.is_key_frame());
        assert!(p.frame_header().is_err());
    }

    #[test]
    fn extension_round_trip() {
        // X set, I+L+T set, 15-bit picture id.
        let buf = [0x90, 0xe0, 0x81, 0x23, 0x07, 0x42, 0xde, 0xad];
        let p = Vp8Payload::parse(&buf[..]).unwrap();
        let ext = p.ext.unwrap();
        assert!(ext.i && ext.l && ext.t && !ext.k);
        assert_eq!(p.picture_id, Some(PictureId { m: true, id: 0x0123 }));
        assert_eq!(p.tl0_pic_idx, Some(0x07));
        assert_eq!(p.layer_info.unwrap().tid, 0x42 >> 5);
        assert_eq!(&p.data[..], &[0xde, 0xad]);

        let mut out = BytesMut::new();
        p.encode(&mut out);
        assert_eq!(&out[..], &buf[..]);
    }

    #[test]
    fn short_picture_id_round_trip() {
        let buf = [0x90, 0x80, 0x55, 0x01];
        let p = Vp8Payload::parse(&buf[..]).unwrap();
        assert_eq!(p.picture_id, Some(PictureId { m: false, id: 0x55 }));
        let mut out = BytesMut::new();
        p.encode(&mut out);
        assert_eq!(&out[..], &buf[..]);
    }

    #[test]
    fn truncated_extension() {
        assert!(matches!(
            Vp8Payload::parse(&[0x90]),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn bad_start_code() {
        let p = Vp8Payload::parse(&[0x10, 0x10, 0x00, 0x00, 0x9d, 0x01, 0x2b, 0, 0, 0, 0]).unwrap();
        assert!(matches!(p.key_frame_header(), Err(Error::Malformed(_))));
        assert_eq!(p.width(), None);
    }
}
