// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raw frame-stream files and the stream profiles a muxer consumes.
//!
//! A raw file is a typed header (`"video"` or `"audio"`, the encoder
//! name, and the numeric profile fields, all little-endian) followed by
//! packed [`Frame`] records. It's the crate's interchange format for
//! depacketized-but-unmuxed streams, e.g. to count or spot-check frames
//! without involving the media framework.

use std::io::{Read, Write};

use crate::codec::ChannelLayout;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::reader::read_full;

pub const DEFAULT_TIME_BASE: (u32, u32) = (1, 1000);

/// An `AVPixelFormat` value, for the handful this crate's streams use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelFormat(pub i32);

impl PixelFormat {
    pub const NONE: PixelFormat = PixelFormat(-1);
    pub const YUV420P: PixelFormat = PixelFormat(0);
    pub const YUYV422: PixelFormat = PixelFormat(1);
    pub const RGB24: PixelFormat = PixelFormat(2);
}

/// What the muxer needs to declare a video stream.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoProfile {
    pub encoder_name: String,
    pub pix_fmt: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub bit_rate: u32,
    pub frame_rate: f64,
    pub time_base: (u32, u32),
}

/// What the muxer needs to declare an audio stream.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioProfile {
    pub encoder_name: String,
    pub sample_rate: u32,
    pub bit_rate: u32,
    /// Not carried by the on-disk header; populated by the caller, e.g.
    /// from [`probe_audio_channel_layout`](crate::codec::probe_audio_channel_layout).
    pub channel_layout: Option<ChannelLayout>,
    pub time_base: (u32, u32),
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamProfile {
    Video(VideoProfile),
    Audio(AudioProfile),
}

/// Writes a raw file's header.
pub fn write_header<W: Write>(out: &mut W, profile: &StreamProfile) -> Result<()> {
    match profile {
        StreamProfile::Video(v) => {
            write_string(out, b"video")?;
            write_string(out, v.encoder_name.as_bytes())?;
            out.write_all(&v.pix_fmt.0.to_le_bytes())?;
            out.write_all(&(v.width as i32).to_le_bytes())?;
            out.write_all(&(v.height as i32).to_le_bytes())?;
            out.write_all(&(v.bit_rate as i32).to_le_bytes())?;
            out.write_all(&(v.frame_rate.round() as i32).to_le_bytes())?;
        }
        StreamProfile::Audio(a) => {
            write_string(out, b"audio")?;
            write_string(out, a.encoder_name.as_bytes())?;
            out.write_all(&(a.bit_rate as i32).to_le_bytes())?;
            out.write_all(&(a.sample_rate as i32).to_le_bytes())?;
        }
    }
    Ok(())
}

/// Reads a raw file's header. The time base is the crate default; the
/// audio channel layout is not on disk and comes back `None`.
pub fn read_header<R: Read>(src: &mut R) -> Result<StreamProfile> {
    let tag = read_string(src)?;
    match &tag[..] {
        b"video" => {
            let encoder_name = read_utf8_string(src)?;
            let pix_fmt = PixelFormat(read_i32(src)?);
            let width = read_dimension(src, "width")?;
            let height = read_dimension(src, "height")?;
            let bit_rate = read_dimension(src, "bit rate")?;
            let frame_rate = read_dimension(src, "frame rate")?;
            Ok(StreamProfile::Video(VideoProfile {
                encoder_name,
                pix_fmt,
                width,
                height,
                bit_rate,
                frame_rate: f64::from(frame_rate),
                time_base: DEFAULT_TIME_BASE,
            }))
        }
        b"audio" => {
            let encoder_name = read_utf8_string(src)?;
            let bit_rate = read_dimension(src, "bit rate")?;
            let sample_rate = read_dimension(src, "sample rate")?;
            Ok(StreamProfile::Audio(AudioProfile {
                encoder_name,
                sample_rate,
                bit_rate,
                channel_layout: None,
                time_base: DEFAULT_TIME_BASE,
            }))
        }
        other => Err(Error::UnsupportedType(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

/// Lazy iteration over the frames following the header; ends cleanly at
/// EOF on a record boundary.
pub fn read_frames<R: Read>(src: R) -> FrameStream<R> {
    FrameStream { src, done: false }
}

pub struct FrameStream<R: Read> {
    src: R,
    done: bool,
}

impl<R: Read> Iterator for FrameStream<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match Frame::read_from(&mut self.src) {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn write_string<W: Write>(out: &mut W, buf: &[u8]) -> Result<()> {
    if buf.len() > usize::from(u8::MAX) {
        return Err(Error::Malformed(format!(
            "{}-byte string overflows u8 framing",
            buf.len()
        )));
    }
    out.write_all(&[buf.len() as u8])?;
    out.write_all(buf)?;
    Ok(())
}

fn read_string<R: Read>(src: &mut R) -> Result<Vec<u8>> {
    let mut len = [0u8; 1];
    let n = read_full(src, &mut len)?;
    if n < 1 {
        return Err(Error::Truncated {
            expected: 1,
            got: 0,
        });
    }
    let len = usize::from(len[0]);
    let mut buf = vec![0u8; len];
    let n = read_full(src, &mut buf)?;
    if n < len {
        return Err(Error::Truncated {
            expected: len,
            got: n,
        });
    }
    Ok(buf)
}

fn read_utf8_string<R: Read>(src: &mut R) -> Result<String> {
    let buf = read_string(src)?;
    String::from_utf8(buf).map_err(|e| Error::Malformed(format!("non-utf8 string: {}", e)))
}

fn read_i32<R: Read>(src: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    let n = read_full(src, &mut buf)?;
    if n < buf.len() {
        return Err(Error::Truncated {
            expected: buf.len(),
            got: n,
        });
    }
    Ok(i32::from_le_bytes(buf))
}

fn read_dimension<R: Read>(src: &mut R, what: &str) -> Result<u32> {
    let value = read_i32(src)?;
    if value < 0 {
        return Err(Error::Malformed(format!("negative {}: {}", what, value)));
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Cursor;

    fn video_profile() -> StreamProfile {
        StreamProfile::Video(VideoProfile {
            encoder_name: "libvpx".to_owned(),
            pix_fmt: PixelFormat::YUV420P,
            width: 320,
            height: 240,
            bit_rate: 1_000_000,
            frame_rate: 30.0,
            time_base: DEFAULT_TIME_BASE,
        })
    }

    #[test]
    fn video_header_round_trip() {
        let mut buf = Vec::new();
        write_header(&mut buf, &video_profile()).unwrap();
        let read = read_header(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read, video_profile());
    }

    #[test]
    fn audio_header_round_trip() {
        let profile = StreamProfile::Audio(AudioProfile {
            encoder_name: "libopus".to_owned(),
            sample_rate: 48_000,
            bit_rate: 96_000,
            channel_layout: None,
            time_base: DEFAULT_TIME_BASE,
        });
        let mut buf = Vec::new();
        write_header(&mut buf, &profile).unwrap();
        let read = read_header(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read, profile);
    }

    #[test]
    fn frames_after_header() {
        let mut buf = Vec::new();
        write_header(&mut buf, &video_profile()).unwrap();
        for i in 0..3 {
            let frame = Frame {
                pts: i * 33,
                flags: if i == 0 { Frame::FLAG_KEY_FRAME } else { 0 },
                data: Bytes::from(vec![i as u8; 5]),
            };
            frame.write_to(&mut buf).unwrap();
        }
        let mut src = Cursor::new(buf);
        read_header(&mut src).unwrap();
        let frames: Vec<_> = read_frames(src).collect::<Result<_>>().unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_key_frame());
        assert_eq!(frames[2].pts, 66);
    }

    #[test]
    fn bad_tag() {
        let mut buf = Vec::new();
        write_string(&mut buf, b"subtitle").unwrap();
        assert!(matches!(
            read_header(&mut Cursor::new(buf)),
            Err(Error::UnsupportedType(t)) if t == "subtitle"
        ));
    }
}
