// SPDX-License-Identifier: MIT OR Apache-2.0

//! The WebRTC gateway's record format: an ASCII marker, a type string,
//! then length-prefixed RTP packets.
//!
//! ```text
//! header = "MEETECHO" | u16-be length | "audio" or "video"
//! record = "MEETECHO" | u16-be length | RTP packet bytes
//! ```
//!
//! The gateway strips RTP padding when it records (leaving the header's
//! padding bit set), so packets decode with [`Depad::Verbatim`].

use std::convert::TryFrom;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::codec::{MediaKind, PayloadKind};
use crate::error::{Error, Result};
use crate::reader::{read_full, PacketFilter, PacketRead};
use crate::rtp::{Depad, RtpPacket};

pub const MARKER: &[u8; 8] = b"MEETECHO";

/// Registry constructor for `.mjr` files.
pub fn open(path: &Path, kind: PayloadKind) -> Result<Box<dyn PacketRead>> {
    let src = BufReader::new(File::open(path)?);
    Ok(Box::new(MjrReader::new(src, kind)?))
}

/// Reads `RtpPacket`s from record-framed ("MJR") sources.
pub struct MjrReader<R: Read + Seek> {
    src: R,
    kind: PayloadKind,
    media: MediaKind,
    org: u64,
    filter: Option<PacketFilter>,
}

impl<R: Read + Seek> MjrReader<R> {
    /// Reads the file header and positions the reader at the first record.
    pub fn new(src: R, kind: PayloadKind) -> Result<Self> {
        Self::with_filter(src, kind, None)
    }

    pub fn with_filter(mut src: R, kind: PayloadKind, filter: Option<PacketFilter>) -> Result<Self> {
        read_marker(&mut src)?;
        let type_string = read_string(&mut src)?;
        let media = match &type_string[..] {
            b"audio" => MediaKind::Audio,
            b"video" => MediaKind::Video,
            other => {
                return Err(Error::UnsupportedType(
                    String::from_utf8_lossy(other).into_owned(),
                ))
            }
        };
        let org = src.stream_position()?;
        Ok(MjrReader {
            src,
            kind,
            media,
            org,
            filter,
        })
    }

    fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut marker = [0u8; 8];
        match read_full(&mut self.src, &mut marker)? {
            0 => return Ok(None), // clean end of stream
            n if n < marker.len() => {
                return Err(Error::Truncated {
                    expected: marker.len(),
                    got: n,
                })
            }
            _ => {}
        }
        check_marker(&marker)?;
        read_string(&mut self.src).map(Some)
    }
}

impl<R: Read + Seek> PacketRead for MjrReader<R> {
    fn kind(&self) -> PayloadKind {
        self.kind
    }

    fn media(&self) -> Option<MediaKind> {
        Some(self.media)
    }

    fn next_packet(&mut self) -> Result<Option<RtpPacket>> {
        loop {
            let buf = match self.read_record()? {
                Some(buf) => buf,
                None => return Ok(None),
            };
            let pkt = RtpPacket::parse(self.kind, Depad::Verbatim, &buf)?;
            match &self.filter {
                Some(filter) if !filter(&pkt) => continue,
                _ => return Ok(Some(pkt)),
            }
        }
    }

    fn skip_packet(&mut self) -> Result<Option<u64>> {
        let pos = self.src.stream_position()?;
        let mut marker = [0u8; 8];
        match read_full(&mut self.src, &mut marker)? {
            0 => return Ok(None),
            n if n < marker.len() => {
                return Err(Error::Truncated {
                    expected: marker.len(),
                    got: n,
                })
            }
            _ => {}
        }
        check_marker(&marker)?;
        let mut len = [0u8; 2];
        let n = read_full(&mut self.src, &mut len)?;
        if n < len.len() {
            return Err(Error::Truncated {
                expected: len.len(),
                got: n,
            });
        }
        self.src
            .seek(SeekFrom::Current(i64::from(u16::from_be_bytes(len))))?;
        Ok(Some(pos))
    }

    fn position(&mut self) -> Result<u64> {
        Ok(self.src.stream_position()?)
    }

    fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.src.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.seek_to(self.org)
    }
}

fn read_marker<R: Read>(src: &mut R) -> Result<()> {
    let mut marker = [0u8; 8];
    let n = read_full(src, &mut marker)?;
    if n < marker.len() {
        return Err(Error::Truncated {
            expected: marker.len(),
            got: n,
        });
    }
    check_marker(&marker)
}

fn check_marker(marker: &[u8; 8]) -> Result<()> {
    if marker != MARKER {
        return Err(Error::Malformed(format!(
            "bad record marker {:?}",
            String::from_utf8_lossy(marker)
        )));
    }
    Ok(())
}

fn read_string<R: Read>(src: &mut R) -> Result<Vec<u8>> {
    let mut len = [0u8; 2];
    let n = read_full(src, &mut len)?;
    if n < len.len() {
        return Err(Error::Truncated {
            expected: len.len(),
            got: n,
        });
    }
    let len = usize::from(u16::from_be_bytes(len));
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

/// Writes the file header for a new recording.
pub fn write_header<W: Write>(out: &mut W, media: MediaKind) -> Result<()> {
    out.write_all(MARKER)?;
    write_string(out, media.as_str().as_bytes())
}

/// Appends one packet record.
pub fn write_packet<W: Write>(out: &mut W, pkt: &RtpPacket) -> Result<()> {
    out.write_all(MARKER)?;
    write_string(out, &pkt.to_bytes())
}

fn write_string<W: Write>(out: &mut W, buf: &[u8]) -> Result<()> {
    let len = u16::try_from(buf.len())
        .map_err(|_| Error::Malformed(format!("{}-byte record overflows u16 framing", buf.len())))?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(buf)?;
    Ok(())
}
