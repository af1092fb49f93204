// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming decoders for the archive formats packets arrive in.
//!
//! Every reader binds a seekable byte source and a [`PayloadKind`] at
//! construction and then supports two forms of iteration: [`packets`]
//! (decoded [`RtpPacket`]s, optionally filtered) and [`index`] (byte
//! offsets of each record, for random access without materializing
//! packets). A process-wide registry maps file extensions to reader
//! constructors so callers can open archives by path alone.
//!
//! [`packets`]: PacketReadExt::packets
//! [`index`]: PacketReadExt::index

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::codec::{MediaKind, PayloadKind};
use crate::error::{Error, Result};
use crate::rtp::RtpPacket;

pub mod mjr;
pub mod pcap;

/// Keep-predicate applied by [`PacketRead::next_packet`]; rejected packets
/// are decoded but never yielded.
pub type PacketFilter = Box<dyn Fn(&RtpPacket) -> bool>;

/// A streaming decoder over one archive file.
pub trait PacketRead {
    /// The payload kind packets are decoded as.
    fn kind(&self) -> PayloadKind;

    /// The stream's media class, when the format records one.
    fn media(&self) -> Option<MediaKind>;

    /// Decodes the next packet passing the filter, or `None` at a clean
    /// end of stream. Truncation mid-record is an error.
    fn next_packet(&mut self) -> Result<Option<RtpPacket>>;

    /// Advances past the next record without decoding it, returning the
    /// record's byte offset.
    fn skip_packet(&mut self) -> Result<Option<u64>>;

    fn position(&mut self) -> Result<u64>;

    fn seek_to(&mut self, offset: u64) -> Result<()>;

    /// Seeks back to the first record (just past any file header).
    fn rewind(&mut self) -> Result<()>;
}

pub trait PacketReadExt: PacketRead {
    /// Lazy forward iteration over decoded packets.
    fn packets(&mut self) -> Packets<'_, Self> {
        Packets { reader: self }
    }

    /// Lazy forward iteration over record byte offsets. The source is
    /// restored to its pre-scan position once the scan completes.
    fn index(&mut self) -> Index<'_, Self> {
        Index {
            reader: self,
            origin: None,
            done: false,
        }
    }
}

impl<R: PacketRead + ?Sized> PacketReadExt for R {}

pub struct Packets<'a, R: PacketRead + ?Sized> {
    reader: &'a mut R,
}

impl<R: PacketRead + ?Sized> Iterator for Packets<'_, R> {
    type Item = Result<RtpPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_packet().transpose()
    }
}

pub struct Index<'a, R: PacketRead + ?Sized> {
    reader: &'a mut R,
    origin: Option<u64>,
    done: bool,
}

impl<R: PacketRead + ?Sized> Iterator for Index<'_, R> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.origin.is_none() {
            match self.reader.position() {
                Ok(pos) => self.origin = Some(pos),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        match self.reader.skip_packet() {
            Ok(Some(offset)) => Some(Ok(offset)),
            Ok(None) => {
                self.done = true;
                if let Some(origin) = self.origin {
                    if let Err(e) = self.reader.seek_to(origin) {
                        return Some(Err(e));
                    }
                }
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Reads into `buf` until it is full or the source is exhausted, returning
/// the number of bytes read.
pub(crate) fn read_full<R: std::io::Read>(src: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// A reader constructor, as stored in the format registry.
pub type OpenFn = fn(&Path, PayloadKind) -> Result<Box<dyn PacketRead>>;

static FORMATS: Lazy<RwLock<HashMap<String, OpenFn>>> = Lazy::new(|| {
    let mut formats = HashMap::new();
    formats.insert("mjr".to_owned(), mjr::open as OpenFn);
    formats.insert("pcap".to_owned(), pcap::open as OpenFn);
    RwLock::new(formats)
});

/// Registers a reader constructor for a file extension. Registering the
/// same constructor twice is a no-op; a different constructor for an
/// already-claimed extension is an error.
pub fn register(extension: &str, open: OpenFn) -> Result<()> {
    let mut formats = FORMATS.write().unwrap_or_else(|e| e.into_inner());
    match formats.get(extension) {
        Some(existing) if *existing as usize == open as usize => Ok(()),
        Some(_) => Err(Error::Malformed(format!(
            "a different reader is already registered for extension {:?}",
            extension
        ))),
        None => {
            formats.insert(extension.to_owned(), open);
            Ok(())
        }
    }
}

/// Opens an archive by consulting the registry with the path's extension.
pub fn open(path: impl AsRef<Path>, kind: PayloadKind) -> Result<Box<dyn PacketRead>> {
    let path = path.as_ref();
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let open_fn = {
        let formats = FORMATS.read().unwrap_or_else(|e| e.into_inner());
        formats.get(extension).copied()
    };
    match open_fn {
        Some(open_fn) => open_fn(path, kind),
        None => Err(Error::UnknownFormat(extension.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_extension() {
        assert!(matches!(
            open("/nonexistent/stream.xyz", PayloadKind::Raw),
            Err(Error::UnknownFormat(e)) if e == "xyz"
        ));
    }

    #[test]
    fn reregistration_is_idempotent() {
        register("mjr", mjr::open).unwrap();
        assert!(register("mjr", pcap::open).is_err());
    }
}
