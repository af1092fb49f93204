// SPDX-License-Identifier: MIT OR Apache-2.0

//! Classic pcap captures of RTP traffic.
//!
//! Each record's Ethernet frame is demultiplexed down to UDP and accepted
//! as RTP iff `version == 2` and the payload type is outside the RTCP
//! range `[64, 96)`. Anything else (ARP, TCP, RTCP, ...) is silently
//! skipped, by the index scan as well as by packet iteration.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::codec::{MediaKind, PayloadKind};
use crate::error::{Error, Result};
use crate::reader::{PacketFilter, PacketRead};
use crate::rtp::{Depad, RtpPacket};

const FILE_HEADER_SIZE: usize = 24;
const RECORD_HEADER_SIZE: usize = 16;
const LINKTYPE_ETHERNET: u32 = 1;

/// Registry constructor for `.pcap` files.
pub fn open(path: &Path, kind: PayloadKind) -> Result<Box<dyn PacketRead>> {
    let src = BufReader::new(File::open(path)?);
    Ok(Box::new(PcapReader::new(src, kind)?))
}

/// Reads RTP packets out of a classic pcap capture.
pub struct PcapReader<R: Read + Seek> {
    src: R,
    kind: PayloadKind,
    org: u64,
    swapped: bool,
    filter: Option<PacketFilter>,
}

impl<R: Read + Seek> PcapReader<R> {
    pub fn new(src: R, kind: PayloadKind) -> Result<Self> {
        Self::with_filter(src, kind, None)
    }

    pub fn with_filter(mut src: R, kind: PayloadKind, filter: Option<PacketFilter>) -> Result<Self> {
        let mut header = [0u8; FILE_HEADER_SIZE];
        let n = super::read_full(&mut src, &mut header)?;
        if n < header.len() {
            return Err(Error::Truncated {
                expected: header.len(),
                got: n,
            });
        }
        // Both byte orders, with or without the nanosecond-resolution magic.
        let swapped = match [header[0], header[1], header[2], header[3]] {
            [0xa1, 0xb2, 0xc3, 0xd4] | [0xa1, 0xb2, 0x3c, 0x4d] => false,
            [0xd4, 0xc3, 0xb2, 0xa1] | [0x4d, 0x3c, 0xb2, 0xa1] => true,
            magic => {
                return Err(Error::Malformed(format!("bad pcap magic {:02x?}", magic)));
            }
        };
        let linktype = read_u32(&header[20..24], swapped);
        if linktype != LINKTYPE_ETHERNET {
            return Err(Error::Malformed(format!(
                "unsupported pcap link type {}",
                linktype
            )));
        }
        let org = src.stream_position()?;
        Ok(PcapReader {
            src,
            kind,
            org,
            swapped,
            filter,
        })
    }

    /// Reads the next record's link-layer bytes.
    fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        match super::read_full(&mut self.src, &mut header)? {
            0 => return Ok(None),
            n if n < header.len() => {
                return Err(Error::Truncated {
                    expected: header.len(),
                    got: n,
                })
            }
            _ => {}
        }
        let incl_len = read_u32(&header[8..12], self.swapped) as usize;
        let mut buf = vec![0u8; incl_len];
        let n = super::read_full(&mut self.src, &mut buf)?;
        if n < incl_len {
            return Err(Error::Truncated {
                expected: incl_len,
                got: n,
            });
        }
        Ok(Some(buf))
    }
}

impl<R: Read + Seek> PacketRead for PcapReader<R> {
    fn kind(&self) -> PayloadKind {
        self.kind
    }

    fn media(&self) -> Option<MediaKind> {
        self.kind.media()
    }

    fn next_packet(&mut self) -> Result<Option<RtpPacket>> {
        loop {
            let buf = match self.read_record()? {
                Some(buf) => buf,
                None => return Ok(None),
            };
            let rtp = match rtp_of_ethernet(&buf) {
                Some(rtp) => rtp,
                None => continue,
            };
            let pkt = RtpPacket::parse(self.kind, Depad::Strip, rtp)?;
            match &self.filter {
                Some(filter) if !filter(&pkt) => continue,
                _ => return Ok(Some(pkt)),
            }
        }
    }

    fn skip_packet(&mut self) -> Result<Option<u64>> {
        loop {
            let pos = self.src.stream_position()?;
            let buf = match self.read_record()? {
                Some(buf) => buf,
                None => return Ok(None),
            };
            if rtp_of_ethernet(&buf).is_some() {
                return Ok(Some(pos));
            }
        }
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

fn read_u32(buf: &[u8], swapped: bool) -> u32 {
    let raw = [buf[0], buf[1], buf[2], buf[3]];
    if swapped {
        u32::from_le_bytes(raw)
    } else {
        u32::from_be_bytes(raw)
    }
}

fn read_be16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Walks Ethernet → IPv4 → UDP and returns the RTP candidate's bytes, or
/// `None` for anything that isn't plausibly RTP.
fn rtp_of_ethernet(frame: &[u8]) -> Option<&[u8]> {
    // ethernet: 6 + 6 byte addresses, 2 byte ethertype
    if frame.len() < 14 || read_be16(&frame[12..14]) != 0x0800 {
        return None;
    }
    let ip = &frame[14..];

    // ipv4 with options honored, protocol 17 = UDP
    if ip.len() < 20 || ip[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(ip[0] & 0x0f) * 4;
    let total_len = usize::from(read_be16(&ip[2..4]));
    if ihl < 20 || total_len < ihl || ip.len() < ihl || ip[9] != 17 {
        return None;
    }
    let udp = &ip[ihl..total_len.min(ip.len())];

    if udp.len() < 8 {
        return None;
    }
    let udp_len = usize::from(read_be16(&udp[4..6]));
    if udp_len < 8 {
        return None;
    }
    let payload = &udp[8..udp_len.min(udp.len())];

    // rtp acceptance: version 2, payload type outside the rtcp range
    if payload.len() < 12 || payload[0] >> 6 != 2 {
        return None;
    }
    let pt = payload[1] & 0x7f;
    if (64..96).contains(&pt) {
        return None;
    }
    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::PacketReadExt;
    use std::io::Cursor;

    fn rtp_bytes(seq: u16, pt: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0x80, pt];
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&(u32::from(seq) * 960).to_be_bytes());
        buf.extend_from_slice(&0xabcd_0123u32.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    fn ethernet_udp(udp_payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; 14];
        frame[12] = 0x08; // IPv4 ethertype

        let udp_len = 8 + udp_payload.len();
        let total_len = 20 + udp_len;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        ip[8] = 64; // ttl
        ip[9] = 17; // udp
        frame.extend_from_slice(&ip);

        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&5004u16.to_be_bytes());
        udp[2..4].copy_from_slice(&5004u16.to_be_bytes());
        udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        frame.extend_from_slice(&udp);
        frame.extend_from_slice(udp_payload);
        frame
    }

    fn pcap_fixture(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xa1b2_c3d4u32.to_be_bytes());
        out.extend_from_slice(&[0, 2, 0, 4]); // version 2.4
        out.extend_from_slice(&[0; 12]); // thiszone, sigfigs, snaplen
        out.extend_from_slice(&LINKTYPE_ETHERNET.to_be_bytes());
        for frame in frames {
            out.extend_from_slice(&[0; 8]); // ts
            out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            out.extend_from_slice(frame);
        }
        out
    }

    #[test]
    fn filters_non_rtp_records() {
        let frames = vec![
            ethernet_udp(&rtp_bytes(1, 0x60, &[0xf8])),
            ethernet_udp(&rtp_bytes(2, 72, &[0xf8])), // rtcp-range pt, dropped
            ethernet_udp(b"not rtp"),
            ethernet_udp(&rtp_bytes(3, 0x60, &[0xf8])),
        ];
        let fixture = pcap_fixture(&frames);
        let mut reader = PcapReader::new(Cursor::new(fixture), PayloadKind::Opus).unwrap();
        let pkts: Vec<_> = reader.packets().collect::<Result<_>>().unwrap();
        assert_eq!(pkts.len(), 2);
        assert_eq!(pkts[0].header.sequence_number, 1);
        assert_eq!(pkts[1].header.sequence_number, 3);
    }

    #[test]
    fn index_skips_non_rtp_and_supports_seek() {
        let frames = vec![
            ethernet_udp(&rtp_bytes(1, 0x60, &[0xf8])),
            ethernet_udp(b"not rtp"),
            ethernet_udp(&rtp_bytes(2, 0x60, &[0xf8])),
        ];
        let fixture = pcap_fixture(&frames);
        let mut reader = PcapReader::new(Cursor::new(fixture), PayloadKind::Opus).unwrap();
        let index: Vec<u64> = reader.index().collect::<Result<_>>().unwrap();
        assert_eq!(index.len(), 2);

        reader.seek_to(index[1]).unwrap();
        let pkt = reader.next_packet().unwrap().unwrap();
        assert_eq!(pkt.header.sequence_number, 2);
    }

    #[test]
    fn little_endian_header() {
        let frames = vec![ethernet_udp(&rtp_bytes(1, 0x60, &[0xf8]))];
        let mut fixture = pcap_fixture(&frames);
        // rewrite as a little-endian capture
        fixture[0..4].copy_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        fixture[20..24].copy_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
        let record_len = (frames[0].len() as u32).to_le_bytes();
        fixture[32..36].copy_from_slice(&record_len);
        fixture[36..40].copy_from_slice(&record_len);
        let mut reader = PcapReader::new(Cursor::new(fixture), PayloadKind::Opus).unwrap();
        assert_eq!(reader.packets().count(), 1);
    }

    #[test]
    fn bad_magic() {
        let fixture = vec![0u8; 24];
        assert!(matches!(
            PcapReader::new(Cursor::new(fixture), PayloadKind::Raw),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn truncated_record_is_fatal() {
        let frames = vec![ethernet_udp(&rtp_bytes(1, 0x60, &[0xf8]))];
        let mut fixture = pcap_fixture(&frames);
        fixture.truncate(fixture.len() - 3);
        let mut reader = PcapReader::new(Cursor::new(fixture), PayloadKind::Opus).unwrap();
        assert!(matches!(
            reader.next_packet(),
            Err(Error::Truncated { .. })
        ));
    }
}
