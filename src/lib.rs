// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reconstructs time-synchronized audio and video elementary streams from
//! archived RTP packet captures, as recorded by a WebRTC gateway, and
//! prepares them for containerized muxing by an external media framework.
//!
//! The pipeline, bottom up:
//!
//! *   [`rtp`] and [`codec`] decode the wire formats: the RTP header and
//!     packet, the VP8 payload descriptor and frame headers, the Opus TOC.
//! *   [`reader`] streams packets out of archive files (the gateway's
//!     record framing, [`reader::mjr`], or classic captures,
//!     [`reader::pcap`]) and can index record offsets for random access.
//! *   [`cursor`] is a seekable, bidirectional position over several such
//!     files at once, with time-domain seeks, key-frame search, and
//!     sample-aware alignment.
//! *   [`frame`] turns packet iterators into whole encoded frames with
//!     rebased presentation timestamps, ready for a muxer.
//! *   [`split`] bounds or chunks packet streams by count or duration.
//!
//! To mux a recorded pair of streams, hand the muxer a
//! [`frame::Frames`]/[`frame::VideoFrames`] iterator per stream plus a
//! [`raw::StreamProfile`] derived from the [`codec`] probes:
//!
//! ```no_run
//! use restitch::{codec, cursor::RtpCursor, frame::VideoFrames};
//!
//! # fn main() -> restitch::Result<()> {
//! let mut cur = RtpCursor::open(vec!["call-video.mjr"], codec::PayloadKind::Vp8);
//! let (width, height) = cur.restoring(|c| codec::probe_video_dimensions(c))?;
//! let frame_rate = cur.restoring(|c| codec::estimate_video_frame_rate(c, 10))?;
//! for frame in VideoFrames::new(&mut cur)? {
//!     let _frame = frame?;
//!     // push (pts, flags, data) to the muxer here
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod cursor;
mod error;
pub mod frame;
pub mod raw;
pub mod reader;
pub mod rtp;
pub mod split;

pub use error::{Error, Result};
