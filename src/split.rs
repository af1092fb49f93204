// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded chunking of packet streams: [`head`] takes a prefix limited by
//! a packet count and/or an elapsed-seconds window; [`split`] cuts a whole
//! stream into such chunks without dropping or duplicating the boundary
//! packet.

use crate::error::{Error, Result};
use crate::rtp::RtpPacket;

/// Takes packets while the counter stays under `count` *and* the elapsed
/// time relative to the first packet stays strictly under `duration`
/// seconds. `None` bounds are unconstrained.
pub fn head<I>(packets: I, count: Option<u64>, duration: Option<f64>) -> Head<I::IntoIter>
where
    I: IntoIterator<Item = Result<RtpPacket>>,
{
    Head {
        inner: packets.into_iter(),
        count,
        duration,
        epoch: None,
        taken: 0,
        done: false,
    }
}

pub struct Head<I> {
    inner: I,
    count: Option<u64>,
    duration: Option<f64>,
    epoch: Option<f64>,
    taken: u64,
    done: bool,
}

impl<I: Iterator<Item = Result<RtpPacket>>> Iterator for Head<I> {
    type Item = Result<RtpPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(count) = self.count {
            if self.taken >= count {
                self.done = true;
                return None;
            }
        }
        let pkt = match self.inner.next() {
            Some(Ok(pkt)) => pkt,
            Some(Err(e)) => {
                self.done = true;
                return Some(Err(e));
            }
            None => {
                self.done = true;
                return None;
            }
        };
        if let Some(duration) = self.duration {
            let secs = match pkt.secs() {
                Some(secs) => secs,
                None => {
                    self.done = true;
                    return Some(Err(Error::Unavailable("packet kind has no clock rate")));
                }
            };
            let epoch = *self.epoch.get_or_insert(secs);
            if secs - epoch >= duration {
                self.done = true;
                return None;
            }
        }
        self.taken += 1;
        Some(Ok(pkt))
    }
}

/// Cuts `packets` into consecutive chunks, each bounded like [`head`].
///
/// The packet that closes a chunk (the first one past the duration window)
/// is handed to the *next* chunk rather than dropped, so concatenating all
/// chunks reproduces the input exactly.
pub fn split<I>(packets: I, count: Option<u64>, duration: Option<f64>) -> Split<I::IntoIter>
where
    I: IntoIterator<Item = Result<RtpPacket>>,
{
    Split {
        inner: packets.into_iter(),
        count,
        duration,
        lookahead: None,
        epoch: None,
        taken: 0,
        chunk_active: false,
        done: false,
    }
}

pub struct Split<I> {
    inner: I,
    count: Option<u64>,
    duration: Option<f64>,
    lookahead: Option<Result<RtpPacket>>,
    epoch: Option<f64>,
    taken: u64,
    chunk_active: bool,
    done: bool,
}

impl<I: Iterator<Item = Result<RtpPacket>>> Split<I> {
    /// Starts the next chunk, draining any remainder of the previous one
    /// first. Returns `None` once the upstream is exhausted.
    pub fn next_split(&mut self) -> Option<Chunk<'_, I>> {
        while self.chunk_active {
            if self.chunk_next().is_none() {
                break;
            }
        }
        if self.done {
            return None;
        }
        if self.lookahead.is_none() {
            match self.inner.next() {
                Some(item) => self.lookahead = Some(item),
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
        self.epoch = None;
        self.taken = 0;
        self.chunk_active = true;
        Some(Chunk { split: self })
    }

    fn chunk_next(&mut self) -> Option<Result<RtpPacket>> {
        if !self.chunk_active {
            return None;
        }
        if let Some(count) = self.count {
            if self.taken >= count {
                self.chunk_active = false;
                return None;
            }
        }
        let pkt = match self.lookahead.take().or_else(|| self.inner.next()) {
            Some(Ok(pkt)) => pkt,
            Some(Err(e)) => {
                self.chunk_active = false;
                self.done = true;
                return Some(Err(e));
            }
            None => {
                self.chunk_active = false;
                self.done = true;
                return None;
            }
        };
        if let Some(duration) = self.duration {
            let secs = match pkt.secs() {
                Some(secs) => secs,
                None => {
                    self.chunk_active = false;
                    self.done = true;
                    return Some(Err(Error::Unavailable("packet kind has no clock rate")));
                }
            };
            let epoch = *self.epoch.get_or_insert(secs);
            // every chunk makes progress: the first packet is never bounced
            if self.taken > 0 && secs - epoch >= duration {
                self.lookahead = Some(Ok(pkt));
                self.chunk_active = false;
                return None;
            }
        }
        self.taken += 1;
        Some(Ok(pkt))
    }
}

/// One bounded sub-sequence handed out by [`Split::next_split`].
pub struct Chunk<'a, I> {
    split: &'a mut Split<I>,
}

impl<I: Iterator<Item = Result<RtpPacket>>> Iterator for Chunk<'_, I> {
    type Item = Result<RtpPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        self.split.chunk_next()
    }
}
