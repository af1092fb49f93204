// SPDX-License-Identifier: MIT OR Apache-2.0

//! A seekable, bidirectional position over the logical concatenation of
//! several per-file packet sequences ("parts").
//!
//! Parts are opened and indexed lazily; at most one part holds an open
//! file handle at a time, and moving to another part closes the previous
//! one on every path. Gateways roll recordings over periodically, so a
//! single stream is usually a chain of such parts.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::codec::{MediaKind, PayloadKind};
use crate::error::{Error, Result};
use crate::reader::{self, PacketRead};
use crate::rtp::RtpPacket;

/// An absolute `(part, packet)` position. `tell` reports these; `seek`
/// accepts signed pairs whose negative components count from the end.
pub type Position = (usize, usize);

/// The "last packet of the last non-empty part" seek target.
pub const LAST: (i64, i64) = (-1, -1);

/// Constructs a reader for one part's source.
pub type Opener<S> = Box<dyn Fn(&S) -> Result<Box<dyn PacketRead>>>;

/// Search direction for [`RtpCursor::search`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Where a [`RtpCursor::slice`] ends: an absolute position, or a signed
/// packet count relative to the current position.
#[derive(Clone, Copy, Debug)]
pub enum SliceStop {
    Pos(i64, i64),
    Rel(i64),
}

impl From<(i64, i64)> for SliceStop {
    fn from((part, pkt): (i64, i64)) -> Self {
        SliceStop::Pos(part, pkt)
    }
}

impl From<i64> for SliceStop {
    fn from(delta: i64) -> Self {
        SliceStop::Rel(delta)
    }
}

/// How [`RtpCursor::time_cut`] aligns its two positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeCutAlign {
    /// Raw fast-forward landings.
    Exact,
    /// Snap video positions backward to the previous start-of-frame.
    Frame,
    /// Like `Frame`, but also step back one packet when the target is an
    /// interior packet; keeps cuts stable at the growing tail of a
    /// multi-part cursor.
    Prev,
}

/// The two positions selected by [`RtpCursor::time_cut`]. The `*_secs`
/// values include fast-forward overshoot and any alignment delta.
#[derive(Clone, Copy, Debug)]
pub struct TimeCut {
    pub begin: Position,
    pub begin_secs: f64,
    pub end: Position,
    pub end_secs: f64,
}

/// Result of [`RtpCursor::align_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameAlignment {
    /// Where the cursor landed.
    pub position: Position,
    /// Interleaved samples from the cursor origin up to `position`.
    pub cumulative_samples: u64,
    /// Samples to discard from the first decoded frame to land on the
    /// requested boundary.
    pub trim_offset: u64,
    /// Packets walked backward to get here.
    pub frames_consumed: u64,
}

/// Result of [`RtpCursor::trim_frames`]: the range and per-sample trim an
/// encoder needs for a sample-accurate cut.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTrim {
    pub begin: Position,
    pub end: Position,
    pub begin_trim: u64,
    /// First and last whole-frame indices covered by the range.
    pub frames: (u64, u64),
}

const SAMPLES_CACHE: &str = "samples";

struct OpenPart {
    reader: Box<dyn PacketRead>,
    index: Vec<u64>,
}

struct Part<S> {
    source: S,
    open: Option<OpenPart>,
}

/// A multi-part random-access cursor over archived RTP packets.
pub struct RtpCursor<S> {
    opener: Opener<S>,
    parts: Vec<Part<S>>,
    pos: Position,
    cache: HashMap<(&'static str, usize), u64>,
}

impl RtpCursor<PathBuf> {
    /// Opens each path through the format registry.
    pub fn open<P: Into<PathBuf>>(
        parts: impl IntoIterator<Item = P>,
        kind: PayloadKind,
    ) -> Self {
        Self::with_opener(
            parts.into_iter().map(Into::into).collect(),
            move |path: &PathBuf| reader::open(path, kind),
        )
    }
}

impl<S> RtpCursor<S> {
    /// A cursor over arbitrary sources with a caller-supplied reader
    /// constructor. Parts are not touched until first use.
    pub fn with_opener(
        sources: Vec<S>,
        opener: impl Fn(&S) -> Result<Box<dyn PacketRead>> + 'static,
    ) -> Self {
        RtpCursor {
            opener: Box::new(opener),
            parts: sources
                .into_iter()
                .map(|source| Part { source, open: None })
                .collect(),
            pos: (0, 0),
            cache: HashMap::new(),
        }
    }

    /// Eagerly indexes every part and drops the empty ones.
    pub fn drop_empty(mut self) -> Result<Self> {
        let mut keep = Vec::with_capacity(self.parts.len());
        for i in 0..self.parts.len() {
            keep.push(self.part_len(i)? > 0);
            self.close_part(i);
        }
        let parts = std::mem::replace(&mut self.parts, Vec::new());
        self.parts = parts
            .into_iter()
            .zip(keep)
            .filter_map(|(part, keep)| if keep { Some(part) } else { None })
            .collect();
        self.cache.clear();
        self.pos = (0, 0);
        Ok(self)
    }

    pub fn len_parts(&self) -> usize {
        self.parts.len()
    }

    /// The current `(part, packet)` position.
    pub fn tell(&self) -> Position {
        self.pos
    }

    /// Seeks to an absolute position. Negative components count from the
    /// end; `(-1, -1)` is the last packet of the last non-empty part.
    pub fn seek(&mut self, (part, pkt): (i64, i64)) -> Result<()> {
        if self.parts.is_empty() {
            return Err(Error::OutOfRange("cursor has no parts".to_owned()));
        }
        let nparts = self.parts.len() as i64;
        let p = if part < 0 { nparts + part } else { part };
        if p < 0 || p >= nparts {
            return Err(Error::OutOfRange(format!(
                "part index {} out of range [0, {})",
                part, nparts
            )));
        }
        let mut p = p as usize;
        let mut len = self.part_len(p)?;
        if pkt < 0 && len == 0 && part < 0 {
            // the sentinel skips trailing empty parts
            while len == 0 && p > 0 {
                self.close_part(p);
                p -= 1;
                len = self.part_len(p)?;
            }
        }
        let k = if pkt < 0 { len as i64 + pkt } else { pkt };
        if k < 0 || k >= len as i64 {
            self.close_others(self.pos.0);
            return Err(Error::OutOfRange(format!(
                "part {} packet index {} out of range [0, {})",
                p, pkt, len
            )));
        }
        self.close_others(p);
        self.pos = (p, k as usize);
        Ok(())
    }

    /// Moves by a signed number of packets without decoding them.
    pub fn seek_rel(&mut self, delta: i64) -> Result<()> {
        if self.parts.is_empty() {
            return Err(Error::OutOfRange("cursor has no parts".to_owned()));
        }
        let (mut p, mut k) = self.pos;
        if delta >= 0 {
            let mut d = delta as usize;
            loop {
                let len = self.part_len(p)?;
                if k + d < len {
                    k += d;
                    break;
                }
                if p + 1 >= self.parts.len() {
                    self.close_others(self.pos.0);
                    return Err(Error::OutOfRange(format!(
                        "relative seek {} past the end",
                        delta
                    )));
                }
                d -= len - k;
                self.close_part(p);
                p += 1;
                k = 0;
            }
        } else {
            let mut d = (-delta) as usize;
            loop {
                if k >= d {
                    k -= d;
                    break;
                }
                if p == 0 {
                    self.close_others(self.pos.0);
                    return Err(Error::OutOfRange(format!(
                        "relative seek {} before the start",
                        delta
                    )));
                }
                d -= k + 1;
                self.close_part(p);
                p -= 1;
                let len = self.part_len(p)?;
                if len == 0 {
                    // empty part: the landing packet is further back
                    k = 0;
                    d += 1;
                    continue;
                }
                k = len - 1;
                if d == 0 {
                    break;
                }
                continue;
            }
        }
        self.close_others(p);
        self.pos = (p, k);
        Ok(())
    }

    /// The packet at the current position, without advancing.
    pub fn current(&mut self) -> Result<RtpPacket> {
        let at = self.peek_pos()?.ok_or_else(|| {
            Error::OutOfRange("cursor is empty or past the end".to_owned())
        })?;
        if at != self.pos {
            // settle onto the same logical packet, past any empty parts
            self.close_others(at.0);
            self.pos = at;
        }
        self.packet_at(at)
    }

    /// Returns the packet at the current position and steps forward,
    /// crossing part boundaries as needed. `None` past the end.
    pub fn advance(&mut self) -> Result<Option<RtpPacket>> {
        let at = match self.peek_pos()? {
            Some(at) => at,
            None => return Ok(None),
        };
        if at != self.pos {
            // we hopped over empty or exhausted parts
            self.close_others(at.0);
            self.pos = at;
        }
        let pkt = self.packet_at(at)?;
        let len = self.open_len(at.0);
        if at.1 + 1 < len || at.0 + 1 >= self.parts.len() {
            self.pos = (at.0, at.1 + 1);
        } else {
            self.close_part(at.0);
            self.pos = (at.0 + 1, 0);
        }
        Ok(Some(pkt))
    }

    /// Steps backward and returns the packet landed on. `None` (with the
    /// position clamped to the start) when already at the first packet.
    pub fn retreat(&mut self) -> Result<Option<RtpPacket>> {
        if self.parts.is_empty() {
            return Ok(None);
        }
        let (start_p, start_k) = self.pos;
        let mut p = start_p;
        let mut k = start_k;
        let target = loop {
            if k > 0 {
                break (p, k - 1);
            }
            if p == 0 {
                self.pos = (0, 0);
                self.close_others(0);
                return Ok(None);
            }
            p -= 1;
            k = self.part_len(p)?;
            // empty parts leave k at 0 and the loop walks further back
        };
        self.close_others(target.0);
        self.pos = target;
        let pkt = self.packet_at(target)?;
        Ok(Some(pkt))
    }

    /// A lazy sequence from the current position to `stop`; direction is
    /// inferred from the comparison with the current position. A `pkt` of
    /// `-1` means "through the end of the part" and forces `inclusive`.
    pub fn slice(&mut self, stop: impl Into<SliceStop>, inclusive: bool) -> Result<Slice<'_, S>> {
        let mode = match stop.into() {
            SliceStop::Rel(delta) => {
                if delta >= 0 {
                    SliceMode::RelForward {
                        remaining: delta as u64,
                    }
                } else {
                    SliceMode::RelBackward {
                        remaining: (-delta) as u64,
                    }
                }
            }
            SliceStop::Pos(part, pkt) => match self.resolve_stop((part, pkt))? {
                None => SliceMode::Empty,
                Some((bound, forced_inclusive)) => {
                    let inclusive = inclusive || forced_inclusive;
                    if bound >= self.pos {
                        SliceMode::Forward { bound, inclusive }
                    } else {
                        SliceMode::Backward { bound, inclusive }
                    }
                }
            },
        };
        Ok(Slice {
            cursor: self,
            mode,
            done: false,
        })
    }

    /// Applies `f` to every packet of `slice(stop)`.
    pub fn each<F: FnMut(&RtpPacket)>(
        &mut self,
        stop: impl Into<SliceStop>,
        mut f: F,
    ) -> Result<()> {
        let mut slice = self.slice(stop, false)?;
        while let Some(pkt) = slice.next() {
            f(&pkt?);
        }
        Ok(())
    }

    /// Counts the packets of `slice(stop)` matching a predicate.
    pub fn count<F: FnMut(&RtpPacket) -> bool>(
        &mut self,
        stop: impl Into<SliceStop>,
        mut matches: F,
    ) -> Result<u64> {
        let mut count = 0;
        self.each(stop, |pkt| {
            if matches(pkt) {
                count += 1;
            }
        })?;
        Ok(count)
    }

    /// Steps in `direction` until `matches` returns true, yielding the
    /// matched packet, or `None` when iteration ends first.
    pub fn search<F: FnMut(&RtpPacket) -> bool>(
        &mut self,
        mut matches: F,
        direction: Direction,
    ) -> Result<Option<RtpPacket>> {
        loop {
            let pkt = match direction {
                Direction::Forward => self.advance()?,
                Direction::Backward => self.retreat()?,
            };
            match pkt {
                Some(pkt) if matches(&pkt) => return Ok(Some(pkt)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    pub fn prev_key_frame(&mut self) -> Result<Option<RtpPacket>> {
        self.search(
            |pkt| pkt.payload.is_start_of_frame() && pkt.payload.is_key_frame(),
            Direction::Backward,
        )
    }

    pub fn next_key_frame(&mut self) -> Result<Option<RtpPacket>> {
        self.search(
            |pkt| pkt.payload.is_start_of_frame() && pkt.payload.is_key_frame(),
            Direction::Forward,
        )
    }

    /// Advances until the elapsed packet time reaches `secs`, landing on
    /// the packet that crossed the threshold (or the last packet if the
    /// stream ran out first). Returns the overshoot, `achieved - secs`.
    ///
    /// Packet timestamps are taken as monotonic; a 32-bit timestamp wrap
    /// mid-stream is not detected.
    pub fn fastforward(&mut self, secs: f64) -> Result<f64> {
        if secs < 0.0 {
            return self.rewind(-secs);
        }
        let start = self.current()?.clocked_secs()?;
        let mut achieved = 0.0;
        loop {
            match self.advance()? {
                Some(pkt) => {
                    achieved = pkt.clocked_secs()? - start;
                    if achieved >= secs {
                        break;
                    }
                }
                None => break,
            }
        }
        self.retreat()?; // land on the packet that set `achieved`
        Ok(achieved - secs)
    }

    /// The backward counterpart of [`fastforward`](Self::fastforward).
    pub fn rewind(&mut self, secs: f64) -> Result<f64> {
        if secs < 0.0 {
            return self.fastforward(-secs);
        }
        if secs == 0.0 {
            return Ok(0.0);
        }
        let start = match self.current() {
            Ok(pkt) => pkt.clocked_secs()?,
            // past the end: measure from the last packet instead
            Err(Error::OutOfRange(_)) => match self.retreat()? {
                Some(pkt) => pkt.clocked_secs()?,
                None => return Err(Error::OutOfRange("rewind on an empty cursor".to_owned())),
            },
            Err(e) => return Err(e),
        };
        let mut achieved = 0.0;
        loop {
            match self.retreat()? {
                Some(pkt) => {
                    achieved = start - pkt.clocked_secs()?;
                    if achieved >= secs {
                        break;
                    }
                }
                None => break,
            }
        }
        Ok(achieved - secs)
    }

    /// Seconds between the current packet and the packet at `pos`
    /// (default: the end sentinel). The position is restored afterwards.
    pub fn interval(&mut self, pos: Option<(i64, i64)>) -> Result<f64> {
        let here = self.current()?.clocked_secs()?;
        let target = pos.unwrap_or(LAST);
        let saved = self.pos;
        let there = (|| -> Result<f64> {
            self.seek(target)?;
            self.current()?.clocked_secs()
        })();
        self.restore(saved);
        Ok(there? - here)
    }

    /// Runs `f` and restores the current position afterwards, whether or
    /// not it succeeded.
    pub fn restoring<T, F: FnOnce(&mut Self) -> Result<T>>(&mut self, f: F) -> Result<T> {
        let saved = self.pos;
        let result = f(self);
        self.restore(saved);
        result
    }

    /// Map-reduces over `slice(current -> stop)`, leaving the cursor at
    /// `stop`. With a `cache_key`, the reduction of any whole part covered
    /// by the span is memoized, so repeated computes (e.g. running sample
    /// counts) cost one scan per part per key. The reduction must be
    /// associative with `zero` as its identity for the per-part
    /// composition to hold; the backing files must not change.
    pub fn compute<M, F>(
        &mut self,
        stop: impl Into<SliceStop>,
        zero: u64,
        mut map: M,
        mut reduce: F,
        cache_key: Option<&'static str>,
    ) -> Result<u64>
    where
        M: FnMut(&RtpPacket) -> Result<u64>,
        F: FnMut(u64, u64) -> u64,
    {
        let stop = stop.into();
        let (bound, inclusive) = match stop {
            SliceStop::Pos(part, pkt) => match self.resolve_stop((part, pkt))? {
                Some(resolved) => resolved,
                None => return Ok(zero),
            },
            SliceStop::Rel(_) => {
                // relative spans are small; skip the per-part memo
                let mut acc = zero;
                let mut slice = self.slice(stop, false)?;
                while let Some(pkt) = slice.next() {
                    acc = reduce(acc, map(&pkt?)?);
                }
                return Ok(acc);
            }
        };
        let exclusive = if inclusive {
            let len = self.part_len(bound.0)?;
            if bound.1 + 1 < len {
                (bound.0, bound.1 + 1)
            } else {
                (bound.0 + 1, 0)
            }
        } else {
            bound
        };

        let mut acc = zero;
        loop {
            if self.pos >= exclusive {
                break;
            }
            let (p, k) = self.pos;
            let len = self.part_len(p)?;
            if k >= len {
                if p + 1 < self.parts.len() {
                    self.close_part(p);
                    self.pos = (p + 1, 0);
                    continue;
                }
                break;
            }
            if k == 0 && exclusive >= (p + 1, 0) {
                // the span covers this whole part
                let cached = cache_key.and_then(|key| self.cache.get(&(key, p)).copied());
                let part_total = match cached {
                    Some(total) => total,
                    None => {
                        let mut total = zero;
                        for i in 0..len {
                            let pkt = self.packet_at((p, i))?;
                            total = reduce(total, map(&pkt)?);
                        }
                        if let Some(key) = cache_key {
                            self.cache.insert((key, p), total);
                        }
                        total
                    }
                };
                acc = reduce(acc, part_total);
                if p + 1 < self.parts.len() {
                    self.close_part(p);
                    self.pos = (p + 1, 0);
                } else {
                    self.pos = (p, len);
                }
            } else {
                let pkt = self.packet_at((p, k))?;
                acc = reduce(acc, map(&pkt)?);
                self.pos = (p, k + 1);
            }
        }
        Ok(acc)
    }

    /// Selects the `[begin_secs, end_secs]` range by fast-forwarding from
    /// the first packet, optionally aligning each landing backward to a
    /// start-of-frame (video streams only).
    pub fn time_cut(
        &mut self,
        begin_secs: f64,
        end_secs: f64,
        align: TimeCutAlign,
    ) -> Result<TimeCut> {
        self.reset_to_start();
        let origin = self.current()?.clocked_secs()?;

        self.fastforward(begin_secs)?;
        self.align_cut(align)?;
        let begin = self.pos;
        let begin_out = self.current()?.clocked_secs()? - origin;

        let remaining = end_secs - begin_out;
        self.fastforward(remaining.max(0.0))?;
        self.align_cut(align)?;
        let end = self.pos;
        let end_out = self.current()?.clocked_secs()? - origin;

        Ok(TimeCut {
            begin,
            begin_secs: begin_out,
            end,
            end_secs: end_out,
        })
    }

    fn align_cut(&mut self, align: TimeCutAlign) -> Result<()> {
        if matches!(align, TimeCutAlign::Exact) {
            return Ok(());
        }
        let pkt = self.current()?;
        if pkt.payload.kind().media() != Some(MediaKind::Video) {
            return Ok(());
        }
        if !pkt.payload.is_start_of_frame() {
            // lands on the previous start, or clamps to the first packet
            self.search(|p| p.payload.is_start_of_frame(), Direction::Backward)?;
        }
        if matches!(align, TimeCutAlign::Prev) {
            let at_first = Some(self.pos) == self.first_position()?;
            let at_last = self.is_last_position()?;
            if !at_first && !at_last {
                self.retreat()?;
            }
        }
        Ok(())
    }

    /// Walks backward until at least one whole output frame of audio
    /// (`samples_per_frame * scale` interleaved samples) lies between the
    /// landing position and the current one, and reports the trim that
    /// puts decode on a frame boundary. Amortized linear across repeated
    /// calls thanks to the `samples` compute cache.
    pub fn align_frame(&mut self, samples_per_frame: u64, scale: u64) -> Result<FrameAlignment> {
        let frame = samples_per_frame * scale;
        if frame == 0 {
            return Err(Error::OutOfRange(
                "frame alignment with a zero frame size".to_owned(),
            ));
        }
        let total = self.samples_to_here()?;
        let mut excess = 0u64;
        let mut consumed = 0u64;
        while excess < frame {
            match self.retreat()? {
                Some(pkt) => {
                    excess += interleaved_samples(&pkt)?;
                    consumed += 1;
                }
                None => break,
            }
        }
        let cumulative = total - excess;
        let trim = (frame - cumulative % frame) % frame;
        Ok(FrameAlignment {
            position: self.pos,
            cumulative_samples: cumulative,
            trim_offset: trim,
            frames_consumed: consumed,
        })
    }

    /// Computes the sample-accurate trim range from the current position
    /// through `stop` for an external encoder's range filter.
    pub fn trim_frames(&mut self, stop: (i64, i64), samples_per_frame: u64) -> Result<FrameTrim> {
        let scale = u64::from(self.current()?.payload.nb_channels()?);
        let frame = samples_per_frame * scale;
        let aligned = self.align_frame(samples_per_frame, scale)?;
        let first = (aligned.cumulative_samples + aligned.trim_offset) / frame;
        let span = self.restoring(|c| {
            c.compute(
                stop,
                0,
                |pkt| interleaved_samples(pkt),
                |a, b| a + b,
                Some(SAMPLES_CACHE),
            )
        })?;
        let last = (aligned.cumulative_samples + span) / frame;
        let end = self.restoring(|c| {
            c.seek(stop)?;
            Ok(c.pos)
        })?;
        Ok(FrameTrim {
            begin: aligned.position,
            end,
            begin_trim: aligned.trim_offset,
            frames: (first, last),
        })
    }

    // internals

    /// Interleaved samples from the cursor origin up to (excluding) the
    /// current position.
    fn samples_to_here(&mut self) -> Result<u64> {
        if self.parts.is_empty() {
            return Ok(0);
        }
        let here = self.pos;
        let past_end = here.1 >= self.part_len(here.0)?;
        self.restoring(|c| {
            c.reset_to_start();
            let stop: (i64, i64) = if past_end {
                LAST
            } else {
                (here.0 as i64, here.1 as i64)
            };
            c.compute(
                stop,
                0,
                |pkt| interleaved_samples(pkt),
                |a, b| a + b,
                Some(SAMPLES_CACHE),
            )
        })
    }

    fn reset_to_start(&mut self) {
        self.close_others(0);
        self.pos = (0, 0);
    }

    fn restore(&mut self, pos: Position) {
        self.close_others(pos.0);
        self.pos = pos;
    }

    /// The position of the first packet, skipping leading empty parts.
    fn first_position(&mut self) -> Result<Option<Position>> {
        let mut first = None;
        for p in 0..self.parts.len() {
            if self.part_len(p)? > 0 {
                first = Some((p, 0));
                break;
            }
        }
        self.close_others(self.pos.0);
        Ok(first)
    }

    fn is_last_position(&mut self) -> Result<bool> {
        let (p, k) = self.pos;
        let mut last = k + 1 >= self.part_len(p)?;
        if last {
            for q in p + 1..self.parts.len() {
                if self.part_len(q)? > 0 {
                    last = false;
                    break;
                }
            }
        }
        self.close_others(self.pos.0);
        Ok(last)
    }

    /// Normalizes the position forward over empty or exhausted parts and
    /// returns it, or `None` past the end.
    fn peek_pos(&mut self) -> Result<Option<Position>> {
        if self.parts.is_empty() {
            return Ok(None);
        }
        let (mut p, mut k) = self.pos;
        loop {
            let len = self.part_len(p)?;
            if k < len {
                return Ok(Some((p, k)));
            }
            if p + 1 >= self.parts.len() {
                return Ok(None);
            }
            if (p, k) != self.pos {
                self.close_part(p);
            }
            p += 1;
            k = 0;
        }
    }

    /// Resolves a stop position. `pkt = -1` means "through the end of the
    /// part" (inclusive), falling back to earlier parts when that part is
    /// empty; `None` means the span is empty.
    fn resolve_stop(&mut self, (part, pkt): (i64, i64)) -> Result<Option<(Position, bool)>> {
        if self.parts.is_empty() {
            return Err(Error::OutOfRange("cursor has no parts".to_owned()));
        }
        let nparts = self.parts.len() as i64;
        let p = if part < 0 { nparts + part } else { part };
        if p < 0 || p >= nparts {
            return Err(Error::OutOfRange(format!(
                "part index {} out of range [0, {})",
                part, nparts
            )));
        }
        let mut p = p as usize;
        let mut len = self.part_len(p)?;
        if pkt == -1 {
            while len == 0 {
                if p == 0 {
                    return Ok(None);
                }
                self.close_part(p);
                p -= 1;
                len = self.part_len(p)?;
            }
            return Ok(Some(((p, len - 1), true)));
        }
        let k = if pkt < 0 { len as i64 + pkt } else { pkt };
        if k < 0 || k >= len as i64 {
            return Err(Error::OutOfRange(format!(
                "part {} packet index {} out of range [0, {})",
                p, pkt, len
            )));
        }
        Ok(Some(((p, k as usize), false)))
    }

    /// Opens (and indexes) the part if needed and returns its length.
    fn part_len(&mut self, p: usize) -> Result<usize> {
        self.ensure_open(p)?;
        Ok(self.open_len(p))
    }

    fn open_len(&self, p: usize) -> usize {
        self.parts[p].open.as_ref().map(|o| o.index.len()).unwrap_or(0)
    }

    fn ensure_open(&mut self, p: usize) -> Result<()> {
        if self.parts[p].open.is_some() {
            return Ok(());
        }
        let mut reader = (self.opener)(&self.parts[p].source)?;
        let mut index = Vec::new();
        while let Some(offset) = reader.skip_packet()? {
            index.push(offset);
        }
        self.parts[p].open = Some(OpenPart { reader, index });
        Ok(())
    }

    fn close_part(&mut self, p: usize) {
        self.parts[p].open = None;
    }

    fn close_others(&mut self, keep: usize) {
        for p in 0..self.parts.len() {
            if p != keep {
                self.parts[p].open = None;
            }
        }
    }

    fn packet_at(&mut self, (p, k): Position) -> Result<RtpPacket> {
        self.ensure_open(p)?;
        let open = match self.parts[p].open.as_mut() {
            Some(open) => open,
            None => return Err(Error::OutOfRange(format!("part {} failed to open", p))),
        };
        let offset = *open.index.get(k).ok_or_else(|| {
            Error::OutOfRange(format!(
                "part {} packet index {} out of range [0, {})",
                p,
                k,
                open.index.len()
            ))
        })?;
        open.reader.seek_to(offset)?;
        match open.reader.next_packet()? {
            Some(pkt) => Ok(pkt),
            None => Err(Error::Malformed(format!(
                "indexed record at offset {} disappeared; was the file modified?",
                offset
            ))),
        }
    }
}

impl<S> Iterator for RtpCursor<S> {
    type Item = Result<RtpPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

enum SliceMode {
    Forward { bound: Position, inclusive: bool },
    Backward { bound: Position, inclusive: bool },
    RelForward { remaining: u64 },
    RelBackward { remaining: u64 },
    Empty,
}

/// Lazy bidirectional sequence produced by [`RtpCursor::slice`].
pub struct Slice<'a, S> {
    cursor: &'a mut RtpCursor<S>,
    mode: SliceMode,
    done: bool,
}

impl<S> Iterator for Slice<'_, S> {
    type Item = Result<RtpPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.mode {
            SliceMode::Empty => {
                self.done = true;
                None
            }
            SliceMode::Forward { bound, inclusive } => {
                let at = match self.cursor.peek_pos() {
                    Ok(Some(at)) => at,
                    Ok(None) => {
                        self.done = true;
                        return None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                };
                if at > bound || (!inclusive && at == bound) {
                    self.done = true;
                    return None;
                }
                match self.cursor.advance() {
                    Ok(Some(pkt)) => Some(Ok(pkt)),
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
            SliceMode::Backward { bound, inclusive } => match self.cursor.retreat() {
                Ok(Some(pkt)) => {
                    let at = self.cursor.tell();
                    if at < bound || (!inclusive && at == bound) {
                        // stepped past the stop; put the position back
                        self.done = true;
                        if let Err(e) = self.cursor.advance() {
                            return Some(Err(e));
                        }
                        return None;
                    }
                    Some(Ok(pkt))
                }
                Ok(None) => {
                    self.done = true;
                    None
                }
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                }
            },
            SliceMode::RelForward { ref mut remaining } => {
                if *remaining == 0 {
                    self.done = true;
                    return None;
                }
                *remaining -= 1;
                match self.cursor.advance() {
                    Ok(Some(pkt)) => Some(Ok(pkt)),
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
            SliceMode::RelBackward { ref mut remaining } => {
                if *remaining == 0 {
                    self.done = true;
                    return None;
                }
                *remaining -= 1;
                match self.cursor.retreat() {
                    Ok(Some(pkt)) => Some(Ok(pkt)),
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
    }
}

fn interleaved_samples(pkt: &RtpPacket) -> Result<u64> {
    Ok(u64::from(pkt.payload.nb_samples()?) * u64::from(pkt.payload.nb_channels()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PayloadKind;
    use crate::reader::mjr::{self, MjrReader};
    use crate::reader::PacketRead;
    use std::io::Cursor as IoCursor;

    fn opus_rtp(seq: u16, timestamp: u32) -> Vec<u8> {
        let mut buf = vec![0x80, 0x60];
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&timestamp.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.push(0xfc); // celt 20 ms stereo: 960 samples x 2 channels
        buf
    }

    fn vp8_rtp(seq: u16, timestamp: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0x80, 0x60];
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&timestamp.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    fn mjr_bytes(media: &[u8], packets: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(mjr::MARKER);
        out.extend_from_slice(&(media.len() as u16).to_be_bytes());
        out.extend_from_slice(media);
        for pkt in packets {
            out.extend_from_slice(mjr::MARKER);
            out.extend_from_slice(&(pkt.len() as u16).to_be_bytes());
            out.extend_from_slice(pkt);
        }
        out
    }

    fn cursor_of(kind: PayloadKind, parts: Vec<Vec<u8>>) -> RtpCursor<Vec<u8>> {
        RtpCursor::with_opener(parts, move |bytes: &Vec<u8>| {
            Ok(Box::new(MjrReader::new(IoCursor::new(bytes.clone()), kind)?)
                as Box<dyn PacketRead>)
        })
    }

    /// Three audio parts x two packets, 20 ms apart, seq 0..6.
    fn audio_cursor() -> RtpCursor<Vec<u8>> {
        let parts = (0..3)
            .map(|p| {
                let pkts: Vec<_> = (0..2)
                    .map(|i| {
                        let n = p * 2 + i;
                        opus_rtp(n as u16, n as u32 * 960)
                    })
                    .collect();
                mjr_bytes(b"audio", &pkts)
            })
            .collect();
        cursor_of(PayloadKind::Opus, parts)
    }

    fn seq(pkt: &RtpPacket) -> u16 {
        pkt.header.sequence_number
    }

    #[test]
    fn iterates_across_parts_in_order() {
        let seqs: Vec<u16> = audio_cursor()
            .map(|pkt| seq(&pkt.unwrap()))
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn prev_next_symmetry_at_part_boundary() {
        let mut cur = audio_cursor();
        cur.seek((1, 0)).unwrap();
        let prev = cur.retreat().unwrap().unwrap();
        assert_eq!(seq(&prev), 1);
        assert_eq!(cur.tell(), (0, 1));
        let next = cur.advance().unwrap().unwrap();
        assert_eq!(seq(&next), 1);
        assert_eq!(cur.tell(), (1, 0));
    }

    #[test]
    fn seek_negative_and_sentinel() {
        let mut cur = audio_cursor();
        cur.seek(LAST).unwrap();
        assert_eq!(cur.tell(), (2, 1));
        assert_eq!(seq(&cur.current().unwrap()), 5);

        cur.seek((0, -2)).unwrap();
        assert_eq!(cur.tell(), (0, 0));

        assert!(matches!(cur.seek((3, 0)), Err(Error::OutOfRange(_))));
        assert!(matches!(cur.seek((0, 2)), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn seek_rel_crosses_parts() {
        let mut cur = audio_cursor();
        cur.seek_rel(3).unwrap();
        assert_eq!(cur.tell(), (1, 1));
        cur.seek_rel(-2).unwrap();
        assert_eq!(cur.tell(), (0, 1));
        assert!(matches!(cur.seek_rel(10), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn empty_parts_are_skipped() {
        let parts = vec![
            mjr_bytes(b"audio", &[opus_rtp(0, 0)]),
            mjr_bytes(b"audio", &[]),
            mjr_bytes(b"audio", &[opus_rtp(1, 960)]),
        ];
        let mut cur = cursor_of(PayloadKind::Opus, parts);
        let seqs: Vec<u16> = (&mut cur).map(|pkt| seq(&pkt.unwrap())).collect();
        assert_eq!(seqs, vec![0, 1]);

        // and backward over the hole
        cur.seek((2, 0)).unwrap();
        let prev = cur.retreat().unwrap().unwrap();
        assert_eq!(seq(&prev), 0);
        assert_eq!(cur.tell(), (0, 0));
    }

    #[test]
    fn drop_empty_removes_parts() {
        let parts = vec![
            mjr_bytes(b"audio", &[]),
            mjr_bytes(b"audio", &[opus_rtp(0, 0)]),
        ];
        let cur = cursor_of(PayloadKind::Opus, parts).drop_empty().unwrap();
        assert_eq!(cur.len_parts(), 1);
    }

    #[test]
    fn at_most_one_part_open() {
        let mut cur = audio_cursor();
        for pkt in &mut cur {
            pkt.unwrap();
        }
        let open: Vec<usize> = cur
            .parts
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.open.as_ref().map(|_| i))
            .collect();
        assert!(open.len() <= 1, "open parts: {:?}", open);

        cur.seek((0, 0)).unwrap();
        cur.seek((2, 0)).unwrap();
        assert!(cur.parts[0].open.is_none());
    }

    #[test]
    fn slice_forward_and_backward() {
        let mut cur = audio_cursor();
        let fwd: Vec<u16> = cur
            .slice((1i64, 1i64), false)
            .unwrap()
            .map(|p| seq(&p.unwrap()))
            .collect();
        assert_eq!(fwd, vec![0, 1, 2]);

        // inclusive picks up the stop packet itself
        cur.seek((0, 0)).unwrap();
        let fwd: Vec<u16> = cur
            .slice((1i64, 1i64), true)
            .unwrap()
            .map(|p| seq(&p.unwrap()))
            .collect();
        assert_eq!(fwd, vec![0, 1, 2, 3]);

        // pkt = -1 implies inclusive through the end of the part
        cur.seek((0, 0)).unwrap();
        let fwd: Vec<u16> = cur
            .slice((1i64, -1i64), false)
            .unwrap()
            .map(|p| seq(&p.unwrap()))
            .collect();
        assert_eq!(fwd, vec![0, 1, 2, 3]);

        cur.seek(LAST).unwrap();
        let bwd: Vec<u16> = cur
            .slice((0i64, 1i64), true)
            .unwrap()
            .map(|p| seq(&p.unwrap()))
            .collect();
        assert_eq!(bwd, vec![4, 3, 2, 1]);

        cur.seek((1, 0)).unwrap();
        let rel: Vec<u16> = cur
            .slice(2i64, false)
            .unwrap()
            .map(|p| seq(&p.unwrap()))
            .collect();
        assert_eq!(rel, vec![2, 3]);
    }

    #[test]
    fn count_matches() {
        let mut cur = audio_cursor();
        // the sentinel's pkt = -1 means through the end, inclusive
        let count = RtpCursor::count(&mut cur, LAST, |_| true).unwrap();
        assert_eq!(count, 6);
        cur.seek((0, 0)).unwrap();
        let even =
            RtpCursor::count(&mut cur, LAST, |pkt| pkt.header.sequence_number % 2 == 0).unwrap();
        assert_eq!(even, 3);
    }

    #[test]
    fn fastforward_rewind_residuals() {
        let mut cur = audio_cursor();
        // packets every 0.02 s; asking for 0.05 s lands on +0.06 s
        let residual = cur.fastforward(0.05).unwrap();
        assert!((residual - 0.01).abs() < 1e-9);
        assert_eq!(cur.tell(), (1, 1)); // seq 3, at 0.06 s

        let residual = cur.rewind(0.05).unwrap();
        assert!((residual - 0.01).abs() < 1e-9);
        assert_eq!(cur.tell(), (0, 0));
    }

    #[test]
    fn fastforward_clamps_at_end() {
        let mut cur = audio_cursor();
        let residual = cur.fastforward(10.0).unwrap();
        assert!(residual < 0.0); // undershot: the stream is shorter
        assert_eq!(cur.tell(), (2, 1));
    }

    #[test]
    fn interval_to_end() {
        let mut cur = audio_cursor();
        let secs = cur.interval(None).unwrap();
        assert!((secs - 0.1).abs() < 1e-9);
        assert_eq!(cur.tell(), (0, 0)); // restored
    }

    #[test]
    fn compute_caches_whole_parts() {
        let mut cur = audio_cursor();
        let total = cur
            .compute(
                LAST,
                0,
                |pkt| interleaved_samples(pkt),
                |a, b| a + b,
                Some("samples"),
            )
            .unwrap();
        // 6 packets x 960 samples x 2 channels
        assert_eq!(total, 6 * 1920);
        assert!(cur.cache.contains_key(&("samples", 0)));
        assert!(cur.cache.contains_key(&("samples", 1)));
        assert!(cur.cache.contains_key(&("samples", 2)));

        // same span again, now served from the memo for whole parts
        cur.seek((0, 0)).unwrap();
        let again = cur
            .compute(
                LAST,
                0,
                |pkt| interleaved_samples(pkt),
                |a, b| a + b,
                Some("samples"),
            )
            .unwrap();
        assert_eq!(again, total);
    }

    #[test]
    fn compute_incremental_equals_single_pass() {
        let mut cur = audio_cursor();
        let whole = cur
            .compute((2i64, -1i64), 0, |pkt| interleaved_samples(pkt), |a, b| a + b, None)
            .unwrap();

        cur.seek((0, 0)).unwrap();
        let first = cur
            .compute((1i64, 0i64), 0, |pkt| interleaved_samples(pkt), |a, b| a + b, None)
            .unwrap();
        let rest = cur
            .compute((2i64, -1i64), 0, |pkt| interleaved_samples(pkt), |a, b| a + b, None)
            .unwrap();
        assert_eq!(first + rest, whole);
    }

    #[test]
    fn align_frame_lands_on_boundary() {
        // 6 packets x 1920 interleaved samples; frame = 1024 x 2 = 2048
        let mut cur = audio_cursor();
        cur.seek((2, 1)).unwrap();
        let a = cur.align_frame(1024, 2).unwrap();
        assert_eq!(a.position, cur.tell());
        assert!(a.trim_offset < 2048);
        assert_eq!((a.cumulative_samples + a.trim_offset) % 2048, 0);
        assert!(a.frames_consumed >= 1);
        // walked back far enough to cover at least one whole output frame
        let available: u64 = (5 - (a.position.0 * 2 + a.position.1) as u64) * 1920;
        assert!(available >= 2048 || a.position == (0, 0));
    }

    #[test]
    fn trim_frames_reports_range() {
        let mut cur = audio_cursor();
        cur.seek((1, 1)).unwrap();
        let t = cur.trim_frames((2, -1), 1024).unwrap();
        assert_eq!(t.end, (2, 1));
        assert!(t.begin <= (1, 1));
        assert!(t.begin_trim < 2048);
        assert!(t.frames.0 <= t.frames.1);
    }

    fn video_cursor() -> RtpCursor<Vec<u8>> {
        // frames every 3000 ticks: key start, continuation, inter start, ...
        const KEY_START: [u8; 11] = [
            0x10, 0x10, 0x00, 0x00, 0x9d, 0x01, 0x2a, 0x40, 0x01, 0xf0, 0x00,
        ];
        const INTER_START: [u8; 4] = [0x10, 0x01, 0x00, 0x00];
        const CONT: [u8; 2] = [0x00, 0xaa];
        let mut pkts = Vec::new();
        let mut seq = 0u16;
        for frame in 0..4u32 {
            let start: &[u8] = if frame % 3 == 0 { &KEY_START } else { &INTER_START };
            pkts.push(vp8_rtp(seq, frame * 3000, start));
            seq += 1;
            pkts.push(vp8_rtp(seq, frame * 3000, &CONT));
            seq += 1;
        }
        cursor_of(PayloadKind::Vp8, vec![mjr_bytes(b"video", &pkts)])
    }

    #[test]
    fn key_frame_search() {
        let mut cur = video_cursor();
        let key = cur.next_key_frame().unwrap().unwrap();
        assert_eq!(seq(&key), 0);
        // continue forward: next key frame starts frame 3
        let key = cur.next_key_frame().unwrap().unwrap();
        assert_eq!(seq(&key), 6);

        // the forward search left the position just past seq 6, so the
        // backward search re-finds the same key frame
        let back = cur.prev_key_frame().unwrap().unwrap();
        assert_eq!(seq(&back), 6);
    }

    #[test]
    fn time_cut_frame_alignment() {
        let mut cur = video_cursor();
        // 0.05 s lands mid-frame-2; frame alignment snaps to its start
        let cut = cur.time_cut(0.0, 0.05, TimeCutAlign::Frame).unwrap();
        assert_eq!(cut.begin, (0, 0));
        let stop_pkt = {
            cur.seek((cut.end.0 as i64, cut.end.1 as i64)).unwrap();
            cur.current().unwrap()
        };
        assert!(stop_pkt.payload.is_start_of_frame());
        assert!(cut.end_secs <= 0.05 + 0.034);
        assert!(cut.begin_secs.abs() < 1e-9);
    }

    #[test]
    fn time_cut_prev_steps_back_once_more() {
        let mut cur = video_cursor();
        let frame = cur.time_cut(0.0, 0.05, TimeCutAlign::Frame).unwrap();
        let mut cur = video_cursor();
        let prev = cur.time_cut(0.0, 0.05, TimeCutAlign::Prev).unwrap();
        assert!(prev.end < frame.end);
    }
}
