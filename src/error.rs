// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error type shared by every layer of the crate.

pub type Result<T> = std::result::Result<T, Error>;

/// All the ways reading archived RTP can fail.
///
/// Readers treat a clean end-of-file at a record boundary as normal
/// iteration end, not an error; `Truncated` therefore only surfaces when a
/// record or structure was cut short mid-way.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A read returned fewer bytes than the structure requires.
    #[error("truncated input: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    /// A structural invariant was violated (bad marker, RTP version,
    /// pad length, Opus TOC, ...).
    #[error("malformed input: {0}")]
    Malformed(String),

    /// A record file declared a stream type other than `audio` / `video`.
    #[error("unsupported stream type {0:?}")]
    UnsupportedType(String),

    /// No reader is registered for the file extension.
    #[error("no format registered for extension {0:?}")]
    UnknownFormat(String),

    /// A seek or index outside the cursor or part.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// A derived quantity can't be produced from the input at hand, e.g.
    /// probing dimensions from a stream with no key frame, or time-domain
    /// operations on packets whose payload kind has no clock rate.
    #[error("unavailable: {0}")]
    Unavailable(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True if this is a `Truncated` error, which readers translate into
    /// end-of-stream when it happens exactly at a record boundary.
    pub fn is_truncated(&self) -> bool {
        matches!(self, Error::Truncated { .. })
    }
}
