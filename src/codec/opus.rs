// SPDX-License-Identifier: MIT OR Apache-2.0

//! Opus as specified in [RFC 7587](https://datatracker.ietf.org/doc/html/rfc7587)
//! (RTP payload) and [RFC 6716 section 3.1](https://datatracker.ietf.org/doc/html/rfc6716#section-3.1)
//! (the TOC byte).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Opus always runs a 48 kHz clock at this layer, regardless of the
/// bandwidth actually coded.
pub const CLOCK_RATE: u32 = 48_000;

/// The hard packet ceiling: 120 ms of audio at 48 kHz.
pub const MAX_SAMPLES: u32 = 5_760;

/// One RTP packet's worth of Opus. The first byte is the TOC; everything
/// after it stays opaque (the decoder wants the packet whole).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpusPayload {
    pub data: Bytes,
}

impl OpusPayload {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::Truncated {
                expected: 1,
                got: 0,
            });
        }
        Ok(OpusPayload {
            data: Bytes::copy_from_slice(buf),
        })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_slice(&self.data);
    }

    fn toc(&self) -> Result<u8> {
        self.data.first().copied().ok_or(Error::Truncated {
            expected: 1,
            got: 0,
        })
    }

    /// Number of coded frames in this packet, from the TOC `c` bits.
    pub fn nb_frames(&self) -> Result<u32> {
        let code = self.toc()? & 0x03;
        match code {
            0 => Ok(1),
            1 | 2 => Ok(2),
            _ => {
                let count = self.data.get(1).copied().ok_or(Error::Truncated {
                    expected: 2,
                    got: self.data.len(),
                })?;
                Ok(u32::from(count & 0x3f))
            }
        }
    }

    /// Samples per coded frame at 48 kHz, per the silk/hybrid/celt branches
    /// of RFC 6716 table 2.
    pub fn nb_samples_per_frame(&self) -> Result<u32> {
        let toc = u32::from(self.toc()?);
        let size = if toc & 0x80 != 0 {
            // celt: 2.5, 5, 10, or 20 ms
            (CLOCK_RATE << ((toc >> 3) & 0x03)) / 400
        } else if toc & 0x60 == 0x60 {
            // hybrid: 10 or 20 ms
            if toc & 0x08 != 0 {
                CLOCK_RATE / 50
            } else {
                CLOCK_RATE / 100
            }
        } else {
            // silk: 10, 20, 40, or 60 ms
            let size = (toc >> 3) & 0x03;
            if size == 3 {
                CLOCK_RATE * 60 / 1000
            } else {
                (CLOCK_RATE << size) / 100
            }
        };
        Ok(size)
    }

    /// Total samples in this packet; more than 120 ms is malformed.
    pub fn nb_samples(&self) -> Result<u32> {
        let samples = self.nb_frames()? * self.nb_samples_per_frame()?;
        if samples > MAX_SAMPLES {
            return Err(Error::Malformed(format!(
                "opus packet declares {} samples, over the {} cap",
                samples, MAX_SAMPLES
            )));
        }
        Ok(samples)
    }

    pub fn nb_channels(&self) -> Result<u8> {
        Ok(if self.toc()? & 0x04 != 0 { 2 } else { 1 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(data: &[u8]) -> OpusPayload {
        OpusPayload::parse(data).unwrap()
    }

    #[test]
    fn celt_20ms() {
        // toc 0xf8: celt fullband, 20 ms, code 0, stereo bit clear.
        let p = payload(&[0xf8, 0x00]);
        assert_eq!(p.nb_frames().unwrap(), 1);
        assert_eq!(p.nb_samples_per_frame().unwrap(), 960);
        assert_eq!(p.nb_samples().unwrap(), 960);
        assert_eq!(p.nb_channels().unwrap(), 1);
        // same config with the stereo bit set
        assert_eq!(payload(&[0xfc]).nb_channels().unwrap(), 2);
        assert_eq!(payload(&[0xfc]).nb_samples().unwrap(), 960);
    }

    #[test]
    fn silk_60ms() {
        // toc 0x18: silk narrowband, 60 ms, mono, code 0.
        let p = payload(&[0x18]);
        assert_eq!(p.nb_samples_per_frame().unwrap(), 2_880);
        assert_eq!(p.nb_samples().unwrap(), 2_880);
        assert_eq!(p.nb_channels().unwrap(), 1);
    }

    #[test]
    fn hybrid_durations() {
        // toc 0x60: hybrid, 10 ms. toc 0x68: hybrid, 20 ms.
        assert_eq!(payload(&[0x60]).nb_samples_per_frame().unwrap(), 480);
        assert_eq!(payload(&[0x68]).nb_samples_per_frame().unwrap(), 960);
    }

    #[test]
    fn code_three_frame_count() {
        // code 3: frame count in the low six bits of the second byte.
        let p = payload(&[0x0b, 0x03]);
        assert_eq!(p.nb_frames().unwrap(), 3);
        assert!(matches!(
            payload(&[0x0b]).nb_frames(),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn at_cap_is_accepted() {
        // code 3 with 2 x 60 ms silk frames lands exactly on 120 ms.
        let p = payload(&[0x1b, 0x02]);
        assert_eq!(p.nb_samples().unwrap(), 5_760);
    }

    #[test]
    fn over_cap_is_malformed() {
        // code 3 with 3 x 60 ms silk frames = 8640 samples, over 120 ms.
        let p = payload(&[0x1b, 0x03]);
        assert!(matches!(p.nb_samples(), Err(Error::Malformed(_))));
    }

    #[test]
    fn empty_is_truncated() {
        assert!(matches!(
            OpusPayload::parse(&[]),
            Err(Error::Truncated { .. })
        ));
    }
}
