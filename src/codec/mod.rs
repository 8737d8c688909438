// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.264 elementary-stream types shared between the depacketizer and the
//! access-unit assembler.

use bytes::Bytes;
use h264_reader::nal::{NalHeader, UnitType};

pub mod access_unit;
pub mod h264;

/// The Annex-B start code prepended with a recorded length of 4.
pub(crate) const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// One Network Abstraction Layer unit, stored without a start code.
///
/// `data` holds the complete NAL: the header byte (forbidden-zero bit,
/// `nal_ref_idc`, type) followed by the RBSP payload. The start-code length
/// it arrived with (3 or 4 bytes; reassembled NALs default to 4) is recorded
/// so serialization can reproduce the original framing.
#[derive(Clone)]
pub struct NalUnit {
    hdr: NalHeader,
    data: Bytes,
    start_code_len: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum NalError {
    #[error("empty NAL unit")]
    Empty,

    #[error("bad NAL header {0:#04x}")]
    BadHeader(u8),
}

impl NalUnit {
    /// Wraps a complete NAL (header byte plus payload, no start code).
    pub fn new(data: Bytes, start_code_len: usize) -> Result<Self, NalError> {
        debug_assert!(start_code_len == 3 || start_code_len == 4);
        if data.is_empty() {
            return Err(NalError::Empty);
        }
        if data[0] & 0b11111 == 0 {
            return Err(NalError::BadHeader(data[0]));
        }
        let hdr = NalHeader::new(data[0]).map_err(|_| NalError::BadHeader(data[0]))?;
        Ok(Self {
            hdr,
            data,
            start_code_len,
        })
    }

    #[inline]
    pub fn nal_type(&self) -> UnitType {
        self.hdr.nal_unit_type()
    }

    #[inline]
    pub fn nal_ref_idc(&self) -> u8 {
        self.hdr.nal_ref_idc()
    }

    /// The complete NAL bytes, header byte first, without a start code.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn start_code_len(&self) -> usize {
        self.start_code_len
    }

    /// Returns the same NAL with a different recorded start-code length.
    /// Used when prepending cached parameter sets, which always get the
    /// 4-byte form.
    pub(crate) fn with_start_code_len(mut self, len: usize) -> Self {
        debug_assert!(len == 3 || len == 4);
        self.start_code_len = len;
        self
    }

    /// Appends this NAL to `out` in Annex-B framing, using the recorded
    /// start-code length.
    pub fn write_annex_b(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&START_CODE[4 - self.start_code_len..]);
        out.extend_from_slice(&self.data[..]);
    }

    /// Returns this NAL in Annex-B framing.
    pub fn to_annex_b(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.start_code_len + self.data.len());
        self.write_annex_b(&mut out);
        out.into()
    }
}

impl std::fmt::Debug for NalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NalUnit")
            .field("type", &self.nal_type())
            .field("nal_ref_idc", &self.nal_ref_idc())
            .field("len", &self.data.len())
            .field("start_code_len", &self.start_code_len)
            .finish()
    }
}

/// Picture type of an access unit, as far as it can be determined without
/// parsing slice headers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameType {
    I,
    P,
    B,
    Unknown,
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameType::I => f.pad("I"),
            FrameType::P => f.pad("P"),
            FrameType::B => f.pad("B"),
            FrameType::Unknown => f.pad("unknown"),
        }
    }
}

/// One complete coded picture in Annex-B byte-stream form.
#[derive(Clone, Debug)]
pub struct AccessUnit {
    /// The serialized Annex-B byte stream, start codes included.
    pub data: Bytes,

    /// RTP timestamp of the first slice NAL.
    pub timestamp: u32,

    /// True iff the unit contains an IDR slice.
    pub is_key: bool,

    pub frame_type: FrameType,

    /// The constituent NAL units in serialization order. For key frames
    /// with cached parameter sets, the first two are SPS then PPS.
    pub nals: Vec<NalUnit>,

    /// True iff cached SPS and PPS were prepended.
    pub has_parameter_sets: bool,
}

/// Video parameters handed to the decoder sink.
///
/// The SPS is not bit-parsed (that requires Exponential-Golomb decoding of
/// the RBSP); these are declared values, configurable on the assembler.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VideoParameters {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

impl Default for VideoParameters {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: 30.0,
        }
    }
}

impl std::fmt::Display for VideoParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}fps", self.width, self.height, self.frame_rate)
    }
}
