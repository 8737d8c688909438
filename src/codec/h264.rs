// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en) RTP payload
//! handling as specified in [RFC 6184](https://tools.ietf.org/html/rfc6184):
//! single NAL unit packets and FU-A fragmentation units.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;

use super::NalUnit;

/// FU-A payload type, RFC 6184 section 5.4.
const FU_A: u8 = 28;

/// An in-progress reassembly larger than this is abandoned.
const MAX_FRAGMENT_BYTES: usize = 1 << 20;

/// The periodic sweep abandons reassemblies older than this.
const SWEEP_MAX_AGE: Duration = Duration::from_secs(10);

/// Turns RTP payloads into NAL units.
///
/// Single-NAL packets (types 1–23, and anything else that is not FU-A) pass
/// straight through; FU-A fragments are accumulated in an in-place buffer
/// until the end fragment arrives. Completed NALs are queued for
/// [`Depacketizer::pull`], tagged with the RTP timestamp they arrived under.
///
/// STAP-A (type 24) aggregation packets are *not* unpacked; they fall
/// through the single-NAL path unmodified.
pub struct Depacketizer {
    /// Reassembly buffer. Non-empty iff a start fragment has been seen.
    frag: BytesMut,
    frag_timestamp: u32,
    frag_started: Option<Instant>,
    frag_timeout: Duration,
    pending: VecDeque<(NalUnit, u32)>,
    discarded: u64,
}

/// Per-packet depacketization failure. These are counted by the receiver,
/// never surfaced beyond it.
#[derive(Debug, thiserror::Error)]
pub enum DepacketizeError {
    #[error("empty RTP payload")]
    EmptyPayload,

    #[error("NAL header has forbidden bit set ({0:#04x})")]
    ForbiddenBit(u8),

    #[error("bad NAL header {0:#04x}")]
    BadHeader(u8),

    #[error("FU-A payload too short ({0} bytes)")]
    FuTooShort(usize),

    #[error("FU-A header has both start and end bits set")]
    FuStartAndEnd,

    #[error("FU-A continuation without a start fragment")]
    FuMissingStart,
}

impl Depacketizer {
    pub fn new(frag_timeout: Duration) -> Self {
        Self {
            frag: BytesMut::new(),
            frag_timestamp: 0,
            frag_started: None,
            frag_timeout,
            pending: VecDeque::new(),
            discarded: 0,
        }
    }

    /// Reassemblies abandoned so far (size, age, or timestamp change).
    pub fn discarded_fragments(&self) -> u64 {
        self.discarded
    }

    /// Processes one RTP payload. Completed NAL units become available via
    /// [`Depacketizer::pull`].
    pub fn push(&mut self, payload: Bytes, timestamp: u32) -> Result<(), DepacketizeError> {
        self.push_at(payload, timestamp, Instant::now())
    }

    fn push_at(
        &mut self,
        payload: Bytes,
        timestamp: u32,
        now: Instant,
    ) -> Result<(), DepacketizeError> {
        if payload.is_empty() {
            return Err(DepacketizeError::EmptyPayload);
        }
        let indicator = payload[0];
        if (indicator >> 7) != 0 {
            return Err(DepacketizeError::ForbiddenBit(indicator));
        }
        if indicator & 0b11111 != FU_A {
            // Single NAL unit packet. SPS/PPS surfacing and STAP-A
            // fall-through both happen here.
            let nal = NalUnit::new(payload, 4)
                .map_err(|_| DepacketizeError::BadHeader(indicator))?;
            self.pending.push_back((nal, timestamp));
            return Ok(());
        }

        // FU-A, RFC 6184 section 5.8.
        if payload.len() < 2 {
            return Err(DepacketizeError::FuTooShort(payload.len()));
        }
        let fu_header = payload[1];
        let start = (fu_header & 0b1000_0000) != 0;
        let end = (fu_header & 0b0100_0000) != 0;
        if start && end {
            return Err(DepacketizeError::FuStartAndEnd);
        }

        // A timestamp change invalidates whatever is being reassembled
        // before the new packet is considered.
        if self.frag_started.is_some() && timestamp != self.frag_timestamp {
            self.discard("timestamp changed mid-reassembly");
        }

        if start {
            if self.frag_started.is_some() {
                self.discard("start fragment while reassembly in progress");
            }
            self.frag.clear();
            // Reconstruct the real NAL header from the indicator's NRI bits
            // and the fragmented type.
            self.frag
                .put_u8((indicator & 0b1110_0000) | (fu_header & 0b0001_1111));
            self.frag.extend_from_slice(&payload[2..]);
            self.frag_timestamp = timestamp;
            self.frag_started = Some(now);
            return Ok(());
        }

        let started = match self.frag_started {
            None => return Err(DepacketizeError::FuMissingStart),
            Some(s) => s,
        };
        if now.saturating_duration_since(started) > self.frag_timeout {
            self.discard("reassembly exceeded age limit");
            return Ok(());
        }
        self.frag.extend_from_slice(&payload[2..]);
        if self.frag.len() > MAX_FRAGMENT_BYTES {
            self.discard("reassembly exceeded size limit");
            return Ok(());
        }
        if end {
            let data = self.frag.split().freeze();
            self.frag_started = None;
            let hdr = data[0];
            let nal = NalUnit::new(data, 4).map_err(|_| DepacketizeError::BadHeader(hdr))?;
            self.pending.push_back((nal, self.frag_timestamp));
        }
        Ok(())
    }

    /// Returns the next completed NAL unit and its RTP timestamp.
    pub fn pull(&mut self) -> Option<(NalUnit, u32)> {
        self.pending.pop_front()
    }

    /// Abandons a reassembly that has been in progress too long. Called from
    /// the owner's housekeeping tick.
    pub fn sweep(&mut self, now: Instant) {
        if let Some(started) = self.frag_started {
            if now.saturating_duration_since(started) > SWEEP_MAX_AGE {
                self.discard("stale reassembly swept");
            }
        }
    }

    fn discard(&mut self, why: &str) {
        debug!(
            "discarding {}-byte fragment at ts {}: {}",
            self.frag.len(),
            self.frag_timestamp,
            why
        );
        self.frag.clear();
        self.frag_started = None;
        self.discarded += 1;
    }
}
