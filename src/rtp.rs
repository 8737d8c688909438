// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handles RTP data as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use std::ops::Range;
use std::time::Instant;

use bytes::Bytes;

use crate::WallTime;

/// The minimum length of an RTP header (no CSRCs).
const MIN_HEADER_LEN: u16 = 12;

/// Sequence gaps up to this size are counted as loss; larger forward jumps
/// are treated as stream resynchronization.
pub const MAX_DROPOUT: i32 = 3_000;

/// Packets at most this far behind the expected sequence are delivered as
/// out-of-order rather than dropped.
pub const MAX_MISORDER: i32 = 100;

/// RTP timestamps for H.264 use a 90 kHz clock.
const RTP_CLOCK_KHZ: f64 = 90.0;

/// Raw packet without state-specific interpretation or metadata.
///
/// Validates a raw buffer then provides accessors for it, keeping the payload
/// range computed during validation as a `Range<u16>`.
///
/// The padding and extension bits are exposed but deliberately not applied
/// to the payload range: the payload always starts at `12 + 4·CC` and runs
/// to the end of the buffer. H.264 senders in practice use neither, and the
/// downstream NAL handling tolerates a stray extension header.
#[derive(Debug)]
pub(crate) struct RawPacket(
    /// Full packet data, including headers.
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                           timestamp                           |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |           synchronization source (SSRC) identifier            |
    /// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    /// |            contributing source (CSRC) identifiers             |
    /// |                             ....                              |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    pub(crate) Bytes,
);

impl RawPacket {
    /// Validates an RTP packet, returning a wrapper and the payload range.
    pub(crate) fn new(data: Bytes) -> Result<(Self, Range<u16>), RawPacketError> {
        // RTP doesn't have a defined maximum size but it's implied by the
        // transport: UDP datagrams and interleaved data messages both carry
        // at most 65,536 bytes.
        let len = match u16::try_from(data.len()) {
            Ok(l) => l,
            Err(_) => {
                return Err(RawPacketError {
                    reason: "too long",
                    data,
                })
            }
        };
        if len < MIN_HEADER_LEN {
            return Err(RawPacketError {
                reason: "too short",
                data,
            });
        }
        if (data[0] & 0b1100_0000) != 2 << 6 {
            return Err(RawPacketError {
                reason: "must be version 2",
                data,
            });
        }
        let csrc_count = data[0] & 0b0000_1111;
        let payload_start = MIN_HEADER_LEN + (4 * u16::from(csrc_count));
        if len < payload_start {
            return Err(RawPacketError {
                reason: "payload start is after end of packet",
                data,
            });
        }
        Ok((Self(data), payload_start..len))
    }

    #[inline]
    pub(crate) fn has_padding(&self) -> bool {
        (self.0[0] & 0b0010_0000) != 0
    }

    #[inline]
    pub(crate) fn has_extension(&self) -> bool {
        (self.0[0] & 0b0001_0000) != 0
    }

    #[inline]
    pub(crate) fn mark(&self) -> bool {
        (self.0[1] & 0b1000_0000) != 0
    }

    #[inline]
    pub(crate) fn payload_type(&self) -> u8 {
        self.0[1] & 0b0111_1111
    }

    #[inline]
    pub(crate) fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    #[inline]
    pub(crate) fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    #[inline]
    pub(crate) fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }
}

#[derive(Debug)]
pub(crate) struct RawPacketError {
    pub(crate) reason: &'static str,
    pub(crate) data: Bytes,
}

/// Disposition of one packet under the sequence discipline.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SequenceStatus {
    /// Exactly the expected sequence number.
    Valid,

    /// A forward gap of the given size; the packet itself is delivered.
    Lost(u16),

    /// Behind the expected sequence but within [`MAX_MISORDER`]; delivered.
    OutOfOrder,

    /// An immediate repeat of the previous sequence number; dropped.
    Duplicate,

    /// A jump beyond [`MAX_DROPOUT`]/[`MAX_MISORDER`]; the tracker resets to
    /// follow the new position and the packet is delivered.
    Resync,
}

/// Classifies arriving sequence numbers, modulo 2^16.
///
/// `expected` is unset until the first packet, which is always `Valid`.
#[derive(Debug, Default)]
pub(crate) struct SequenceTracker {
    expected: Option<u16>,
    max_seq: u16,
}

impl SequenceTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the highest sequence number observed so far.
    #[allow(dead_code)]
    pub(crate) fn max_seq(&self) -> u16 {
        self.max_seq
    }

    pub(crate) fn observe(&mut self, seq: u16) -> SequenceStatus {
        let expected = match self.expected {
            None => {
                self.expected = Some(seq.wrapping_add(1));
                self.max_seq = seq;
                return SequenceStatus::Valid;
            }
            Some(e) => e,
        };
        if seq.wrapping_sub(self.max_seq) < 0x8000 {
            self.max_seq = seq;
        }
        let delta = i32::from(seq.wrapping_sub(expected) as i16);
        if delta == 0 {
            self.expected = Some(seq.wrapping_add(1));
            SequenceStatus::Valid
        } else if delta > 0 && delta < MAX_DROPOUT {
            self.expected = Some(seq.wrapping_add(1));
            SequenceStatus::Lost(delta as u16)
        } else if delta == -1 {
            SequenceStatus::Duplicate
        } else if delta < 0 && delta > -MAX_MISORDER {
            SequenceStatus::OutOfOrder
        } else {
            self.expected = Some(seq.wrapping_add(1));
            SequenceStatus::Resync
        }
    }
}

/// Simplified interarrival jitter, after
/// [RFC 3550 section 6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1):
/// per-packet samples `|ΔA − ΔR/90|` in milliseconds, accumulated into a
/// running mean rather than the RFC's 1/16 exponential smoothing.
#[derive(Debug, Default)]
pub(crate) struct JitterEstimator {
    prev: Option<(Instant, u32)>,
    mean_ms: f64,
    samples: u64,
}

impl JitterEstimator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn observe(&mut self, arrival: Instant, rtp_timestamp: u32) {
        if let Some((prev_arrival, prev_rtp)) = self.prev {
            let arrival_delta_ms =
                arrival.saturating_duration_since(prev_arrival).as_secs_f64() * 1_000.0;
            let rtp_delta_ms =
                f64::from(rtp_timestamp.wrapping_sub(prev_rtp) as i32) / RTP_CLOCK_KHZ;
            let sample = (arrival_delta_ms - rtp_delta_ms).abs();
            self.samples += 1;
            self.mean_ms += (sample - self.mean_ms) / self.samples as f64;
        }
        self.prev = Some((arrival, rtp_timestamp));
    }

    pub(crate) fn mean_ms(&self) -> f64 {
        self.mean_ms
    }
}

/// Receive-side statistics, reported every ten packets, on the housekeeping
/// tick, and on demand via [`crate::receiver::RtpReceiver::stats`].
#[derive(Clone, Debug)]
pub struct RtpStats {
    pub packets_received: u64,

    /// Sum of forward sequence gaps within the [`MAX_DROPOUT`] window. A
    /// late packet that fills a counted gap decrements this again, so
    /// reorders are never counted as loss.
    pub packets_lost: u64,

    pub packets_out_of_order: u64,
    pub packets_duplicate: u64,
    pub bytes_received: u64,

    /// Sequence jumps beyond the dropout window, silently followed.
    pub resyncs: u64,

    /// Undecodable packets (short, bad version, malformed FU-A).
    pub parse_errors: u64,

    /// FU-A reassemblies abandoned for size, age, or timestamp change.
    pub fragments_discarded: u64,

    /// Mid-stream SSRC changes (accepted, but noteworthy).
    pub ssrc_changes: u64,

    /// Bits per second over the interval preceding the last report.
    pub bitrate_bps: u64,

    /// Running mean interarrival jitter.
    pub jitter_ms: f64,

    pub updated_at: WallTime,
}

impl RtpStats {
    pub(crate) fn new() -> Self {
        Self {
            packets_received: 0,
            packets_lost: 0,
            packets_out_of_order: 0,
            packets_duplicate: 0,
            bytes_received: 0,
            resyncs: 0,
            parse_errors: 0,
            fragments_discarded: 0,
            ssrc_changes: 0,
            bitrate_bps: 0,
            jitter_ms: 0.0,
            updated_at: WallTime::now(),
        }
    }
}

impl std::fmt::Display for RtpStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "received={} lost={} reordered={} dup={} bytes={} bitrate={}bps \
             jitter={:.2}ms resyncs={} discarded_frags={}",
            self.packets_received,
            self.packets_lost,
            self.packets_out_of_order,
            self.packets_duplicate,
            self.bytes_received,
            self.bitrate_bps,
            self.jitter_ms,
            self.resyncs,
            self.fragments_discarded,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    #[test]
    fn raw_packet_accessors() {
        let data = packet(&[
            0x80, 0x61, 0x00, 0x01, 0x00, 0x00, 0x00, 0x64, 0xDE, 0xAD, 0xBE, 0xEF, 0x65, 0xAA,
        ]);
        let (pkt, payload) = RawPacket::new(data).unwrap();
        assert!(pkt.mark());
        assert_eq!(pkt.payload_type(), 0x61);
        assert_eq!(pkt.sequence_number(), 1);
        assert_eq!(pkt.timestamp(), 100);
        assert_eq!(pkt.ssrc(), 0xDEAD_BEEF);
        assert_eq!(&pkt.0[usize::from(payload.start)..], b"\x65\xAA");
    }

    #[test]
    fn raw_packet_rejects_bad_version() {
        let mut data = vec![0u8; 12];
        data[0] = 0x40; // version 1.
        assert_eq!(
            RawPacket::new(packet(&data)).unwrap_err().reason,
            "must be version 2"
        );
        assert_eq!(
            RawPacket::new(packet(&[0x80, 0x00])).unwrap_err().reason,
            "too short"
        );
    }

    #[test]
    fn raw_packet_csrc_offset() {
        let mut data = vec![0u8; 18];
        data[0] = 0x81; // version 2, one CSRC.
        let (_, payload) = RawPacket::new(packet(&data)).unwrap();
        assert_eq!(payload, 16..18);
        // CSRC list running past the buffer is an error.
        let mut data = vec![0u8; 13];
        data[0] = 0x82;
        assert!(RawPacket::new(packet(&data)).is_err());
    }

    #[test]
    fn sequence_in_order() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.observe(1000), SequenceStatus::Valid);
        assert_eq!(t.observe(1001), SequenceStatus::Valid);
        assert_eq!(t.observe(1002), SequenceStatus::Valid);
    }

    #[test]
    fn sequence_loss_then_late_arrival() {
        // 1002 opens a gap that 1001 closes late.
        let mut t = SequenceTracker::new();
        assert_eq!(t.observe(1000), SequenceStatus::Valid);
        assert_eq!(t.observe(1002), SequenceStatus::Lost(1));
        assert_eq!(t.observe(1001), SequenceStatus::OutOfOrder);
        assert_eq!(t.observe(1003), SequenceStatus::Valid);
    }

    #[test]
    fn sequence_duplicate() {
        // An immediate repeat of 1001 is a duplicate, not a reorder.
        let mut t = SequenceTracker::new();
        assert_eq!(t.observe(1000), SequenceStatus::Valid);
        assert_eq!(t.observe(1001), SequenceStatus::Valid);
        assert_eq!(t.observe(1001), SequenceStatus::Duplicate);
        assert_eq!(t.observe(1002), SequenceStatus::Valid);
    }

    #[test]
    fn sequence_wraps() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.observe(65_534), SequenceStatus::Valid);
        assert_eq!(t.observe(65_535), SequenceStatus::Valid);
        assert_eq!(t.observe(0), SequenceStatus::Valid);
        assert_eq!(t.observe(1), SequenceStatus::Valid);
        assert_eq!(t.max_seq(), 1);
    }

    #[test]
    fn sequence_gap_wrapping_counts_loss() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.observe(65_535), SequenceStatus::Valid);
        assert_eq!(t.observe(2), SequenceStatus::Lost(2));
    }

    #[test]
    fn sequence_resync_on_large_jump() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.observe(1000), SequenceStatus::Valid);
        assert_eq!(t.observe(20_000), SequenceStatus::Resync);
        // Tracker follows the new position.
        assert_eq!(t.observe(20_001), SequenceStatus::Valid);
    }

    #[test]
    fn jitter_smooth_stream_is_near_zero() {
        let mut j = JitterEstimator::new();
        let start = Instant::now();
        // 90 kHz: 3000 ticks per 33⅓ ms frame.
        for i in 0..10u32 {
            j.observe(
                start + std::time::Duration::from_micros(u64::from(i) * 33_333),
                i * 3_000,
            );
        }
        assert!(j.mean_ms() < 1.0, "jitter {}", j.mean_ms());
    }
}
