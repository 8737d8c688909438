// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Receives RTP packets from a UDP socket or the interleaved RTSP stream,
//! applies the sequence discipline, and fans depacketized NAL units out to
//! an observer.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use log::{debug, trace, warn};
use pretty_hex::PrettyHex;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use crate::codec::h264::Depacketizer;
use crate::codec::NalUnit;
use crate::error::ErrorInt;
use crate::rtp::{JitterEstimator, RawPacket, RtpStats, SequenceStatus, SequenceTracker};
use crate::{Error, Timeouts, WallTime};

use h264_reader::nal::UnitType;

/// Kernel receive buffer requested for the RTP socket. Live video bursts
/// around key frames; the default buffer drops packets under load.
const UDP_RECV_BUFFER_BYTES: usize = 640 * 1024;

/// Statistics are reported after this many received packets (and on the
/// 5 s housekeeping cadence).
const STATS_PACKET_PERIOD: u32 = 10;

/// Consecutive receive timeouts before the starvation warning.
const IDLE_TIMEOUTS_BEFORE_WARNING: u32 = 5;

/// Pause after an unexpected socket error before retrying.
const IO_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Callback surface of the receiver. All methods have empty defaults and
/// are invoked serialized, in arrival order (after FU-A reassembly).
pub trait ReceiverObserver: Send + Sync + 'static {
    /// One NAL unit with the RTP timestamp of the packet(s) carrying it.
    fn on_nal(&self, nal: &NalUnit, timestamp: u32) {
        let _ = (nal, timestamp);
    }

    /// A sequence parameter set was received. Also delivered via `on_nal`.
    fn on_sps(&self, nal: &NalUnit) {
        let _ = nal;
    }

    /// A picture parameter set was received. Also delivered via `on_nal`.
    fn on_pps(&self, nal: &NalUnit) {
        let _ = nal;
    }

    fn on_stats(&self, stats: &RtpStats) {
        let _ = stats;
    }

    /// Fatal receive errors and the transient starvation warning
    /// (distinguish with [`Error::is_transient`]).
    fn on_error(&self, error: &Error) {
        let _ = error;
    }
}

struct RecvState {
    seq: SequenceTracker,
    jitter: JitterEstimator,
    depacketizer: Depacketizer,
    stats: RtpStats,
    ssrc: Option<u32>,
    since_report: u32,
    interval_bytes: u64,
    interval_start: Instant,
}

impl RecvState {
    fn report(&mut self, now: Instant) -> RtpStats {
        let elapsed = now.saturating_duration_since(self.interval_start).as_secs_f64();
        self.stats.bitrate_bps = if elapsed > 0.0 {
            ((self.interval_bytes * 8) as f64 / elapsed) as u64
        } else {
            0
        };
        self.stats.updated_at = WallTime::now();
        self.interval_bytes = 0;
        self.interval_start = now;
        self.since_report = 0;
        self.stats.clone()
    }
}

struct Inner {
    payload_type: u8,
    timeouts: Timeouts,
    observer: Arc<dyn ReceiverObserver>,
    state: Mutex<RecvState>,
    running: AtomicBool,
    shutdown: Notify,
}

/// The RTP depacketizing receiver.
///
/// In UDP mode, [`RtpReceiver::start_udp`] binds the negotiated port and
/// spawns the receive loop. In TCP interleaved mode, wire the session's
/// `on_interleaved_data` callback to [`RtpReceiver::push_interleaved`] and
/// call [`RtpReceiver::start_interleaved`] once for housekeeping.
#[derive(Clone)]
pub struct RtpReceiver {
    inner: Arc<Inner>,
}

impl RtpReceiver {
    pub fn new(payload_type: u8, timeouts: Timeouts, observer: Arc<dyn ReceiverObserver>) -> Self {
        Self {
            inner: Arc::new(Inner {
                payload_type,
                timeouts,
                observer,
                state: Mutex::new(RecvState {
                    seq: SequenceTracker::new(),
                    jitter: JitterEstimator::new(),
                    depacketizer: Depacketizer::new(timeouts.fragment_reassembly),
                    stats: RtpStats::new(),
                    ssrc: None,
                    since_report: 0,
                    interval_bytes: 0,
                    interval_start: Instant::now(),
                }),
                running: AtomicBool::new(true),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Binds the requested RTP port (falling back to an ephemeral port if it
    /// is already in use), spawns the receive and housekeeping tasks, and
    /// returns the port actually bound.
    pub async fn start_udp(&self, port: u16) -> Result<u16, Error> {
        let socket = bind_udp(port).map_err(|source| wrap!(ErrorInt::UdpBindError {
            port,
            source,
        }))?;
        let socket = UdpSocket::from_std(socket)
            .map_err(|source| wrap!(ErrorInt::UdpBindError { port, source }))?;
        let actual = socket
            .local_addr()
            .map_err(|source| wrap!(ErrorInt::UdpBindError { port, source }))?
            .port();
        if actual != port {
            warn!("RTP port {port} in use, bound {actual} instead");
        }
        let inner = self.inner.clone();
        tokio::spawn(async move { recv_loop(inner, socket).await });
        self.spawn_housekeeping();
        Ok(actual)
    }

    /// Starts the housekeeping task for TCP interleaved mode, where packets
    /// arrive via [`RtpReceiver::push_interleaved`] instead of a socket.
    pub fn start_interleaved(&self) {
        self.spawn_housekeeping();
    }

    /// Accepts one interleaved payload from the RTSP session. RTCP
    /// (`is_rtp == false`) is passed through unprocessed.
    pub fn push_interleaved(&self, is_rtp: bool, data: Bytes) {
        if !self.inner.running.load(Ordering::Relaxed) {
            return;
        }
        if !is_rtp {
            trace!("ignoring {}-byte RTCP message", data.len());
            return;
        }
        process_packet(&self.inner, data);
    }

    /// Current statistics snapshot, without resetting the report interval.
    pub fn stats(&self) -> RtpStats {
        let mut state = lock_state(&self.inner.state);
        state.stats.updated_at = WallTime::now();
        state.stats.clone()
    }

    /// Stops the receive and housekeeping tasks. Idempotent.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        self.inner.shutdown.notify_waiters();
    }

    fn spawn_housekeeping(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(inner.timeouts.housekeeping);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut n = 0u64;
            while inner.running.load(Ordering::Relaxed) {
                tokio::select! {
                    _ = inner.shutdown.notified() => break,
                    _ = tick.tick() => {}
                }
                n += 1;
                if n % 10 == 0 {
                    lock_state(&inner.state).depacketizer.sweep(Instant::now());
                }
                if n % 5 == 0 {
                    let stats = {
                        let mut state = lock_state(&inner.state);
                        (state.since_report > 0).then(|| state.report(Instant::now()))
                    };
                    if let Some(stats) = stats {
                        debug!("rtp stats: {stats}");
                        inner.observer.on_stats(&stats);
                    }
                }
            }
        });
    }
}

/// Binds the RTP socket with the enlarged receive buffer, nonblocking for
/// tokio registration. An in-use requested port falls back to ephemeral.
fn bind_udp(port: u16) -> Result<std::net::UdpSocket, std::io::Error> {
    use socket2::{Domain, Protocol, Socket, Type};
    let bind_at = |port: u16| -> Result<Socket, std::io::Error> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_recv_buffer_size(UDP_RECV_BUFFER_BYTES)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
        Ok(socket)
    };
    let socket = match bind_at(port) {
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && port != 0 => bind_at(0)?,
        other => other?,
    };
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

async fn recv_loop(inner: Arc<Inner>, socket: UdpSocket) {
    let mut buf = vec![0u8; 65_536];
    let mut idle = 0u32;
    while inner.running.load(Ordering::Relaxed) {
        let recv = tokio::time::timeout(inner.timeouts.udp_receive, socket.recv_from(&mut buf));
        tokio::select! {
            _ = inner.shutdown.notified() => break,
            r = recv => match r {
                Err(_elapsed) => {
                    // Timeouts are normal idle indicators; a run of them
                    // suggests a NAT or firewall is eating the stream.
                    idle += 1;
                    if idle >= IDLE_TIMEOUTS_BEFORE_WARNING {
                        let e = wrap!(ErrorInt::RtpIdle {
                            idle: inner.timeouts.udp_receive * idle,
                        });
                        warn!("{e}");
                        inner.observer.on_error(&e);
                        idle = 0;
                    }
                }
                Ok(Ok((n, _from))) => {
                    idle = 0;
                    process_packet(&inner, Bytes::copy_from_slice(&buf[..n]));
                }
                Ok(Err(source)) => {
                    if !inner.running.load(Ordering::Relaxed) {
                        break;
                    }
                    let e = wrap!(ErrorInt::UdpRecvError {
                        when: WallTime::now(),
                        source,
                    });
                    warn!("{e}");
                    tokio::time::sleep(IO_ERROR_PAUSE).await;
                }
            }
        }
    }
    trace!("rtp receive loop exiting");
}

/// Runs one packet through validation, the sequence discipline, and the
/// depacketizer. Observer callbacks happen after the state lock is
/// released, so observers may call back into the receiver.
fn process_packet(inner: &Inner, data: Bytes) {
    let mut nals: Vec<(NalUnit, u32)> = Vec::new();
    let mut stats = None;
    {
        let mut s = lock_state(&inner.state);
        let (pkt, payload_range) = match RawPacket::new(data) {
            Ok(p) => p,
            Err(e) => {
                s.stats.parse_errors += 1;
                let dump = &e.data[..e.data.len().min(48)];
                debug!("undecodable RTP packet ({}): {:?}", e.reason, dump.hex_dump());
                return;
            }
        };
        if pkt.payload_type() != inner.payload_type {
            trace!(
                "dropping payload type {} (expecting {})",
                pkt.payload_type(),
                inner.payload_type
            );
            return;
        }
        let ssrc = pkt.ssrc();
        match s.ssrc {
            None => s.ssrc = Some(ssrc),
            Some(prev) if prev != ssrc => {
                warn!("SSRC changed mid-stream: {prev:08x} -> {ssrc:08x}");
                s.stats.ssrc_changes += 1;
                s.ssrc = Some(ssrc);
            }
            Some(_) => {}
        }
        let seq = pkt.sequence_number();
        match s.seq.observe(seq) {
            SequenceStatus::Valid => {}
            SequenceStatus::Duplicate => {
                s.stats.packets_duplicate += 1;
                return;
            }
            SequenceStatus::Lost(n) => {
                debug!("{n} packet(s) lost before seq {seq:04x}");
                s.stats.packets_lost += u64::from(n);
            }
            SequenceStatus::OutOfOrder => {
                s.stats.packets_out_of_order += 1;
                // This arrival fills a gap counted as loss when the later
                // packet went past it.
                s.stats.packets_lost = s.stats.packets_lost.saturating_sub(1);
            }
            SequenceStatus::Resync => {
                debug!("resynchronized at seq {seq:04x}");
                s.stats.resyncs += 1;
            }
        }
        let timestamp = pkt.timestamp();
        s.jitter.observe(Instant::now(), timestamp);
        s.stats.jitter_ms = s.jitter.mean_ms();
        s.stats.packets_received += 1;
        let len = pkt.0.len() as u64;
        s.stats.bytes_received += len;
        s.interval_bytes += len;

        let mut payload = pkt.0;
        payload.truncate(usize::from(payload_range.end));
        payload.advance(usize::from(payload_range.start));
        if let Err(e) = s.depacketizer.push(payload, timestamp) {
            s.stats.parse_errors += 1;
            debug!("depacketize error at seq {seq:04x}: {e}");
        }
        s.stats.fragments_discarded = s.depacketizer.discarded_fragments();
        while let Some(item) = s.depacketizer.pull() {
            nals.push(item);
        }
        s.since_report += 1;
        if s.since_report >= STATS_PACKET_PERIOD {
            stats = Some(s.report(Instant::now()));
        }
    }
    for (nal, timestamp) in &nals {
        match nal.nal_type() {
            UnitType::SeqParameterSet => inner.observer.on_sps(nal),
            UnitType::PicParameterSet => inner.observer.on_pps(nal),
            _ => {}
        }
        inner.observer.on_nal(nal, *timestamp);
    }
    if let Some(stats) = stats {
        debug!("rtp stats: {stats}");
        inner.observer.on_stats(&stats);
    }
}

fn lock_state(m: &Mutex<RecvState>) -> std::sync::MutexGuard<'_, RecvState> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
