// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Groups NAL units into access units (coded pictures) and serializes them
//! as Annex-B byte-stream frames for a downstream decoder.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use h264_reader::nal::UnitType;
use log::{debug, trace, warn};
use tokio::sync::Notify;

use crate::{Error, Timeouts, WallTime};

use super::{AccessUnit, FrameType, NalUnit, VideoParameters};

/// A single frame may not exceed this; exceeding immediately finalizes
/// whatever is held.
const MAX_FRAME_BYTES: usize = 2 << 20;

/// Completed frames awaiting pull. On overflow the oldest is dropped.
const OUTPUT_QUEUE_CAP: usize = 20;

/// Callback surface of the assembler. All methods have empty defaults;
/// implement what the sink cares about. Calls are serialized.
pub trait AssemblerObserver: Send + Sync + 'static {
    /// A new (changed) SPS was cached. The parameters are the declared
    /// values, not derived from the SPS bits.
    fn on_sps_parsed(&self, params: &VideoParameters) {
        let _ = params;
    }

    /// A new (changed) PPS was cached.
    fn on_pps_parsed(&self) {}

    /// A complete access unit was finalized. The same unit is available
    /// from [`AccessUnitAssembler::pull`] until the queue overflows.
    fn on_frame(&self, frame: &AccessUnit) {
        let _ = frame;
    }

    fn on_stats(&self, stats: &AssemblerStats) {
        let _ = stats;
    }

    fn on_error(&self, error: &Error) {
        let _ = error;
    }
}

#[derive(Clone, Debug)]
pub struct AssemblerStats {
    pub frames_emitted: u64,
    pub key_frames: u64,

    /// Incomplete frames abandoned for age or discarded for malformedness.
    pub frames_discarded: u64,

    /// Finalized frames dropped because the output queue was full.
    pub queue_overflow_dropped: u64,

    /// Non-slice NAL units that arrived with no frame in progress (e.g. SEI
    /// before the first slice) and were dropped.
    pub leading_nals_dropped: u64,

    pub updated_at: WallTime,
}

impl AssemblerStats {
    fn new() -> Self {
        Self {
            frames_emitted: 0,
            key_frames: 0,
            frames_discarded: 0,
            queue_overflow_dropped: 0,
            leading_nals_dropped: 0,
            updated_at: WallTime::now(),
        }
    }
}

/// An access unit being accumulated; exists only between a starting slice
/// NAL and a frame boundary.
struct PendingFrame {
    nals: Vec<NalUnit>,
    timestamp: u32,
    started: Instant,
    bytes: usize,
    has_idr: bool,
    has_non_idr: bool,
}

impl PendingFrame {
    fn start(nal: NalUnit, timestamp: u32, now: Instant) -> Self {
        let mut f = Self {
            nals: Vec::new(),
            timestamp,
            started: now,
            bytes: 0,
            has_idr: false,
            has_non_idr: false,
        };
        f.append(nal);
        f
    }

    fn append(&mut self, nal: NalUnit) {
        self.bytes += nal.start_code_len() + nal.len();
        match nal.nal_type() {
            UnitType::SliceLayerWithoutPartitioningIdr => self.has_idr = true,
            UnitType::SliceLayerWithoutPartitioningNonIdr => self.has_non_idr = true,
            _ => {}
        }
        self.nals.push(nal);
    }
}

enum Event {
    SpsChanged,
    PpsChanged,
    Frame(AccessUnit),
}

/// The synchronous assembly logic; the public component wraps it in a
/// mutex and adds the housekeeping task.
struct State {
    current: Option<PendingFrame>,
    sps: Option<NalUnit>,
    pps: Option<NalUnit>,
    queue: VecDeque<AccessUnit>,
    stats: AssemblerStats,
    frame_timeout: Duration,
}

impl State {
    fn new(frame_timeout: Duration) -> Self {
        Self {
            current: None,
            sps: None,
            pps: None,
            queue: VecDeque::with_capacity(OUTPUT_QUEUE_CAP),
            stats: AssemblerStats::new(),
            frame_timeout,
        }
    }

    fn push(&mut self, nal: NalUnit, timestamp: u32, now: Instant, events: &mut Vec<Event>) {
        let nal_type = nal.nal_type();

        // The cache is refreshed on every parameter set, in-band repetitions
        // included; observers only hear about actual changes.
        match nal_type {
            UnitType::SeqParameterSet => {
                if self.sps.as_ref().map(NalUnit::data) != Some(nal.data()) {
                    self.sps = Some(nal.clone().with_start_code_len(4));
                    events.push(Event::SpsChanged);
                }
            }
            UnitType::PicParameterSet => {
                if self.pps.as_ref().map(NalUnit::data) != Some(nal.data()) {
                    self.pps = Some(nal.clone().with_start_code_len(4));
                    events.push(Event::PpsChanged);
                }
            }
            _ => {}
        }

        if nal_type == UnitType::AccessUnitDelimiter {
            if let Some(f) = self.current.take() {
                self.finalize(f, events);
            }
            return;
        }

        // A timestamp change is a frame boundary no matter what arrives.
        if let Some(f) = self.current.take() {
            if f.timestamp != timestamp {
                self.finalize(f, events);
            } else {
                self.current = Some(f);
            }
        }

        let is_slice = matches!(
            nal_type,
            UnitType::SliceLayerWithoutPartitioningIdr
                | UnitType::SliceLayerWithoutPartitioningNonIdr
        );
        let oversize = match &mut self.current {
            Some(f) => {
                f.append(nal);
                f.bytes > MAX_FRAME_BYTES
            }
            None if is_slice => {
                self.current = Some(PendingFrame::start(nal, timestamp, now));
                false
            }
            None => {
                trace!("dropping leading {nal_type:?} with no frame in progress");
                self.stats.leading_nals_dropped += 1;
                false
            }
        };
        if oversize {
            if let Some(f) = self.current.take() {
                warn!(
                    "frame at ts {} reached {} bytes, finalizing early",
                    f.timestamp, f.bytes
                );
                self.finalize(f, events);
            }
        }
    }

    fn finalize(&mut self, f: PendingFrame, events: &mut Vec<Event>) {
        let is_key = f.has_idr;
        let frame_type = if f.has_idr {
            FrameType::I
        } else if f.has_non_idr {
            FrameType::P
        } else {
            FrameType::Unknown
        };
        let mut nals = f.nals;
        let mut has_parameter_sets = false;
        if is_key {
            if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
                nals.insert(0, pps.clone());
                nals.insert(0, sps.clone());
                has_parameter_sets = true;
            }
        }
        let mut data =
            Vec::with_capacity(nals.iter().map(|n| n.start_code_len() + n.len()).sum());
        for nal in &nals {
            nal.write_annex_b(&mut data);
        }
        let unit = AccessUnit {
            data: data.into(),
            timestamp: f.timestamp,
            is_key,
            frame_type,
            nals,
            has_parameter_sets,
        };
        self.stats.frames_emitted += 1;
        if is_key {
            self.stats.key_frames += 1;
        }
        self.queue.push_back(unit.clone());
        if self.queue.len() > OUTPUT_QUEUE_CAP {
            self.queue.pop_front();
            self.stats.queue_overflow_dropped += 1;
        }
        events.push(Event::Frame(unit));
    }

    fn sweep(&mut self, now: Instant) {
        let stale = self
            .current
            .as_ref()
            .map(|f| now.saturating_duration_since(f.started) > self.frame_timeout)
            .unwrap_or(false);
        if stale {
            let f = self.current.take();
            debug!(
                "discarding incomplete frame at ts {} after timeout",
                f.map(|f| f.timestamp).unwrap_or(0)
            );
            self.stats.frames_discarded += 1;
        }
    }
}

struct Inner {
    state: Mutex<State>,
    observer: Arc<dyn AssemblerObserver>,
    params: VideoParameters,
    running: AtomicBool,
    shutdown: Notify,
    housekeeping: Duration,
}

/// Assembles access units from a stream of NAL units.
///
/// Feed [`AccessUnitAssembler::push_nal`] from the receiver's `on_nal`
/// callback; completed frames arrive on the observer and stay available
/// from [`AccessUnitAssembler::pull`] in a bounded queue.
#[derive(Clone)]
pub struct AccessUnitAssembler {
    inner: Arc<Inner>,
}

impl AccessUnitAssembler {
    pub fn new(
        params: VideoParameters,
        timeouts: &Timeouts,
        observer: Arc<dyn AssemblerObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::new(timeouts.frame_reassembly)),
                observer,
                params,
                running: AtomicBool::new(true),
                shutdown: Notify::new(),
                housekeeping: timeouts.housekeeping,
            }),
        }
    }

    /// The declared video parameters reported on `on_sps_parsed`.
    pub fn parameters(&self) -> VideoParameters {
        self.inner.params
    }

    /// Processes one NAL unit with its RTP timestamp.
    pub fn push_nal(&self, nal: NalUnit, timestamp: u32) {
        let mut events = Vec::new();
        {
            let mut state = lock_state(&self.inner.state);
            state.push(nal, timestamp, Instant::now(), &mut events);
        }
        self.emit(&events);
    }

    /// Seeds the SPS/PPS cache, typically from the SDP
    /// `sprop-parameter-sets` before any in-band parameter sets arrive.
    pub fn seed_parameter_sets(&self, sps: Bytes, pps: Bytes) -> Result<(), super::NalError> {
        let sps = NalUnit::new(sps, 4)?;
        let pps = NalUnit::new(pps, 4)?;
        let mut events = Vec::new();
        {
            let mut state = lock_state(&self.inner.state);
            if state.sps.as_ref().map(NalUnit::data) != Some(sps.data()) {
                state.sps = Some(sps);
                events.push(Event::SpsChanged);
            }
            if state.pps.as_ref().map(NalUnit::data) != Some(pps.data()) {
                state.pps = Some(pps);
                events.push(Event::PpsChanged);
            }
        }
        self.emit(&events);
        Ok(())
    }

    /// Takes the oldest completed access unit from the bounded queue.
    pub fn pull(&self) -> Option<AccessUnit> {
        lock_state(&self.inner.state).queue.pop_front()
    }

    pub fn stats(&self) -> AssemblerStats {
        let mut state = lock_state(&self.inner.state);
        state.stats.updated_at = WallTime::now();
        state.stats.clone()
    }

    /// Spawns the 1 s housekeeping tick: a 10 s sweep for incomplete frames
    /// and a 5 s statistics report. Must be called within a tokio runtime.
    pub fn spawn_housekeeping(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(inner.housekeeping);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut n = 0u64;
            while inner.running.load(Ordering::Relaxed) {
                tokio::select! {
                    _ = inner.shutdown.notified() => break,
                    _ = tick.tick() => {}
                }
                n += 1;
                if n % 10 == 0 {
                    lock_state(&inner.state).sweep(Instant::now());
                }
                if n % 5 == 0 {
                    let stats = {
                        let mut state = lock_state(&inner.state);
                        state.stats.updated_at = WallTime::now();
                        state.stats.clone()
                    };
                    inner.observer.on_stats(&stats);
                }
            }
        })
    }

    /// Stops the housekeeping task. Idempotent.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        self.inner.shutdown.notify_waiters();
    }

    fn emit(&self, events: &[Event]) {
        for ev in events {
            match ev {
                Event::SpsChanged => self.inner.observer.on_sps_parsed(&self.inner.params),
                Event::PpsChanged => self.inner.observer.on_pps_parsed(),
                Event::Frame(unit) => self.inner.observer.on_frame(unit),
            }
        }
    }
}

fn lock_state(m: &Mutex<State>) -> std::sync::MutexGuard<'_, State> {
    // Counters and caches stay consistent between pushes, so a poisoned
    // lock is still usable.
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Decodes the `sprop-parameter-sets` value of an SDP `a=fmtp` attribute
/// into (SPS, PPS) NAL bytes.
///
/// Some cameras (GW Security among them) leave an Annex-B start code at the
/// end of each base64 NAL; strip it so the cache compares clean bytes.
pub fn parse_sprop_parameter_sets(value: &str) -> Result<(Bytes, Bytes), String> {
    let mut sps = None;
    let mut pps = None;
    for part in value.split(',') {
        let nal = base64::decode(part.trim()).map_err(|_| "invalid base64 in sprop".to_owned())?;
        let nal = nal
            .strip_suffix(b"\x00\x00\x00\x01")
            .map(<[u8]>::to_vec)
            .unwrap_or(nal);
        if nal.is_empty() {
            return Err("empty NAL in sprop".to_owned());
        }
        match nal[0] & 0b11111 {
            7 => sps = Some(Bytes::from(nal)),
            8 => pps = Some(Bytes::from(nal)),
            t => return Err(format!("unexpected NAL type {t} in sprop")),
        }
    }
    match (sps, pps) {
        (Some(s), Some(p)) => Ok((s, p)),
        _ => Err("sprop-parameter-sets must carry one SPS and one PPS".to_owned()),
    }
}
