// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client-side RTSP/RTP ingestion of live H.264 video.
//!
//! This crate pulls an H.264 elementary stream from an RTSP/1.0 server and
//! hands complete Annex-B access units to a caller-supplied sink. It is built
//! from three components, wired together through narrow observer traits:
//!
//! *   [`client::RtspSession`] drives the `OPTIONS → DESCRIBE → SETUP → PLAY →
//!     TEARDOWN` dialog, negotiates the transport (TCP interleaved first, then
//!     a ladder of UDP port pairs), and demultiplexes interleaved data.
//! *   [`receiver::RtpReceiver`] validates RTP packets from either a UDP
//!     socket or the interleaved stream, tracks loss/reorder/jitter
//!     statistics, and reassembles fragmented (FU-A) NAL units.
//! *   [`codec::access_unit::AccessUnitAssembler`] groups NAL units into
//!     frames, classifies them, and prepends cached SPS/PPS to key frames so
//!     a downstream decoder can initialize mid-stream.
//!
//! The session controller knows nothing about RTP and the receiver knows
//! nothing about RTSP; the application owns the wiring. A typical TCP
//! interleaved setup forwards `on_interleaved_data` into
//! [`receiver::RtpReceiver::push_interleaved`] and `on_nal` into
//! [`codec::access_unit::AccessUnitAssembler::push_nal`].

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Duration;

use url::Url;

mod error;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod client;
pub mod codec;
pub mod receiver;
pub mod rtp;

/// A wall time taken from the local machine's realtime clock, used in
/// statistics and error reporting.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    pub(crate) fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T%.3f"))
    }
}

/// RTSP connection context, carried in errors.
///
/// This gives enough information to pick out the flow in a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    pub(crate) fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            established_wall: WallTime::now(),
        }
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// Preferred media transport for the `SETUP` negotiation ladder.
///
/// `Auto` tries TCP interleaved first and falls back to the UDP port
/// candidates; `Tcp` and `Udp` restrict negotiation to one family and fail
/// if it is exhausted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportPreference {
    Auto,
    Tcp,
    Udp,
}

impl Default for TransportPreference {
    fn default() -> Self {
        TransportPreference::Auto
    }
}

impl Display for TransportPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportPreference::Auto => f.pad("auto"),
            TransportPreference::Tcp => f.pad("tcp"),
            TransportPreference::Udp => f.pad("udp"),
        }
    }
}

impl std::str::FromStr for TransportPreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "auto" => TransportPreference::Auto,
            "tcp" => TransportPreference::Tcp,
            "udp" => TransportPreference::Udp,
            _ => bail!(crate::error::ErrorInt::InvalidArgument(format!(
                "transport preference {s:?} not understood"
            ))),
        })
    }
}

/// Default RTP port candidates tried in order during UDP negotiation.
/// Each entry is an RTP port; the matching RTCP port is one higher.
pub const DEFAULT_UDP_PORT_CANDIDATES: [u16; 4] = [6000, 7000, 8000, 5004];

/// Default `User-Agent` header value.
pub const DEFAULT_USER_AGENT: &str = "Universal-RTSP-Client/1.0";

/// Every timeout in the pipeline, with the defaults the components were
/// tuned against. Tests shrink these to run scenarios in milliseconds.
#[derive(Copy, Clone, Debug)]
pub struct Timeouts {
    /// TCP connect to the RTSP server.
    pub connect: Duration,

    /// Per-line read on the RTSP session socket.
    pub session_read: Duration,

    /// Budget for reading a `Content-Length` body.
    pub body_read: Duration,

    /// Wait for the `PLAY` response. Elapsing is treated as success; many
    /// servers begin streaming without replying.
    pub play_response: Duration,

    /// Single `recv` on the RTP UDP socket. Elapsing is a normal idle
    /// indicator; five consecutive elapses produce a starvation warning.
    pub udp_receive: Duration,

    /// Age at which an in-progress FU-A reassembly is abandoned.
    pub fragment_reassembly: Duration,

    /// Age at which an incomplete access unit is abandoned.
    pub frame_reassembly: Duration,

    /// Housekeeping tick driving sweeps and statistics reports.
    pub housekeeping: Duration,

    /// In-session keepalive period (`OPTIONS` with the `Session` header).
    pub keepalive: Duration,

    /// Wait for the best-effort `TEARDOWN` response before closing anyway.
    pub teardown: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            session_read: Duration::from_secs(10),
            body_read: Duration::from_secs(10),
            play_response: Duration::from_secs(10),
            udp_receive: Duration::from_secs(5),
            fragment_reassembly: Duration::from_secs(5),
            frame_reassembly: Duration::from_secs(5),
            housekeeping: Duration::from_secs(1),
            keepalive: Duration::from_secs(30),
            teardown: Duration::from_secs(2),
        }
    }
}

/// Configuration for one [`client::RtspSession`].
///
/// There is no CLI and no environment lookup; everything the pipeline needs
/// arrives here.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// The `rtsp://` URL of the presentation.
    pub url: Url,

    /// Expected RTP payload type; packets with any other type are silently
    /// dropped by the receiver. Dynamic types 96–127 are typical.
    pub payload_type: u8,

    pub preferred_transport: TransportPreference,

    /// RTP ports to probe and offer, in order, before letting the server
    /// assign one. RTCP is the next higher port.
    pub udp_port_candidates: Vec<u16>,

    pub timeouts: Timeouts,

    pub user_agent: String,
}

impl SessionConfig {
    /// Creates a config with the crate defaults for the given URL.
    pub fn new(url: Url) -> Result<Self, Error> {
        if url.scheme() != "rtsp" {
            bail!(crate::error::ErrorInt::InvalidArgument(format!(
                "only rtsp:// urls are supported, got {url}"
            )));
        }
        if url.host_str().is_none() {
            bail!(crate::error::ErrorInt::InvalidArgument(format!(
                "must specify host in rtsp url {url}"
            )));
        }
        Ok(Self {
            url,
            payload_type: 96,
            preferred_transport: TransportPreference::Auto,
            udp_port_candidates: DEFAULT_UDP_PORT_CANDIDATES.to_vec(),
            timeouts: Timeouts::default(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_non_rtsp() {
        let url = Url::parse("http://example.com/stream").unwrap();
        assert!(SessionConfig::new(url).is_err());
    }

    #[test]
    fn config_defaults() {
        let url = Url::parse("rtsp://cam.example.com/live").unwrap();
        let config = SessionConfig::new(url).unwrap();
        assert_eq!(config.payload_type, 96);
        assert_eq!(config.preferred_transport, TransportPreference::Auto);
        assert_eq!(config.udp_port_candidates, &[6000, 7000, 8000, 5004]);
    }

    #[test]
    fn transport_preference_round_trip() {
        for p in ["auto", "tcp", "udp"] {
            let parsed: TransportPreference = p.parse().unwrap();
            assert_eq!(parsed.to_string(), p);
        }
        assert!("multicast".parse::<TransportPreference>().is_err());
    }
}
