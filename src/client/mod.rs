// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP session controller: drives the `OPTIONS → DESCRIBE → SETUP → PLAY →
//! TEARDOWN` dialog over one TCP connection and, in interleaved mode,
//! demultiplexes `$`-framed media data from it
//! ([RFC 2326 section 10.12](https://datatracker.ietf.org/doc/html/rfc2326#section-10.12)).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpSocket;
use tokio::sync::Notify;

use crate::error::ErrorInt;
use crate::{ConnectionContext, Error, SessionConfig, Timeouts, TransportPreference};

pub mod parse;

pub use parse::{MediaDescription, SdpDescription};

use parse::{
    parse_rtp_info, parse_session, parse_transport, read_response, setup_url, ReadError, Response,
    MAX_HEADER_LINES,
};

/// Pause after an unexpected I/O error on the session socket before
/// retrying, while the session is alive.
const IO_ERROR_PAUSE: Duration = Duration::from_millis(100);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Teardown,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Teardown => "TEARDOWN",
        }
    }
}

/// Handshake progress. Terminal state on success is `Playing`; any error
/// transitions to `Closed` with an `on_error` callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    OptionsSent,
    DescribeSent,
    SetupNegotiating,
    Playing,
    Teardown,
    Closed,
}

/// Outcome of the transport negotiation ladder.
#[derive(Copy, Clone, Debug)]
pub enum NegotiatedTransport {
    TcpInterleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
    Udp {
        client_rtp: u16,
        client_rtcp: u16,
        server_rtp: Option<u16>,
        server_rtcp: Option<u16>,
    },
}

/// Callback surface of the session controller. All methods have empty
/// defaults; calls are serialized on the dialog task.
pub trait SessionObserver: Send + Sync + 'static {
    /// The TCP connection to the server is up.
    fn on_connected(&self) {}

    /// The DESCRIBE response was parsed.
    fn on_sdp(&self, sdp: &SdpDescription) {
        let _ = sdp;
    }

    /// SETUP succeeded. For UDP the ports are the local RTP/RTCP pair; for
    /// TCP interleaved they are the channel ids.
    fn on_setup_complete(&self, rtp: u16, rtcp: u16, is_tcp: bool) {
        let _ = (rtp, rtcp, is_tcp);
    }

    /// PLAY succeeded (or timed out, which servers commonly substitute for
    /// a response). Media is expected to flow after this.
    fn on_play_started(&self) {}

    /// One interleaved frame (TCP mode only). `is_rtp` is false for the
    /// RTCP channel, which is passed through unprocessed.
    fn on_interleaved_data(&self, is_rtp: bool, data: Bytes) {
        let _ = (is_rtp, data);
    }

    /// The session died. Not called after a deliberate `disconnect()`.
    fn on_error(&self, error: &Error) {
        let _ = error;
    }
}

struct Inner {
    config: SessionConfig,
    observer: Arc<dyn SessionObserver>,

    /// Next `CSeq` value, atomically incremented per request.
    cseq: AtomicU32,

    state: Mutex<SessionState>,
    transport: Mutex<Option<NegotiatedTransport>>,
    session_id: Mutex<Option<String>>,
    ssrc: Mutex<Option<u32>>,
    running: AtomicBool,
    shutdown: Notify,
}

/// One RTSP session. [`RtspSession::connect`] is fire-and-forget: it spawns
/// the dialog task and reports progress through the observer.
#[derive(Clone)]
pub struct RtspSession {
    inner: Arc<Inner>,
}

impl RtspSession {
    pub fn new(config: SessionConfig, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                observer,
                cseq: AtomicU32::new(1),
                state: Mutex::new(SessionState::Idle),
                transport: Mutex::new(None),
                session_id: Mutex::new(None),
                ssrc: Mutex::new(None),
                running: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    /// The negotiated transport, once `on_setup_complete` has fired.
    pub fn transport(&self) -> Option<NegotiatedTransport> {
        *lock(&self.inner.transport)
    }

    /// The `ssrc=` value of the SETUP Transport header, if the server sent
    /// one. Diagnostic only; the receiver latches the SSRC it observes.
    pub fn ssrc(&self) -> Option<u32> {
        *lock(&self.inner.ssrc)
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.session_id).clone()
    }

    /// Begins the handshake on a spawned task. Must be called within a
    /// tokio runtime. Calling on a non-idle session is a no-op.
    pub fn connect(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state != SessionState::Idle {
                warn!("connect() on a session in state {state:?}; ignoring");
                return;
            }
            *state = SessionState::Connecting;
        }
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        tokio::spawn(run(inner));
    }

    /// Stops the session: the dialog task sends a best-effort TEARDOWN and
    /// releases its sockets. Idempotent; repeated calls are no-ops and
    /// produce no further TEARDOWN attempts.
    pub fn disconnect(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            self.inner.shutdown.notify_one();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn set_state(inner: &Inner, state: SessionState) {
    trace!("session state -> {state:?}");
    *lock(&inner.state) = state;
}

async fn run(inner: Arc<Inner>) {
    match run_session(&inner).await {
        Ok(()) => debug!("session closed"),
        Err(e) => {
            // Suppress the callback if the application already disconnected.
            if inner.running.swap(false, Ordering::SeqCst) {
                inner.observer.on_error(&e);
            }
        }
    }
    set_state(&inner, SessionState::Closed);
}

async fn run_session(inner: &Inner) -> Result<(), Error> {
    let timeouts = inner.config.timeouts;
    let url = &inner.config.url;
    let host = url
        .host_str()
        .ok_or_else(|| wrap!(ErrorInt::InvalidArgument(format!("no host in {url}"))))?;
    let port = url.port().unwrap_or(554);

    set_state(inner, SessionState::Connecting);
    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?
        .next()
        .ok_or_else(|| {
            wrap!(ErrorInt::ConnectError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {host}"),
            )))
        })?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
    socket
        .set_keepalive(true)
        .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
    let stream = tokio::time::timeout(timeouts.connect, socket.connect(addr))
        .await
        .map_err(|_| wrap!(ErrorInt::Timeout("TCP connect")))?
        .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
    stream
        .set_nodelay(true)
        .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
    let ctx = ConnectionContext::new(
        stream
            .local_addr()
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?,
        stream
            .peer_addr()
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?,
    );
    let (rd, wr) = stream.into_split();
    let mut rd = BufReader::new(rd);
    let mut wr = wr;
    inner.observer.on_connected();

    // OPTIONS.
    set_state(inner, SessionState::OptionsSent);
    let cseq = send_request(&mut wr, &ctx, inner, Method::Options, url.as_str(), &[]).await?;
    let resp = read_reply(&mut rd, &ctx, &timeouts).await?;
    expect_ok(&resp, Method::Options, cseq, &ctx)?;

    // DESCRIBE.
    set_state(inner, SessionState::DescribeSent);
    let cseq = send_request(
        &mut wr,
        &ctx,
        inner,
        Method::Describe,
        url.as_str(),
        &[("Accept", "application/sdp".to_owned())],
    )
    .await?;
    let resp = read_reply(&mut rd, &ctx, &timeouts).await?;
    expect_ok(&resp, Method::Describe, cseq, &ctx)?;
    if resp.body.is_empty() {
        bail!(ErrorInt::RtspFramingError {
            conn_ctx: ctx,
            description: "DESCRIBE response carried no SDP".to_owned(),
        });
    }
    let content_base = resp.header("Content-Base").map(str::to_owned);
    let sdp_text = String::from_utf8_lossy(&resp.body).into_owned();
    let sdp = SdpDescription::parse(&sdp_text).map_err(|e| {
        wrap!(ErrorInt::RtspFramingError {
            conn_ctx: ctx,
            description: format!("bad SDP: {e}"),
        })
    })?;
    let video = sdp.video().cloned().ok_or_else(|| {
        wrap!(ErrorInt::RtspFramingError {
            conn_ctx: ctx,
            description: "no video media section in SDP".to_owned(),
        })
    })?;
    inner.observer.on_sdp(&sdp);

    // SETUP ladder.
    set_state(inner, SessionState::SetupNegotiating);
    let track = video.control.clone().unwrap_or_else(|| "*".to_owned());
    let target = setup_url(url, content_base.as_deref(), &track);
    debug!("SETUP target {target} (control {track:?}, base {content_base:?})");
    let (transport, session_id) = negotiate_transport(&mut rd, &mut wr, &ctx, inner, &target).await?;
    *lock(&inner.transport) = Some(transport);
    *lock(&inner.session_id) = Some(session_id.clone());
    match transport {
        NegotiatedTransport::TcpInterleaved {
            rtp_channel,
            rtcp_channel,
        } => inner.observer.on_setup_complete(
            u16::from(rtp_channel),
            u16::from(rtcp_channel),
            true,
        ),
        NegotiatedTransport::Udp {
            client_rtp,
            client_rtcp,
            ..
        } => inner
            .observer
            .on_setup_complete(client_rtp, client_rtcp, false),
    }

    // PLAY. Success outcomes: 200 OK, an empty response, or a read timeout
    // (many servers start streaming without replying).
    let cseq = send_request(
        &mut wr,
        &ctx,
        inner,
        Method::Play,
        url.as_str(),
        &[
            ("Session", session_id.clone()),
            ("Range", "npt=0.000-".to_owned()),
        ],
    )
    .await?;
    match read_response(&mut rd, timeouts.play_response, timeouts.body_read).await {
        Ok(resp) if resp.status == 200 => {
            if let Some(info) = resp.header("RTP-Info") {
                let (seq, rtptime) = parse_rtp_info(info);
                debug!("RTP-Info: seq={seq:?} rtptime={rtptime:?}");
            }
        }
        Ok(resp) => {
            bail!(response_error(&resp, Method::Play, cseq, &ctx));
        }
        Err(ReadError::Timeout) => {
            debug!(
                "no PLAY response within {:?}; assuming the server is streaming",
                timeouts.play_response
            );
        }
        Err(ReadError::Eof) => {
            // Some servers close or reset the control connection here,
            // before a UDP stream starts.
            debug!("empty PLAY response; assuming the server is streaming");
        }
        Err(e) => return Err(read_error(e, &ctx)),
    }
    set_state(inner, SessionState::Playing);
    inner.observer.on_play_started();

    playing_loop(&mut rd, &mut wr, &ctx, inner, &session_id, transport).await?;

    // Deliberate shutdown: best-effort TEARDOWN, response optional.
    set_state(inner, SessionState::Teardown);
    if send_request(
        &mut wr,
        &ctx,
        inner,
        Method::Teardown,
        url.as_str(),
        &[("Session", session_id)],
    )
    .await
    .is_ok()
    {
        let _ = read_response(&mut rd, timeouts.teardown, timeouts.teardown).await;
    }
    Ok(())
}

/// The deterministic transport negotiation ladder: TCP interleaved, then
/// each UDP candidate pair that is locally bindable, then a server-assigned
/// UDP port.
async fn negotiate_transport(
    rd: &mut BufReader<OwnedReadHalf>,
    wr: &mut OwnedWriteHalf,
    ctx: &ConnectionContext,
    inner: &Inner,
    target: &str,
) -> Result<(NegotiatedTransport, String), Error> {
    let timeouts = inner.config.timeouts;
    let pref = inner.config.preferred_transport;
    let mut attempts = 0usize;

    if pref != TransportPreference::Udp {
        attempts += 1;
        send_request(
            wr,
            ctx,
            inner,
            Method::Setup,
            target,
            &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1".to_owned())],
        )
        .await?;
        let resp = read_reply(rd, ctx, &timeouts).await?;
        if resp.status == 200 {
            let params = resp
                .header("Transport")
                .map(parse_transport)
                .unwrap_or_default();
            if let Some((rtp_channel, rtcp_channel)) = params.interleaved {
                *lock(&inner.ssrc) = params.ssrc;
                let session_id = session_from(&resp, ctx)?;
                return Ok((
                    NegotiatedTransport::TcpInterleaved {
                        rtp_channel,
                        rtcp_channel,
                    },
                    session_id,
                ));
            }
            debug!("SETUP returned 200 without interleaved channels; trying UDP");
        } else {
            debug!("TCP interleaved SETUP rejected with status {}", resp.status);
        }
    }
    if pref == TransportPreference::Tcp {
        bail!(ErrorInt::TransportExhausted {
            conn_ctx: *ctx,
            attempts,
            description: "server did not accept TCP interleaved transport".to_owned(),
        });
    }

    let mut last_offered = None;
    for &rtp_port in &inner.config.udp_port_candidates {
        if !udp_pair_available(rtp_port) {
            debug!("skipping local UDP pair {rtp_port}-{}, in use", rtp_port.saturating_add(1));
            continue;
        }
        last_offered = Some(rtp_port);
        attempts += 1;
        send_request(
            wr,
            ctx,
            inner,
            Method::Setup,
            target,
            &[(
                "Transport",
                format!("RTP/AVP;unicast;client_port={}-{}", rtp_port, rtp_port + 1),
            )],
        )
        .await?;
        let resp = read_reply(rd, ctx, &timeouts).await?;
        if resp.status != 200 {
            debug!(
                "SETUP client_port={}-{} rejected with status {}",
                rtp_port,
                rtp_port + 1,
                resp.status
            );
            continue;
        }
        let params = resp
            .header("Transport")
            .map(parse_transport)
            .unwrap_or_default();
        *lock(&inner.ssrc) = params.ssrc;
        let session_id = session_from(&resp, ctx)?;
        let (server_rtp, server_rtcp) = match params.server_port {
            Some((a, b)) => (Some(a), Some(b)),
            None => (None, None),
        };
        return Ok((
            NegotiatedTransport::Udp {
                client_rtp: rtp_port,
                client_rtcp: rtp_port + 1,
                server_rtp,
                server_rtcp,
            },
            session_id,
        ));
    }

    // Last rung: let the server pick the client ports.
    attempts += 1;
    send_request(
        wr,
        ctx,
        inner,
        Method::Setup,
        target,
        &[("Transport", "RTP/AVP;unicast".to_owned())],
    )
    .await?;
    let resp = read_reply(rd, ctx, &timeouts).await?;
    if resp.status == 200 {
        let params = resp
            .header("Transport")
            .map(parse_transport)
            .unwrap_or_default();
        *lock(&inner.ssrc) = params.ssrc;
        let session_id = session_from(&resp, ctx)?;
        let (client_rtp, client_rtcp) = match params.client_port.or_else(|| {
            // No client_port in the response: reuse the last value offered.
            last_offered.map(|p| (p, p + 1))
        }) {
            Some(pair) => pair,
            None => bail!(ErrorInt::TransportExhausted {
                conn_ctx: *ctx,
                attempts,
                description: "server assigned no client_port and no candidate was offered"
                    .to_owned(),
            }),
        };
        let (server_rtp, server_rtcp) = match params.server_port {
            Some((a, b)) => (Some(a), Some(b)),
            None => (None, None),
        };
        return Ok((
            NegotiatedTransport::Udp {
                client_rtp,
                client_rtcp,
                server_rtp,
                server_rtcp,
            },
            session_id,
        ));
    }
    bail!(ErrorInt::TransportExhausted {
        conn_ctx: *ctx,
        attempts,
        description: "every TCP and UDP transport offer was rejected".to_owned(),
    })
}

/// After PLAY: demultiplexes the session socket until shutdown. In
/// interleaved mode `$`-framed data goes to the observer; RTSP messages
/// (keepalive responses and anything unsolicited) are read and discarded in
/// both modes. Sends a keepalive `OPTIONS` on a timer.
async fn playing_loop(
    rd: &mut BufReader<OwnedReadHalf>,
    wr: &mut OwnedWriteHalf,
    ctx: &ConnectionContext,
    inner: &Inner,
    session_id: &str,
    transport: NegotiatedTransport,
) -> Result<(), Error> {
    let timeouts = inner.config.timeouts;
    let rtp_channel = match transport {
        NegotiatedTransport::TcpInterleaved { rtp_channel, .. } => Some(rtp_channel),
        NegotiatedTransport::Udp { .. } => None,
    };
    // The keepalive is checked between reads rather than raced against
    // them: cancelling a read mid-frame would desync the interleaved
    // framing. Reads block for at most the session read timeout, which
    // bounds how late a keepalive can go out.
    let mut next_keepalive = tokio::time::Instant::now() + timeouts.keepalive;
    while inner.running.load(Ordering::SeqCst) {
        if tokio::time::Instant::now() >= next_keepalive {
            next_keepalive += timeouts.keepalive;
            if let Err(e) = send_request(
                wr,
                ctx,
                inner,
                Method::Options,
                inner.config.url.as_str(),
                &[("Session", session_id.to_owned())],
            )
            .await
            {
                // The read path will notice a dead connection.
                warn!("keepalive failed: {e}");
            }
        }
        tokio::select! {
            _ = inner.shutdown.notified() => break,
            ev = read_stream_event(rd, &timeouts) => match ev {
                StreamEvent::Idle | StreamEvent::Message => {}
                StreamEvent::Frame { channel, payload } => match rtp_channel {
                    Some(rtp) => inner
                        .observer
                        .on_interleaved_data(channel == rtp, payload),
                    None => debug!(
                        "dropping {}-byte interleaved frame on channel {channel} in UDP mode",
                        payload.len()
                    ),
                },
                StreamEvent::Eof => {
                    if inner.running.load(Ordering::SeqCst) {
                        bail!(ErrorInt::RtspFramingError {
                            conn_ctx: *ctx,
                            description: "server closed the RTSP connection".to_owned(),
                        });
                    }
                    break;
                }
                StreamEvent::IoError(e) => {
                    if !inner.running.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!("session socket error: {e}; retrying");
                    tokio::time::sleep(IO_ERROR_PAUSE).await;
                }
            }
        }
    }
    Ok(())
}

enum StreamEvent {
    /// Read timeout with no data; benign.
    Idle,

    /// One interleaved frame.
    Frame { channel: u8, payload: Bytes },

    /// A complete RTSP message was read and discarded.
    Message,

    Eof,
    IoError(std::io::Error),
}

/// Reads the next thing off the session socket: an interleaved frame, or a
/// (discarded) RTSP message for any other leading byte. Never fails; error
/// conditions are encoded so the caller owns the retry policy.
async fn read_stream_event(rd: &mut BufReader<OwnedReadHalf>, timeouts: &Timeouts) -> StreamEvent {
    let first = match tokio::time::timeout(timeouts.session_read, rd.read_u8()).await {
        Err(_) => return StreamEvent::Idle,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return StreamEvent::Eof,
        Ok(Err(e)) => return StreamEvent::IoError(e),
        Ok(Ok(b)) => b,
    };
    if first == b'$' {
        let mut header = [0u8; 3];
        if let Err(ev) = read_exact_event(rd, &mut header, timeouts.session_read).await {
            return ev;
        }
        let channel = header[0];
        let len = usize::from(u16::from_be_bytes([header[1], header[2]]));
        let mut payload = vec![0u8; len];
        if let Err(ev) = read_exact_event(rd, &mut payload, timeouts.body_read).await {
            return ev;
        }
        return StreamEvent::Frame {
            channel,
            payload: payload.into(),
        };
    }
    discard_rtsp_message(rd, first, timeouts).await
}

async fn read_exact_event(
    rd: &mut BufReader<OwnedReadHalf>,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), StreamEvent> {
    match tokio::time::timeout(timeout, rd.read_exact(buf)).await {
        Err(_) => Err(StreamEvent::IoError(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out mid-frame",
        ))),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(StreamEvent::Eof),
        Ok(Err(e)) => Err(StreamEvent::IoError(e)),
        Ok(Ok(_)) => Ok(()),
    }
}

/// Consumes an RTSP message whose first byte was already read: the rest of
/// its start line, headers up to the cap, and any `Content-Length` body.
/// Keepalive responses land here, as do unsolicited server messages.
async fn discard_rtsp_message(
    rd: &mut BufReader<OwnedReadHalf>,
    first: u8,
    timeouts: &Timeouts,
) -> StreamEvent {
    let mut line = String::new();
    match tokio::time::timeout(timeouts.session_read, rd.read_line(&mut line)).await {
        Err(_) => {
            return StreamEvent::IoError(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out mid-message",
            ))
        }
        Ok(Err(e)) => return StreamEvent::IoError(e),
        Ok(Ok(0)) => return StreamEvent::Eof,
        Ok(Ok(_)) => {}
    }
    trace!(
        "in-stream RTSP message: {}{}",
        char::from(first),
        line.trim_end()
    );
    let mut content_length = 0usize;
    for _ in 0..MAX_HEADER_LINES {
        line.clear();
        match tokio::time::timeout(timeouts.session_read, rd.read_line(&mut line)).await {
            Err(_) => {
                return StreamEvent::IoError(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out mid-message",
                ))
            }
            Ok(Err(e)) => return StreamEvent::IoError(e),
            Ok(Ok(0)) => return StreamEvent::Eof,
            Ok(Ok(_)) => {}
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        if let Err(ev) = read_exact_event(rd, &mut body, timeouts.body_read).await {
            return ev;
        }
    }
    StreamEvent::Message
}

/// Builds and writes one CRLF-terminated RTSP/1.0 request, returning the
/// `CSeq` it was sent with.
async fn send_request(
    wr: &mut OwnedWriteHalf,
    ctx: &ConnectionContext,
    inner: &Inner,
    method: Method,
    url: &str,
    extra_headers: &[(&str, String)],
) -> Result<u32, Error> {
    let cseq = inner.cseq.fetch_add(1, Ordering::Relaxed);
    let mut req = format!(
        "{} {} RTSP/1.0\r\nCSeq: {}\r\nUser-Agent: {}\r\n",
        method.as_str(),
        url,
        cseq,
        inner.config.user_agent
    );
    for (name, value) in extra_headers {
        req.push_str(name);
        req.push_str(": ");
        req.push_str(value);
        req.push_str("\r\n");
    }
    req.push_str("\r\n");
    trace!("sending {} CSeq={cseq}", method.as_str());
    wr.write_all(req.as_bytes())
        .await
        .map_err(|source| wrap!(ErrorInt::WriteError {
            conn_ctx: *ctx,
            source,
        }))?;
    Ok(cseq)
}

async fn read_reply(
    rd: &mut BufReader<OwnedReadHalf>,
    ctx: &ConnectionContext,
    timeouts: &Timeouts,
) -> Result<Response, Error> {
    read_response(rd, timeouts.session_read, timeouts.body_read)
        .await
        .map_err(|e| read_error(e, ctx))
}

fn read_error(e: ReadError, ctx: &ConnectionContext) -> Error {
    match e {
        ReadError::Timeout => wrap!(ErrorInt::Timeout("RTSP response")),
        ReadError::Eof => wrap!(ErrorInt::RtspFramingError {
            conn_ctx: *ctx,
            description: "EOF while waiting for a response".to_owned(),
        }),
        ReadError::Io(source) => wrap!(ErrorInt::ReadError {
            conn_ctx: *ctx,
            source,
        }),
        ReadError::Malformed(description) => wrap!(ErrorInt::RtspFramingError {
            conn_ctx: *ctx,
            description,
        }),
    }
}

fn response_error(
    resp: &Response,
    method: Method,
    cseq: u32,
    ctx: &ConnectionContext,
) -> ErrorInt {
    ErrorInt::RtspResponseError {
        conn_ctx: *ctx,
        method: method.as_str(),
        cseq,
        status: resp.status,
        description: format!("expected 200 OK, got {} {}", resp.status, resp.reason),
    }
}

fn expect_ok(
    resp: &Response,
    method: Method,
    cseq: u32,
    ctx: &ConnectionContext,
) -> Result<(), Error> {
    if resp.status != 200 {
        bail!(response_error(resp, method, cseq, ctx));
    }
    Ok(())
}

fn session_from(resp: &Response, ctx: &ConnectionContext) -> Result<String, Error> {
    let id = resp.header("Session").map(parse_session).unwrap_or_default();
    if id.is_empty() {
        bail!(ErrorInt::RtspFramingError {
            conn_ctx: *ctx,
            description: "SETUP response carried no Session header".to_owned(),
        });
    }
    Ok(id)
}

/// Probes a local RTP/RTCP pair by temporarily binding both ports.
fn udp_pair_available(rtp_port: u16) -> bool {
    let rtcp_port = match rtp_port.checked_add(1) {
        Some(p) => p,
        None => return false,
    };
    let rtp = std::net::UdpSocket::bind(("0.0.0.0", rtp_port));
    let rtcp = std::net::UdpSocket::bind(("0.0.0.0", rtcp_port));
    matches!((rtp, rtcp), (Ok(_), Ok(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_render() {
        assert_eq!(Method::Options.as_str(), "OPTIONS");
        assert_eq!(Method::Teardown.as_str(), "TEARDOWN");
    }

    #[test]
    fn udp_probe_detects_bound_port() {
        // Hold a pair, then probe it.
        let a = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = a.local_addr().unwrap().port();
        assert!(!udp_pair_available(port));
        drop(a);
        assert!(!udp_pair_available(u16::MAX));
    }
}
