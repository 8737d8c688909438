// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scenarios against an in-process mock RTSP server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;

use rtsp_ingest::client::{RtspSession, SdpDescription, SessionObserver};
use rtsp_ingest::codec::NalUnit;
use rtsp_ingest::receiver::{ReceiverObserver, RtpReceiver};
use rtsp_ingest::{Error, SessionConfig, Timeouts};

const SDP: &str = "v=0\r\n\
                   o=- 0 0 IN IP4 127.0.0.1\r\n\
                   s=mock\r\n\
                   m=video 0 RTP/AVP 97\r\n\
                   a=control:trackID=1\r\n";

fn test_timeouts() -> Timeouts {
    Timeouts {
        connect: Duration::from_secs(2),
        session_read: Duration::from_secs(2),
        body_read: Duration::from_secs(2),
        play_response: Duration::from_secs(2),
        teardown: Duration::from_millis(200),
        ..Timeouts::default()
    }
}

struct Request {
    method: String,
    transport: Option<String>,
}

async fn read_request(rd: &mut BufReader<OwnedReadHalf>) -> Option<Request> {
    let mut line = String::new();
    loop {
        line.clear();
        if rd.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    let method = line.split_whitespace().next()?.to_owned();
    let mut transport = None;
    loop {
        line.clear();
        if rd.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Transport") {
                transport = Some(value.trim().to_owned());
            }
        }
    }
    Some(Request { method, transport })
}

async fn respond(wr: &mut OwnedWriteHalf, status: &str, headers: &[(&str, String)], body: &str) {
    let mut resp = format!("RTSP/1.0 {status}\r\n");
    for (name, value) in headers {
        resp.push_str(&format!("{name}: {value}\r\n"));
    }
    if !body.is_empty() {
        resp.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    resp.push_str("\r\n");
    resp.push_str(body);
    wr.write_all(resp.as_bytes()).await.unwrap();
}

fn rtp_packet(seq: u16, timestamp: u32, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0x80, 0x61]; // version 2, payload type 97.
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(&timestamp.to_be_bytes());
    pkt.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

fn interleaved_frame(channel: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x24, channel];
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[derive(Debug)]
enum Event {
    Connected,
    Sdp(usize),
    Setup(u16, u16, bool),
    Play,
    Error(String),
}

/// Session observer that reports milestones on a channel and, when
/// constructed with a receiver, wires interleaved data into it.
struct Wire {
    events: mpsc::UnboundedSender<Event>,
    receiver: Option<RtpReceiver>,
}

impl SessionObserver for Wire {
    fn on_connected(&self) {
        let _ = self.events.send(Event::Connected);
    }
    fn on_sdp(&self, sdp: &SdpDescription) {
        let _ = self.events.send(Event::Sdp(sdp.media.len()));
    }
    fn on_setup_complete(&self, rtp: u16, rtcp: u16, is_tcp: bool) {
        let _ = self.events.send(Event::Setup(rtp, rtcp, is_tcp));
    }
    fn on_play_started(&self) {
        let _ = self.events.send(Event::Play);
    }
    fn on_interleaved_data(&self, is_rtp: bool, data: Bytes) {
        if let Some(receiver) = &self.receiver {
            receiver.push_interleaved(is_rtp, data);
        }
    }
    fn on_error(&self, error: &Error) {
        let _ = self.events.send(Event::Error(error.to_string()));
    }
}

struct NalSink {
    nals: mpsc::UnboundedSender<(Bytes, u32)>,
}

impl ReceiverObserver for NalSink {
    fn on_nal(&self, nal: &NalUnit, timestamp: u32) {
        let _ = self.nals.send((nal.to_annex_b(), timestamp));
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Scenario: TCP interleaved happy path. OPTIONS/DESCRIBE/SETUP/PLAY all
/// succeed, then the server pushes a single-NAL packet and an FU-A
/// sequence over channel 0.
#[tokio::test]
async fn tcp_interleaved_happy_path() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let teardowns = Arc::new(AtomicUsize::new(0));
    let server_teardowns = teardowns.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        while let Some(req) = read_request(&mut rd).await {
            match req.method.as_str() {
                "OPTIONS" => {
                    respond(
                        &mut wr,
                        "200 OK",
                        &[("Public", "DESCRIBE, SETUP, PLAY, TEARDOWN".to_owned())],
                        "",
                    )
                    .await
                }
                "DESCRIBE" => {
                    respond(
                        &mut wr,
                        "200 OK",
                        &[
                            ("Content-Type", "application/sdp".to_owned()),
                            ("Content-Base", format!("rtsp://{addr}/cam/")),
                        ],
                        SDP,
                    )
                    .await
                }
                "SETUP" => {
                    assert!(req
                        .transport
                        .as_deref()
                        .unwrap_or_default()
                        .contains("interleaved=0-1"));
                    respond(
                        &mut wr,
                        "200 OK",
                        &[
                            ("Session", "12345678;timeout=60".to_owned()),
                            (
                                "Transport",
                                "RTP/AVP/TCP;unicast;interleaved=0-1;ssrc=DEADBEEF".to_owned(),
                            ),
                        ],
                        "",
                    )
                    .await
                }
                "PLAY" => {
                    respond(&mut wr, "200 OK", &[("Session", "12345678".to_owned())], "").await;
                    // One single-NAL packet...
                    let pkt = rtp_packet(1, 100, b"\x65\xAA");
                    assert_eq!(pkt.len(), 14);
                    wr.write_all(&interleaved_frame(0, &pkt)).await.unwrap();
                    // ...an RTCP message on channel 1 (passed through)...
                    wr.write_all(&interleaved_frame(1, &[0x80, 0xC8, 0, 1]))
                        .await
                        .unwrap();
                    // ...and an FU-A sequence.
                    for (seq, payload) in [
                        (2u16, &b"\x7C\x85\xAA\xBB"[..]),
                        (3, &b"\x7C\x05\xCC"[..]),
                        (4, &b"\x7C\x45\xDD\xEE"[..]),
                    ] {
                        let pkt = rtp_packet(seq, 200, payload);
                        wr.write_all(&interleaved_frame(0, &pkt)).await.unwrap();
                    }
                }
                "TEARDOWN" => {
                    server_teardowns.fetch_add(1, Ordering::SeqCst);
                    respond(&mut wr, "200 OK", &[], "").await;
                }
                other => panic!("unexpected method {other}"),
            }
        }
    });

    let (nal_tx, mut nal_rx) = mpsc::unbounded_channel();
    let receiver = RtpReceiver::new(97, test_timeouts(), Arc::new(NalSink { nals: nal_tx }));
    receiver.start_interleaved();

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let url = Url::parse(&format!("rtsp://{addr}/cam")).unwrap();
    let mut config = SessionConfig::new(url).unwrap();
    config.payload_type = 97;
    config.timeouts = test_timeouts();
    let session = RtspSession::new(
        config,
        Arc::new(Wire {
            events: ev_tx,
            receiver: Some(receiver.clone()),
        }),
    );
    session.connect();

    assert!(matches!(next_event(&mut ev_rx).await, Event::Connected));
    assert!(matches!(next_event(&mut ev_rx).await, Event::Sdp(1)));
    match next_event(&mut ev_rx).await {
        Event::Setup(0, 1, true) => {}
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(next_event(&mut ev_rx).await, Event::Play));

    let (nal, timestamp) = tokio::time::timeout(Duration::from_secs(5), nal_rx.recv())
        .await
        .expect("timed out waiting for NAL")
        .unwrap();
    assert_eq!(&nal[..], b"\x00\x00\x00\x01\x65\xAA");
    assert_eq!(timestamp, 100);

    let (nal, timestamp) = tokio::time::timeout(Duration::from_secs(5), nal_rx.recv())
        .await
        .expect("timed out waiting for reassembled NAL")
        .unwrap();
    assert_eq!(&nal[..], b"\x00\x00\x00\x01\x65\xAA\xBB\xCC\xDD\xEE");
    assert_eq!(timestamp, 200);

    assert_eq!(session.session_id().as_deref(), Some("12345678"));
    assert_eq!(session.ssrc(), Some(0xDEAD_BEEF));

    session.disconnect();
    receiver.stop();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

/// Scenario: the server rejects TCP interleaved and client_port=6000-6001
/// with 461 Unsupported Transport, then accepts 7000-7001.
#[tokio::test]
async fn udp_port_fallback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        while let Some(req) = read_request(&mut rd).await {
            match req.method.as_str() {
                "OPTIONS" => respond(&mut wr, "200 OK", &[], "").await,
                "DESCRIBE" => {
                    respond(
                        &mut wr,
                        "200 OK",
                        &[("Content-Type", "application/sdp".to_owned())],
                        SDP,
                    )
                    .await
                }
                "SETUP" => {
                    let transport = req.transport.clone().unwrap_or_default();
                    if transport.contains("client_port=7000-7001") {
                        respond(
                            &mut wr,
                            "200 OK",
                            &[
                                ("Session", "99".to_owned()),
                                (
                                    "Transport",
                                    "RTP/AVP;unicast;client_port=7000-7001;server_port=6970-6971"
                                        .to_owned(),
                                ),
                            ],
                            "",
                        )
                        .await;
                    } else {
                        respond(&mut wr, "461 Unsupported Transport", &[], "").await;
                    }
                }
                "PLAY" => {
                    respond(&mut wr, "200 OK", &[("Session", "99".to_owned())], "").await
                }
                "TEARDOWN" => respond(&mut wr, "200 OK", &[], "").await,
                other => panic!("unexpected method {other}"),
            }
        }
    });

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let url = Url::parse(&format!("rtsp://{addr}/cam")).unwrap();
    let mut config = SessionConfig::new(url).unwrap();
    config.payload_type = 97;
    config.timeouts = test_timeouts();
    let session = RtspSession::new(
        config,
        Arc::new(Wire {
            events: ev_tx,
            receiver: None,
        }),
    );
    session.connect();

    assert!(matches!(next_event(&mut ev_rx).await, Event::Connected));
    assert!(matches!(next_event(&mut ev_rx).await, Event::Sdp(1)));
    let mut setups = 0;
    loop {
        match next_event(&mut ev_rx).await {
            Event::Setup(rtp, rtcp, is_tcp) => {
                setups += 1;
                assert_eq!((rtp, rtcp, is_tcp), (7000, 7001, false));
            }
            Event::Play => break,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(setups, 1, "setup-complete must fire exactly once");
    session.disconnect();
}

/// Scenario: the server negotiates UDP, then closes the control connection
/// immediately after PLAY without sending a byte. The empty response is a
/// success outcome; only the later loss of the connection while streaming
/// is an error.
#[tokio::test]
async fn play_empty_response_is_success() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        while let Some(req) = read_request(&mut rd).await {
            match req.method.as_str() {
                "OPTIONS" => respond(&mut wr, "200 OK", &[], "").await,
                "DESCRIBE" => {
                    respond(
                        &mut wr,
                        "200 OK",
                        &[("Content-Type", "application/sdp".to_owned())],
                        SDP,
                    )
                    .await
                }
                "SETUP" => {
                    let transport = req.transport.clone().unwrap_or_default();
                    if transport.contains("RTP/AVP/TCP") {
                        respond(&mut wr, "461 Unsupported Transport", &[], "").await;
                    } else {
                        respond(
                            &mut wr,
                            "200 OK",
                            &[
                                ("Session", "777".to_owned()),
                                ("Transport", format!("{transport};server_port=6970-6971")),
                            ],
                            "",
                        )
                        .await;
                    }
                }
                "PLAY" => {
                    // Close the control connection with zero response bytes.
                    return;
                }
                other => panic!("unexpected method {other}"),
            }
        }
    });

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let url = Url::parse(&format!("rtsp://{addr}/cam")).unwrap();
    let mut config = SessionConfig::new(url).unwrap();
    config.payload_type = 97;
    config.timeouts = test_timeouts();
    let session = RtspSession::new(
        config,
        Arc::new(Wire {
            events: ev_tx,
            receiver: None,
        }),
    );
    session.connect();

    assert!(matches!(next_event(&mut ev_rx).await, Event::Connected));
    assert!(matches!(next_event(&mut ev_rx).await, Event::Sdp(1)));
    match next_event(&mut ev_rx).await {
        Event::Setup(_, _, false) => {}
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(next_event(&mut ev_rx).await, Event::Play));

    // The dead connection is still noticed once streaming is underway.
    match next_event(&mut ev_rx).await {
        Event::Error(msg) => assert!(msg.contains("closed"), "unexpected error {msg:?}"),
        other => panic!("unexpected event {other:?}"),
    }
}

/// Scenario: the server never answers PLAY. After the (shortened) PLAY
/// timeout the controller assumes success and starts the interleaved loop.
/// Also: repeated disconnect() produces exactly one TEARDOWN.
#[tokio::test]
async fn play_timeout_is_success_and_teardown_is_idempotent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let teardowns = Arc::new(AtomicUsize::new(0));
    let server_teardowns = teardowns.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        while let Some(req) = read_request(&mut rd).await {
            match req.method.as_str() {
                "OPTIONS" => respond(&mut wr, "200 OK", &[], "").await,
                "DESCRIBE" => {
                    respond(
                        &mut wr,
                        "200 OK",
                        &[("Content-Type", "application/sdp".to_owned())],
                        SDP,
                    )
                    .await
                }
                "SETUP" => {
                    respond(
                        &mut wr,
                        "200 OK",
                        &[
                            ("Session", "31337".to_owned()),
                            (
                                "Transport",
                                "RTP/AVP/TCP;unicast;interleaved=0-1".to_owned(),
                            ),
                        ],
                        "",
                    )
                    .await
                }
                "PLAY" => {
                    // Deliberately no response: the stream "just starts".
                    wr.write_all(&interleaved_frame(0, &rtp_packet(1, 50, b"\x41\x01")))
                        .await
                        .unwrap();
                }
                "TEARDOWN" => {
                    server_teardowns.fetch_add(1, Ordering::SeqCst);
                    respond(&mut wr, "200 OK", &[], "").await;
                }
                other => panic!("unexpected method {other}"),
            }
        }
    });

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let url = Url::parse(&format!("rtsp://{addr}/cam")).unwrap();
    let mut config = SessionConfig::new(url).unwrap();
    config.payload_type = 97;
    config.timeouts = Timeouts {
        play_response: Duration::from_millis(300),
        ..test_timeouts()
    };
    let session = RtspSession::new(
        config,
        Arc::new(Wire {
            events: ev_tx,
            receiver: None,
        }),
    );
    session.connect();

    assert!(matches!(next_event(&mut ev_rx).await, Event::Connected));
    assert!(matches!(next_event(&mut ev_rx).await, Event::Sdp(1)));
    assert!(matches!(next_event(&mut ev_rx).await, Event::Setup(0, 1, true)));
    assert!(matches!(next_event(&mut ev_rx).await, Event::Play));

    session.disconnect();
    session.disconnect();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    session.disconnect();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}
