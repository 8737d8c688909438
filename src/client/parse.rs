// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP response reading and the text formats around it: `Transport` and
//! `Session` headers, the SDP subset this client consumes, and SETUP-URL
//! construction.

use std::time::Duration;

use bytes::Bytes;
use log::debug;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use url::Url;

/// Responses with more header lines than this are rejected.
pub(crate) const MAX_HEADER_LINES: usize = 50;

/// A parsed RTSP/1.0 response.
#[derive(Debug)]
pub(crate) struct Response {
    pub(crate) status: u16,
    pub(crate) reason: String,
    headers: Vec<(String, String)>,
    pub(crate) body: Bytes,
}

impl Response {
    /// Case-insensitive header lookup; returns the first match.
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Why a response could not be read. The caller attaches connection context
/// when converting to [`crate::Error`].
#[derive(Debug)]
pub(crate) enum ReadError {
    /// No bytes within the read timeout. On `PLAY` this is success.
    Timeout,

    /// Peer closed the connection.
    Eof,

    Io(std::io::Error),

    Malformed(String),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Timeout => f.pad("read timeout"),
            ReadError::Eof => f.pad("unexpected EOF"),
            ReadError::Io(e) => write!(f, "I/O error: {e}"),
            ReadError::Malformed(msg) => write!(f, "malformed response: {msg}"),
        }
    }
}

/// Reads one RTSP response: a status line, up to [`MAX_HEADER_LINES`] header
/// lines terminated by a blank line, then exactly `Content-Length` bytes of
/// body. Line-oriented, so responses split across TCP segments reassemble
/// naturally.
pub(crate) async fn read_response<R: AsyncBufRead + Unpin>(
    rd: &mut R,
    line_timeout: Duration,
    body_timeout: Duration,
) -> Result<Response, ReadError> {
    // Tolerate stray CRLFs before the status line; some servers emit them
    // between messages.
    let mut status_line = read_line(rd, line_timeout).await?;
    let mut skipped = 0;
    while status_line.is_empty() {
        skipped += 1;
        if skipped > MAX_HEADER_LINES {
            return Err(ReadError::Malformed("only blank lines".to_owned()));
        }
        status_line = read_line(rd, line_timeout).await?;
    }
    let (status, reason) = parse_status_line(&status_line)?;

    let mut headers = Vec::new();
    loop {
        if headers.len() > MAX_HEADER_LINES {
            return Err(ReadError::Malformed(format!(
                "more than {MAX_HEADER_LINES} header lines"
            )));
        }
        let line = read_line(rd, line_timeout).await?;
        if line.is_empty() {
            break;
        }
        match line.split_once(':') {
            Some((name, value)) => headers.push((name.trim().to_owned(), value.trim().to_owned())),
            None => return Err(ReadError::Malformed(format!("header line {line:?}"))),
        }
    }

    let content_length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
        .map(|(_, v)| {
            v.parse::<usize>()
                .map_err(|_| ReadError::Malformed(format!("Content-Length {v:?}")))
        })
        .transpose()?
        .unwrap_or(0);
    let body = if content_length > 0 {
        let mut body = vec![0u8; content_length];
        match tokio::time::timeout(body_timeout, rd.read_exact(&mut body)).await {
            Err(_) => return Err(ReadError::Timeout),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ReadError::Eof)
            }
            Ok(Err(e)) => return Err(ReadError::Io(e)),
            Ok(Ok(_)) => {}
        }
        Bytes::from(body)
    } else {
        Bytes::new()
    };
    Ok(Response {
        status,
        reason,
        headers,
        body,
    })
}

async fn read_line<R: AsyncBufRead + Unpin>(
    rd: &mut R,
    timeout: Duration,
) -> Result<String, ReadError> {
    let mut line = String::new();
    match tokio::time::timeout(timeout, rd.read_line(&mut line)).await {
        Err(_) => Err(ReadError::Timeout),
        Ok(Ok(0)) => Err(ReadError::Eof),
        Ok(Ok(_)) => {
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            Ok(line)
        }
        Ok(Err(e)) => Err(ReadError::Io(e)),
    }
}

fn parse_status_line(line: &str) -> Result<(u16, String), ReadError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("RTSP/") {
        return Err(ReadError::Malformed(format!("status line {line:?}")));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| ReadError::Malformed(format!("status line {line:?}")))?;
    Ok((status, parts.next().unwrap_or_default().to_owned()))
}

/// Parameters of a `Transport` response header, RFC 2326 section 12.39.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TransportParams {
    pub(crate) is_tcp: bool,
    pub(crate) interleaved: Option<(u8, u8)>,
    pub(crate) client_port: Option<(u16, u16)>,
    pub(crate) server_port: Option<(u16, u16)>,
    pub(crate) ssrc: Option<u32>,
}

pub(crate) fn parse_transport(value: &str) -> TransportParams {
    let mut params = TransportParams::default();
    for part in value.split(';') {
        let part = part.trim();
        if part.eq_ignore_ascii_case("RTP/AVP/TCP") {
            params.is_tcp = true;
        } else if let Some(v) = part.strip_prefix("interleaved=") {
            params.interleaved = parse_pair(v).map(|(a, b)| (a as u8, b as u8));
        } else if let Some(v) = part.strip_prefix("client_port=") {
            params.client_port = parse_pair(v);
        } else if let Some(v) = part.strip_prefix("server_port=") {
            params.server_port = parse_pair(v);
        } else if let Some(v) = part.strip_prefix("ssrc=") {
            params.ssrc = u32::from_str_radix(v, 16).ok();
        }
    }
    params
}

/// Parses `a-b`; a lone `a` implies `a-(a+1)`.
fn parse_pair(v: &str) -> Option<(u16, u16)> {
    match v.split_once('-') {
        Some((a, b)) => {
            let a: u16 = a.trim().parse().ok()?;
            let b = b.trim().parse().unwrap_or(a.wrapping_add(1));
            Some((a, b))
        }
        None => {
            let a: u16 = v.trim().parse().ok()?;
            Some((a, a.wrapping_add(1)))
        }
    }
}

/// Extracts the session id from a `Session` header, stripping the
/// `;timeout=` suffix some servers append.
pub(crate) fn parse_session(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_owned()
}

/// Pulls `seq` and `rtptime` out of the first stream of an `RTP-Info`
/// header. Informational only; absence is tolerated.
pub(crate) fn parse_rtp_info(value: &str) -> (Option<u32>, Option<u32>) {
    let first = value.split(',').next().unwrap_or_default();
    let mut seq = None;
    let mut rtptime = None;
    for part in first.split(';') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("seq=") {
            seq = v.parse().ok();
        } else if let Some(v) = part.strip_prefix("rtptime=") {
            rtptime = v.parse().ok();
        }
    }
    (seq, rtptime)
}

/// The SDP subset this client consumes, RFC 4566.
#[derive(Clone, Debug)]
pub struct SdpDescription {
    pub media: Vec<MediaDescription>,
}

/// One `m=` section and the attributes applied to it.
#[derive(Clone, Debug)]
pub struct MediaDescription {
    /// `video`, `audio`, `application`, ...
    pub kind: String,

    /// The first format listed on the `m=` line.
    pub payload_type: u8,

    /// The `a=control` attribute, if present. A missing control on the
    /// video section is treated as `*` by the session controller.
    pub control: Option<String>,

    /// SPS and PPS NALs decoded from `a=fmtp` `sprop-parameter-sets`,
    /// usable to seed the assembler cache.
    pub parameter_sets: Option<(Bytes, Bytes)>,
}

impl SdpDescription {
    pub fn parse(text: &str) -> Result<Self, String> {
        if text.trim().is_empty() {
            return Err("empty SDP".to_owned());
        }
        let mut media: Vec<MediaDescription> = Vec::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(m) = line.strip_prefix("m=") {
                let mut parts = m.split_whitespace();
                let kind = parts.next().unwrap_or_default().to_owned();
                let _port = parts.next();
                let _proto = parts.next();
                let payload_type = match parts.next().and_then(|f| f.parse().ok()) {
                    Some(pt) => pt,
                    None => {
                        debug!("skipping m= line without a numeric format: {line:?}");
                        continue;
                    }
                };
                media.push(MediaDescription {
                    kind,
                    payload_type,
                    control: None,
                    parameter_sets: None,
                });
            } else if let Some(control) = line.strip_prefix("a=control:") {
                // Applies to the most recent m= section; a session-level
                // control before any media is not needed here.
                if let Some(m) = media.last_mut() {
                    m.control = Some(control.trim().to_owned());
                }
            } else if let Some(fmtp) = line.strip_prefix("a=fmtp:") {
                let (pt, params) = match fmtp.split_once(' ') {
                    Some(x) => x,
                    None => continue,
                };
                let matches_last = media
                    .last()
                    .map(|m| pt.trim().parse() == Ok(m.payload_type))
                    .unwrap_or(false);
                if !matches_last {
                    continue;
                }
                for param in params.split(';') {
                    if let Some((key, value)) = param.trim().split_once('=') {
                        if key == "sprop-parameter-sets" {
                            match crate::codec::access_unit::parse_sprop_parameter_sets(value) {
                                Ok(sets) => {
                                    if let Some(m) = media.last_mut() {
                                        m.parameter_sets = Some(sets);
                                    }
                                }
                                Err(e) => debug!("ignoring bad sprop-parameter-sets: {e}"),
                            }
                        }
                    }
                }
            }
        }
        Ok(Self { media })
    }

    /// The first video section, if any.
    pub fn video(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.kind == "video")
    }
}

/// Builds the absolute URL for a `SETUP` request from the control attribute
/// and the optional `Content-Base` of the DESCRIBE response.
pub(crate) fn setup_url(rtsp_url: &Url, content_base: Option<&str>, track: &str) -> String {
    if track.starts_with("rtsp://") {
        return track.to_owned();
    }
    if track == "*" {
        return rtsp_url.as_str().to_owned();
    }
    if track.starts_with('/') {
        let base = match content_base {
            Some(b) => b.trim_end_matches('/').to_owned(),
            None => {
                let host = rtsp_url.host_str().unwrap_or_default();
                let port = rtsp_url.port().unwrap_or(554);
                format!("rtsp://{host}:{port}")
            }
        };
        return format!("{base}{track}");
    }
    let base = content_base.unwrap_or_else(|| rtsp_url.as_str());
    format!("{}/{}", base.trim_end_matches('/'), track)
}
