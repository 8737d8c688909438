// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc, time::Duration};

use crate::{ConnectionContext, WallTime};
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages; in most cases they have
/// enough information to find the offending exchange in a packet capture.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the RTSP status code, if the error was generated from a
    /// response.
    pub fn status_code(&self) -> Option<u16> {
        match self.0.as_ref() {
            ErrorInt::RtspResponseError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true for conditions that do not terminate the session, such
    /// as the UDP starvation warning. Everything else is fatal.
    pub fn is_transient(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInt::RtpIdle { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    /// Unparseable or unexpected RTSP message.
    #[error("RTSP framing error: {description}\n\nconn: {conn_ctx}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("{status} response to {method} CSeq={cseq}: {description}\n\nconn: {conn_ctx}")]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        method: &'static str,
        cseq: u32,
        status: u16,
        description: String,
    },

    #[error(
        "Transport negotiation exhausted after {attempts} SETUP attempt(s): \
         {description}\n\nconn: {conn_ctx}"
    )]
    TransportExhausted {
        conn_ctx: ConnectionContext,
        attempts: usize,
        description: String,
    },

    #[error("Unable to bind UDP port {port}: {source}")]
    UdpBindError {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Error receiving UDP packet: {source}\n\nat: {when}")]
    UdpRecvError {
        when: WallTime,
        #[source]
        source: std::io::Error,
    },

    /// No RTP data for an extended period; possibly NAT/firewall-blocked UDP.
    /// Transient: the receive loop keeps running.
    #[error("no RTP data received for {idle:?} — possible NAT/firewall blocking UDP")]
    RtpIdle { idle: Duration },

    #[error("Error reading from RTSP peer: {source}\n\nconn: {conn_ctx}")]
    ReadError {
        conn_ctx: ConnectionContext,
        #[source]
        source: std::io::Error,
    },

    #[error("Error writing to RTSP peer: {source}\n\nconn: {conn_ctx}")]
    WriteError {
        conn_ctx: ConnectionContext,
        #[source]
        source: std::io::Error,
    },

    #[error("Timeout waiting for {0}")]
    Timeout(&'static str),
}
