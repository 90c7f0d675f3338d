/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use miette::Diagnostic;
use std::{io, net::AddrParseError};
use thiserror::Error;

/// Errors that abort module startup: bad module arguments or a socket the
/// module cannot live without (the SAP listening socket).
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("missing required module argument: {0}")]
    MissingArgument(&'static str),
    #[error("invalid value for '{key}': {value}")]
    InvalidValue { key: String, value: String },
    #[error("invalid multicast address: {0}")]
    InvalidAddress(#[from] AddrParseError),
    #[error("address {0} is not a multicast address")]
    NotMulticast(std::net::IpAddr),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Failures creating or joining a multicast UDP socket (component A).
#[derive(Error, Debug, Diagnostic)]
pub enum SocketError {
    #[error("failed to create socket: {0}")]
    Create(#[source] io::Error),
    #[error("failed to join multicast group {group}: {source}")]
    Join {
        group: std::net::IpAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to convert socket to non-blocking / async: {0}")]
    Convert(#[source] io::Error),
}

pub type SocketResult<T> = Result<T, SocketError>;

/// Malformed wire data: RTP packets, SAP frames, or the SDP body they carry.
#[derive(Error, Debug, Diagnostic)]
pub enum DecodeError {
    #[error("RTP packet too short ({0} bytes)")]
    RtpTooShort(usize),
    #[error("unsupported RTP version {0}")]
    RtpUnsupportedVersion(u8),
    #[error("SAP frame too short ({0} bytes)")]
    SapTooShort(usize),
    #[error("SAP frame uses an encrypted or compressed payload, which is not supported")]
    SapUnsupportedEncoding,
    #[error("unsupported SAP payload type: {0}")]
    SapUnsupportedPayloadType(String),
    #[error("SDP parse error: {0}")]
    Sdp(#[from] sdp::Error),
    #[error("SDP is missing a required field: {0}")]
    SdpMissingField(&'static str),
    #[error("SDP declares an unsupported media type or protocol: {0}")]
    SdpUnsupportedMedia(String),
    #[error("malformed rtpmap attribute: {0}")]
    MalformedRtpmap(String),
    #[error("unsupported sample encoding: {0}")]
    UnsupportedEncoding(String),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Session creation failures, surfaced to the discovery loop (section 4.H) and
/// boxed into [`ServiceError`] only when they escape to `main`.
#[derive(Error, Debug, Diagnostic)]
pub enum SessionError {
    #[error("session capacity ({0}) exceeded")]
    CapacityExceeded(usize),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("failed to spawn ingest thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to build per-session tokio runtime: {0}")]
    Runtime(#[source] io::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Top-level error returned from the binary's `main`.
#[derive(Error, Debug, Diagnostic)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("shutdown did not complete cleanly: {0}")]
    Shutdown(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;
