// Copyright 2021 Parity Technologies (UK) Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Error taxonomy, organized by kind rather than by which module raised it
//! (see `SPEC_FULL.md` §7). Each wire error code in [`ProtocolError`] and
//! [`SchedulingError`] round-trips to exactly one KRPC `e` reply and back.

use thiserror::Error;

/// Errors visible to a remote peer on the wire, as a KRPC `e` reply.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("generic KRPC error")]
    GenericKrpc,
    #[error("invalid KRPC message")]
    InvalidMessage,
    #[error("internal error (KRPC)")]
    InternalKrpc,
    #[error("method not recognized")]
    MethodNotRecognized,
    #[error("generic DHT error")]
    GenericDht,
    #[error("invalid DHT protocol message")]
    InvalidDhtMessage,
    #[error("internal error (DHT)")]
    InternalDht,
    #[error("rate-limiting active")]
    RateLimited,
}

impl ProtocolError {
    /// Wire code per §4.5's error taxonomy table.
    pub fn code(&self) -> i64 {
        match self {
            ProtocolError::GenericKrpc => 100,
            ProtocolError::InvalidMessage => 101,
            ProtocolError::InternalKrpc => 102,
            ProtocolError::MethodNotRecognized => 103,
            ProtocolError::GenericDht => 200,
            ProtocolError::InvalidDhtMessage => 201,
            ProtocolError::InternalDht => 202,
            ProtocolError::RateLimited => 203,
        }
    }

    /// Inverse of [`ProtocolError::code`]; unknown codes degrade to a
    /// generic variant rather than failing the lookup.
    pub fn from_code(code: i64) -> ProtocolError {
        match code {
            100 => ProtocolError::GenericKrpc,
            101 => ProtocolError::InvalidMessage,
            102 => ProtocolError::InternalKrpc,
            103 => ProtocolError::MethodNotRecognized,
            200 => ProtocolError::GenericDht,
            201 => ProtocolError::InvalidDhtMessage,
            202 => ProtocolError::InternalDht,
            203 => ProtocolError::RateLimited,
            _ => ProtocolError::GenericKrpc,
        }
    }
}

/// Terminal, connection-level failures. Propagate to every open query on
/// the connection as an errback, then close it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection lost")]
    ConnectionLost,
    #[error("noise handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("decryption failed")]
    DecryptFailed,
    #[error("idle timeout")]
    IdleTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Local validation failures. The caller decides what to do (usually
/// blacklist the source); never retried automatically.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("expired timestamp")]
    ExpiredTimestamp,
    #[error("address does not match recomputed hash")]
    AddressMismatch,
    #[error("malformed info advertisement: {0}")]
    MalformedInfo(String),
}

/// Side-effect-free policy rejections.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("host is blacklisted")]
    Blacklisted,
    #[error("listen port already claimed by another peer at this host")]
    DuplicateListenPort,
    #[error("contact is the local peer")]
    SelfContact,
    #[error("duplicate contact at a different identity")]
    DuplicateContact,
}

/// Scheduling/retry-budget failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulingError {
    #[error("retries exceeded")]
    RetriesExceeded,
    #[error("lookup cancelled")]
    Cancelled,
    #[error("lookup configuration incomplete (not enough starting peers)")]
    LookupConfigIncomplete,
    #[error("query timed out")]
    QueryTimeout,
}

/// Bencode codec failures (see `bencode.rs`).
#[derive(Debug, Error, Clone, PartialEq)]
#[error("bencode error: {0}")]
pub struct BencodeError(pub String);

/// Crate-wide error, composing every taxonomy kind above.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
    #[error(transparent)]
    Bencode(#[from] BencodeError),
}
