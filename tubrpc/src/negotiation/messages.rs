//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Handshake messages.
//!
//! A negotiation starts with an HTTP-style upgrade exchange in plaintext so it
//! can pass through proxies that only speak HTTP:
//!
//! ```text
//! GET /id/<target-tubid> HTTP/1.1
//! Upgrade: TLS/1.0, PB/1.0
//! Connection: Upgrade
//!
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: TLS/1.0, PB/1.0
//! Connection: Upgrade
//! ```
//!
//! After the security upgrade, the initiator sends a [`Hello`], the listener
//! answers with its own, and the master sends a [`Decision`]. Hello and
//! Decision are JSON documents in length-prefixed frames; unknown fields are
//! ignored so newer peers can extend them.

use crate::identity::{Incarnation, SequenceNumber, TubId, VersionRange};
use crate::negotiation::{LastKnown, NegotiationError, NegotiationPhase};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const UPGRADE_HEADERS: &str = "Upgrade: TLS/1.0, PB/1.0\r\nConnection: Upgrade\r\n";
const SWITCHING: &str = "HTTP/1.1 101 Switching Protocols";
const SERVER_ERROR: &str = "HTTP/1.1 500 Internal Server Error";

/// Sends the upgrade request for `target`.
pub async fn write_request<W>(writer: &mut W, target: &TubId) -> Result<(), NegotiationError>
where
    W: AsyncWrite + Unpin,
{
    let request = format!("GET /id/{} HTTP/1.1\r\n{}\r\n", target, UPGRADE_HEADERS);
    writer.write_all(request.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads an upgrade request and returns the tub id it asks for, verbatim.
pub async fn read_request<R>(reader: &mut R, max_size: usize) -> Result<String, NegotiationError>
where
    R: AsyncRead + Unpin,
{
    let head = read_head(reader, max_size).await?;
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let (Some("GET"), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(NegotiationError::protocol(format!(
            "bad request line '{}'",
            request_line
        )));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(NegotiationError::protocol(format!(
            "unsupported HTTP version '{}'",
            version
        )));
    }
    let requested = path.strip_prefix("/id/").ok_or_else(|| {
        NegotiationError::protocol(format!("bad request path '{}'", path))
    })?;
    Ok(requested.to_string())
}

/// Accepts the upgrade.
pub async fn write_switching<W>(writer: &mut W) -> Result<(), NegotiationError>
where
    W: AsyncWrite + Unpin,
{
    let response = format!("{}\r\n{}\r\n", SWITCHING, UPGRADE_HEADERS);
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Refuses the upgrade; the caller closes the transport afterwards.
pub async fn write_refusal<W>(writer: &mut W) -> Result<(), NegotiationError>
where
    W: AsyncWrite + Unpin,
{
    let response = format!("{}\r\nConnection: close\r\n\r\n", SERVER_ERROR);
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the listener's answer and fails unless it switched protocols.
pub async fn read_response<R>(reader: &mut R, max_size: usize) -> Result<(), NegotiationError>
where
    R: AsyncRead + Unpin,
{
    let head = read_head(reader, max_size).await?;
    let status = head.lines().next().unwrap_or_default();
    if status.starts_with("HTTP/1.1 101") || status.starts_with("HTTP/1.0 101") {
        Ok(())
    } else {
        Err(NegotiationError::UpgradeRefused {
            status: status.to_string(),
        })
    }
}

/// Reads up to and including the blank line ending an HTTP head.
///
/// Reads one byte at a time so nothing past the head is consumed; the bytes
/// that follow belong to the security upgrade.
async fn read_head<R>(reader: &mut R, max_size: usize) -> Result<String, NegotiationError>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(128);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= max_size {
            return Err(NegotiationError::protocol(format!(
                "preamble exceeds {} bytes",
                max_size
            )));
        }
        match reader.read_u8().await {
            Ok(byte) => head.push(byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(NegotiationError::ConnectionClosed {
                    phase: NegotiationPhase::Plaintext,
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
    String::from_utf8(head)
        .map_err(|_| NegotiationError::protocol("preamble is not valid UTF-8"))
}

/// Identity and capabilities block sent by each side after the upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Sender's tub id.
    pub tub_id: TubId,
    /// Sender's incarnation; legacy peers omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incarnation: Option<Incarnation>,
    /// Lowest protocol version the sender speaks.
    pub min_version: u32,
    /// Highest protocol version the sender speaks.
    pub max_version: u32,
    /// Set by a slave: its last connection with the receiving master.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known: Option<LastKnown>,
}

impl Hello {
    /// Builds a hello block.
    pub fn new(
        tub_id: TubId,
        incarnation: Incarnation,
        versions: VersionRange,
        last_known: Option<LastKnown>,
    ) -> Self {
        Self {
            tub_id,
            incarnation: Some(incarnation),
            min_version: versions.min(),
            max_version: versions.max(),
            last_known,
        }
    }

    /// Returns the advertised version range.
    pub fn versions(&self) -> Result<VersionRange, NegotiationError> {
        VersionRange::new(self.min_version, self.max_version).ok_or_else(|| {
            NegotiationError::protocol(format!(
                "inverted version range [{}, {}]",
                self.min_version, self.max_version
            ))
        })
    }

    /// Returns the sequence number this hello offers, as seen by a master.
    pub fn offered_seq(&self) -> SequenceNumber {
        self.last_known
            .map(|k| k.seq.next())
            .unwrap_or(SequenceNumber::FIRST)
    }
}

/// The master's verdict, sent once per negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the connection is accepted.
    pub accepted: bool,
    /// Chosen protocol version, on accept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// Why the offer was refused, on reject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Assigned sequence number on accept, the master's current one on reject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<SequenceNumber>,
}

impl Decision {
    /// An accepting decision.
    pub fn accept(version: u32, seq: SequenceNumber) -> Self {
        Self {
            accepted: true,
            version: Some(version),
            reason: None,
            seq: Some(seq),
        }
    }

    /// A rejecting decision.
    pub fn reject(reason: impl Into<String>, current: Option<SequenceNumber>) -> Self {
        Self {
            accepted: false,
            version: None,
            reason: Some(reason.into()),
            seq: current,
        }
    }
}
