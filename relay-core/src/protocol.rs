//! Relay wire protocol: message types, result codes, protocol tag and relay-local paths.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, SealedSessionKey};
use crate::identity::Identity;
use crate::transfer::TransferToken;

/// Protocol tag. Checked in the handshake and in discovery queries.
pub const PROTOCOL_TAG: &str = "relay/1";

/// Paths with a meaning to the relay or the transfer engine. Everything else is application-defined.
pub mod paths {
    /// Replace the sender's group subscriptions. Handled by the relay, never forwarded.
    pub const GROUP_SUBSCRIBE: &str = "relay.groups";
    /// Roster of connected identities, sent by the relay to every session on join and leave.
    pub const ROSTER: &str = "relay.roster";
    /// Direct file/directory transfer announcement, carried peer to peer.
    pub const TRANSFER_ANNOUNCE: &str = "transfer.announce";
}

/// Closed set of outcome codes. Carried in the handshake response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    ProtocolMismatch,
    /// Identity out of range (client identities must be > 0).
    CodeInvalid,
    /// Identity already reserved or connected.
    CodeConflict,
    /// Relay is at its client capacity.
    CountLimited,
    /// More group subscriptions requested than the relay allows.
    GroupLimited,
    /// Outgoing backlog of a session exceeded its cap.
    Overflow,
    /// Routing table invariant broken. Indicates a bug, not an external condition.
    AssertFailed,
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultCode::Success => "success",
            ResultCode::ProtocolMismatch => "protocol mismatch",
            ResultCode::CodeInvalid => "identity out of range",
            ResultCode::CodeConflict => "identity already in use",
            ResultCode::CountLimited => "relay is full",
            ResultCode::GroupLimited => "too many group subscriptions",
            ResultCode::Overflow => "outgoing backlog exceeded",
            ResultCode::AssertFailed => "internal invariant violated",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ResultCode {}

/// First frame a client sends. Unencrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub identity: Identity,
    pub protocol: String,
    pub public_key: PublicKey,
}

/// Relay's reply to a handshake request. Unencrypted; key material is sealed to the request's public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub result: ResultCode,
    pub server_public: Option<PublicKey>,
    pub sealed_key: Vec<u8>,
    pub sealed_iv: Vec<u8>,
    /// Client's endpoint as seen by the relay (NAT-mapped address).
    pub observed_endpoint: SocketAddr,
}

impl HandshakeResponse {
    pub fn accepted(sealed: SealedSessionKey, observed_endpoint: SocketAddr) -> Self {
        Self {
            result: ResultCode::Success,
            server_public: Some(sealed.server_public),
            sealed_key: sealed.sealed_key,
            sealed_iv: sealed.sealed_iv,
            observed_endpoint,
        }
    }

    pub fn rejected(result: ResultCode, observed_endpoint: SocketAddr) -> Self {
        Self {
            result,
            server_public: None,
            sealed_key: Vec::new(),
            sealed_iv: Vec::new(),
            observed_endpoint,
        }
    }

    /// Sealed key material, present only on success.
    pub fn sealed(&self) -> Option<SealedSessionKey> {
        let server_public = self.server_public.clone()?;
        Some(SealedSessionKey {
            server_public,
            sealed_key: self.sealed_key.clone(),
            sealed_iv: self.sealed_iv.clone(),
        })
    }
}

/// Routed unit of communication. The payload is never interpreted by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: Identity,
    pub target: Identity,
    pub path: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(source: Identity, target: Identity, path: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            source,
            target,
            path: path.into(),
            payload,
        }
    }
}

/// Discovery datagram sent by a prober.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    pub protocol: String,
}

/// Discovery datagram answered by the relay: snapshot of server metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub protocol: String,
    pub port: u16,
    pub name: String,
    pub current: u32,
    pub max: u32,
}

/// Payload of a `transfer.announce` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAnnouncement {
    pub name: String,
    /// Byte length for a single file; `None` for a directory.
    pub length: Option<u64>,
    pub token: TransferToken,
    /// Sender endpoints to try in order: locally observed first, then relay-observed.
    pub endpoints: Vec<SocketAddr>,
}

/// Entry header on a directory data channel. Each `File` is followed by `length` raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryHeader {
    File { path: String, length: u64 },
    End,
}
