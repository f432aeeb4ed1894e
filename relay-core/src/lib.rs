//! Relay protocol reference implementation.
//! Host-driven: no I/O; the host owns sockets and tasks and calls into these types.

pub mod crypto;
pub mod discovery;
pub mod dispatch;
pub mod identity;
pub mod protocol;
pub mod routing;
pub mod transfer;
pub mod wire;

pub use crypto::{CryptoError, HandshakeKeypair, Opener, PublicKey, Role, Sealer, SessionKey};
pub use dispatch::{Dispatched, Registry};
pub use identity::Identity;
pub use protocol::{
    paths, DiscoveryQuery, DiscoveryRecord, EntryHeader, Envelope, HandshakeRequest,
    HandshakeResponse, ResultCode, TransferAnnouncement, PROTOCOL_TAG,
};
pub use routing::{GroupUpdate, RoutingTable, Slot};
pub use transfer::{
    PendingTransfers, TransferDescriptor, TransferError, TransferProgress, TransferStatus,
    TransferToken, DEFAULT_CHUNK_SIZE,
};
pub use wire::{encode_frame, FrameDecodeError, FrameEncodeError};
