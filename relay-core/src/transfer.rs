//! Transfer state: correlation tokens, per-transfer descriptor and state machine, pending token set.
//!
//! A transfer is announced over a session and carried on a separate direct stream. The two sides
//! share nothing but the token: the pending set maps token → source description, and the task that
//! pumps bytes owns the `TransferDescriptor`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Bytes moved per read/write on the data channel.
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024; // 256 KiB

/// One-time value linking an announcement to its data connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferToken(pub [u8; 16]);

impl TransferToken {
    pub fn generate() -> Self {
        TransferToken(uuid::Uuid::new_v4().into_bytes())
    }
}

impl fmt::Display for TransferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).simple())
    }
}

impl fmt::Debug for TransferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferToken({self})")
    }
}

/// Waiting → Connecting (receiver) / Listening (sender) → Running → Success | Interrupted | Canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Waiting,
    Connecting,
    Listening,
    Running,
    Success,
    Interrupted,
    Canceled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Success | TransferStatus::Interrupted | TransferStatus::Canceled
        )
    }
}

/// Snapshot published to observers after every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub position: u64,
    pub length: Option<u64>,
    pub status: TransferStatus,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("cannot move transfer from {from:?} to {to:?}")]
    InvalidTransition {
        from: TransferStatus,
        to: TransferStatus,
    },
    #[error("received {position} bytes, declared length is {length}")]
    Overrun { position: u64, length: u64 },
    #[error("unsafe entry path: {0}")]
    UnsafePath(String),
}

/// Single-owner state of one transfer.
#[derive(Debug, Clone)]
pub struct TransferDescriptor {
    pub token: TransferToken,
    pub name: String,
    length: Option<u64>,
    position: u64,
    status: TransferStatus,
}

impl TransferDescriptor {
    pub fn new(token: TransferToken, name: impl Into<String>, length: Option<u64>) -> Self {
        Self {
            token,
            name: name.into(),
            length,
            position: 0,
            status: TransferStatus::Waiting,
        }
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            position: self.position,
            length: self.length,
            status: self.status,
        }
    }

    fn transition(&mut self, to: TransferStatus) -> Result<(), TransferError> {
        use TransferStatus::*;
        let ok = match (self.status, to) {
            (Waiting, Connecting | Listening) => true,
            (Connecting | Listening, Running) => true,
            _ => false,
        };
        if !ok {
            return Err(TransferError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Receiver: start trying the announced endpoints.
    pub fn connecting(&mut self) -> Result<(), TransferError> {
        self.transition(TransferStatus::Connecting)
    }

    /// Sender: announced, waiting for the receiver to present the token.
    pub fn listening(&mut self) -> Result<(), TransferError> {
        self.transition(TransferStatus::Listening)
    }

    /// Data channel established.
    pub fn running(&mut self) -> Result<(), TransferError> {
        self.transition(TransferStatus::Running)
    }

    /// Record `n` more bytes moved. Moving past the declared length is an error.
    pub fn advance(&mut self, n: u64) -> Result<(), TransferError> {
        let position = self.position.saturating_add(n);
        if let Some(length) = self.length {
            if position > length {
                return Err(TransferError::Overrun { position, length });
            }
        }
        self.position = position;
        Ok(())
    }

    /// End of the byte stream. Files succeed only at exactly the declared length;
    /// directories succeed when the producer signalled end-of-sequence.
    pub fn finish(&mut self) -> TransferStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        self.status = match self.length {
            Some(length) if self.position == length && self.status == TransferStatus::Running => {
                TransferStatus::Success
            }
            None if self.status == TransferStatus::Running => TransferStatus::Success,
            _ => TransferStatus::Interrupted,
        };
        self.status
    }

    /// Stream error or expiry. No effect once terminal.
    pub fn interrupt(&mut self) -> TransferStatus {
        if !self.status.is_terminal() {
            self.status = TransferStatus::Interrupted;
        }
        self.status
    }

    /// External cancellation. No effect once terminal.
    pub fn cancel(&mut self) -> TransferStatus {
        if !self.status.is_terminal() {
            self.status = TransferStatus::Canceled;
        }
        self.status
    }
}

struct Pending<T> {
    source: T,
    announced_at: Instant,
}

/// Announced tokens awaiting their data connection. Each token can be claimed once.
pub struct PendingTransfers<T> {
    entries: HashMap<TransferToken, Pending<T>>,
}

impl<T> PendingTransfers<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, token: TransferToken, source: T) {
        self.insert_at(token, source, Instant::now());
    }

    pub fn insert_at(&mut self, token: TransferToken, source: T, announced_at: Instant) {
        self.entries.insert(
            token,
            Pending {
                source,
                announced_at,
            },
        );
    }

    /// Consume `token`. Unknown or already-claimed tokens yield `None`.
    pub fn claim(&mut self, token: &TransferToken) -> Option<T> {
        self.entries.remove(token).map(|p| p.source)
    }

    pub fn contains(&self, token: &TransferToken) -> bool {
        self.entries.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return entries whose source matches `pred`.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<(TransferToken, T)> {
        let matched: Vec<TransferToken> = self
            .entries
            .iter()
            .filter(|(_, p)| pred(&p.source))
            .map(|(t, _)| *t)
            .collect();
        matched
            .into_iter()
            .filter_map(|t| self.entries.remove(&t).map(|p| (t, p.source)))
            .collect()
    }

    /// Remove and return entries announced more than `max_age` before `now`.
    pub fn expire(&mut self, now: Instant, max_age: Duration) -> Vec<(TransferToken, T)> {
        let stale: Vec<TransferToken> = self
            .entries
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.announced_at) > max_age)
            .map(|(t, _)| *t)
            .collect();
        stale
            .into_iter()
            .filter_map(|t| self.entries.remove(&t).map(|p| (t, p.source)))
            .collect()
    }
}

impl<T> Default for PendingTransfers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a directory entry path received from a peer: relative, no `..`, not empty.
pub fn safe_entry_path(path: &str) -> Result<PathBuf, TransferError> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(TransferError::UnsafePath(path.to_string())),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(TransferError::UnsafePath(path.to_string()));
    }
    Ok(out)
}
