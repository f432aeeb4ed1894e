//! Identity addressing: one signed integer space for the relay, clients and groups.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Signed address. `0` is the relay itself, positive values are clients, negative values are groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity(pub i32);

impl Identity {
    /// The relay. Target for relay-local control messages and broadcast-to-all.
    pub const RELAY: Identity = Identity(0);

    pub fn is_relay(self) -> bool {
        self.0 == 0
    }

    /// Individual client address (> 0). Only these may complete a handshake.
    pub fn is_client(self) -> bool {
        self.0 > 0
    }

    pub fn is_group(self) -> bool {
        self.0 < 0
    }
}

impl From<i32> for Identity {
    fn from(value: i32) -> Self {
        Identity(value)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
