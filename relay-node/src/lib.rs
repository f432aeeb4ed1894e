//! Relay daemon: session listener, client connector, discovery, direct transfers.
//! Async host for `relay-core`; every I/O loop lives here.

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod listener;
pub mod session;
pub mod transfer;
pub mod transport;

pub use client::{Client, ClientOptions};
pub use config::Config;
pub use error::{NodeError, Result};
pub use listener::Listener;
pub use session::{CloseReason, SessionHandle, SessionSink};
pub use transfer::{receive, TransferEngine, TransferHandle, TransferOptions, TransferSource};
