//! HYPER: high-throughput segment transfer between Direct Connect peers.
//!
//! One logical session spans many TCP connections sharing a random 64-bit
//! session token. Control legs carry requests; transfer legs carry segment
//! payloads back. Requests and responses are matched by a 32-bit request
//! token, so legs may deliver out of order.
//!
//! # Architecture
//!
//! ```text
//! Client                                          Server
//! +-----------------+   Request (control legs)    +----------------+
//! | DownloadManager | --> ClientSession ========> | HyperServer    |
//! |  (correlation)  |                             |  ServerSession | --> Storage
//! +-----------------+ <======== SegmentData ===== |  (queues)      | <-- Task done
//!                        FileCheckResult          +----------------+
//!                        (transfer / any leg)
//! ```
//!
//! # Wire format
//!
//! `len:u32 | kind:u8 | payload`, little-endian, `len` counting the kind
//! byte. See [`protocol`] for the four message kinds.

pub mod buffer_pool;
pub mod client;
pub mod connection;
pub mod protocol;
pub mod queue;
pub mod server;

pub use buffer_pool::{BufferPool, PooledBuf};
pub use client::{ClientConnection, ClientEvents, ClientSession, DownloadManager};
pub use connection::{ConnectionStatus, FrameReader};
pub use protocol::{
    FileCheckResult, Handshake, Message, MessageKind, Request, SegmentData, FILE_CHECK_LENGTH,
    FILE_NOT_FOUND, MAX_MESSAGE_SIZE,
};
pub use server::{HyperServer, ServerConnection, ServerSession};
