//! HYPER client: sessions to remote servers and request correlation.

pub mod connection;
pub mod download;
pub mod session;

pub use connection::ClientConnection;
pub use download::DownloadManager;
pub use session::ClientSession;

use crate::config::Role;
use crate::error::HyperError;
use crate::hyper::buffer_pool::PooledBuf;

/// Callbacks fired by client connections as responses arrive.
///
/// Passed to a session when it is created and shared by all of its legs.
/// Calls come from connection tasks, so implementations must not block.
pub trait ClientEvents: Send + Sync {
    fn on_segment(&self, token: u32, data: PooledBuf);

    fn on_file_found(&self, token: u32, size: i64);

    /// A leg failed and is now disconnected. Informational only.
    fn on_error(&self, _role: Role, _error: &HyperError) {}
}
