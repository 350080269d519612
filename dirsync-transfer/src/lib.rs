//! Transfer protocol for dirsync.
//!
//! - [`protocol`]: the versioned binary framing for requests and responses
//! - [`writer`]: applies received changes under the serve root
//! - [`server`]: [`TransferServer`], one session task per connection
//! - [`client`]: [`TransferClient`], the blocking sender used by the dispatcher

pub mod client;
mod error;
pub mod protocol;
pub mod server;
pub mod writer;

pub use client::TransferClient;
pub use error::{ProtocolError, TransferError};
pub use protocol::{Operation, Response, TransferRequest, CHUNK_SIZE, PROTOCOL_VERSION};
pub use server::TransferServer;
pub use writer::ServeRoot;
