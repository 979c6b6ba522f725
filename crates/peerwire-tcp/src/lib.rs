//! Length-prefixed TCP transport for peerwire
//!
//! Every message travels as `[u32 big-endian length][envelope bytes]`.
//! [`TcpServer`] accepts links and keeps the name-indexed peer table;
//! [`TcpConnection::connect`] opens a client link that identifies itself with
//! a logical name as soon as it is ready.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod connection;
pub mod server;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{TcpConfig, DEFAULT_PORT};
pub use connection::TcpConnection;
pub use server::TcpServer;
