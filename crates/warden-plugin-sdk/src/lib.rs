//! Plugin-side half of the warden RPC contract.
//!
//! A plugin is an executable launched with one argument, the TCP port it must
//! listen on. It registers named functions that each take and return a
//! string, then serves them until the host kills it.

pub mod protocol;
pub mod server;

pub use protocol::{ErrorCode, Request, Response, RpcError};
pub use server::PluginServer;
