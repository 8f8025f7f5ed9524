//! Interop broker.
//!
//! Lets independently launched desktop applications provide and consume typed
//! RPC services through a shared metadata registry. The broker resolves each
//! consumer's declared dependency to a live provider connection and relays
//! unary and streaming calls between them.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod invocation;
pub mod lifecycle;
pub mod metadata;
pub mod registry;
pub mod resolver;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod test_utils;
