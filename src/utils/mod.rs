//! Shared helpers.
//!
//! Stateless utilities used by the broker binary and its components.

pub mod bootstrap;
pub mod retry;
