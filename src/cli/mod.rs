//! CLI command implementations.
//!
//! These talk to the engine directly through the same client and launcher
//! the daemon uses; no running daemon is required.

pub mod vm;
