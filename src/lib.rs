//! nimbus - personal cloud daemon over the multipass CLI
//!
//! nimbus turns a host running [multipass](https://multipass.run) into a
//! small multi-tenant cloud: one daemon that creates, clones, snapshots,
//! and talks to Linux VMs, with a browser terminal, file transfer, and
//! transparent HTTP routing into guest services.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  HTTP server (axum)                              │
//! │  ├─ host router: <vm>-<port>.<domain> dispatch   │
//! │  │    wake-on-request / reverse proxy            │
//! │  └─ management API: vms, snapshots, tunnels,     │
//! │       network policies, shell (WebSocket ⇄ PTY)  │
//! ├──────────────────────────────────────────────────┤
//! │  tunnel manager · watchdog · policy applier      │
//! ├──────────────────────────────────────────────────┤
//! │  multipass client (CLI adapter, JSON output)     │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! The daemon deliberately owns no durable state: VM truth lives in the
//! engine, activity truth lives inside each VM, and a daemon restart
//! changes nothing.

#![warn(clippy::all)]

pub mod agent;
pub mod cloudinit;
pub mod config;
pub mod daemon;
pub mod error;
pub mod launcher;
pub mod multipass;
pub mod network;
pub mod proxy;
pub mod pty;
pub mod tunnel;
pub mod watchdog;

// Re-export main types for convenience
pub use config::Config;
pub use daemon::Server;
pub use error::{Error, Result};
pub use multipass::Client;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
