//! Control-plane client for the LXD daemon.
//!
//! Speaks the daemon's REST API (`/1.0/...`) over its local unix socket and
//! implements [`sandbox::ControlPlane`] on top of it. The client keeps no
//! per-instance state; asynchronous creation is reported back to the caller
//! rather than polled here.

mod client;
mod config;
mod transport;
mod wire;

pub use client::LxdClient;
pub use config::LxdConfig;
