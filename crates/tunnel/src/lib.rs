//! Public-URL tunnels for webhook-style channel adapters.
//!
//! Spawns and monitors an external tunneling process (`ngrok`, `cloudflared`,
//! `lt`) or drives the `tailscale` CLI, and reports the resulting public URL.
//! Independent of the rest of the gateway; consumed by adapters that need an
//! inbound webhook endpoint.

pub mod error;
pub mod manager;
pub mod provider;

pub use {
    error::{Error, Result},
    manager::{TunnelConfig, TunnelManager, TunnelState},
    provider::TunnelProvider,
};
