//! Gateway composition root.
//!
//! Owns the database handle, constructs the security manager, session
//! manager and message router, wires adapter and task-engine event streams
//! into the router, and exposes the small external API (enable/disable
//! channel, send message, pairing management).

pub mod config;
pub mod gateway;

pub use {
    config::GatewayConfig,
    gateway::{ChannelGateway, Error, Result},
};
