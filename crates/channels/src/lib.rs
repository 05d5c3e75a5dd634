//! Channel adapter contract.
//!
//! Each messaging protocol (Telegram-like bots, group chats, DM bridges)
//! implements [`ChannelAdapter`]; the router talks to adapters exclusively
//! through this trait and its capability methods.

pub mod adapter;
pub mod error;
pub mod registry;

pub use {
    adapter::{AdapterStatus, ChannelAdapter, InboundEvent},
    error::{Error, Result},
    registry::AdapterRegistry,
};
