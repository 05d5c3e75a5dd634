//! Per-channel access control and the pairing-code protocol.

pub mod error;
pub mod manager;

pub use {
    error::{Error, Result},
    manager::{AccessDecision, SecurityManager, VerifyOutcome, looks_like_pairing_code},
};
