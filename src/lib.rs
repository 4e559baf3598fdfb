//! Session and quota accounting for a Wi-Fi hotspot.
//!
//! Vouchers bought for a [`catalog::Plan`] are redeemed into a subscriber's
//! balance; sessions spend that balance while an access enforcer keeps the
//! subscriber's network access granted. [`engine::Engine`] is the entry
//! point for the presentation layer.

pub mod balance;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod control;
pub mod daemon;
pub mod enforcer;
pub mod engine;
pub mod error;
pub mod events;
pub mod ids;
pub mod ledger;
pub mod quota;
pub mod session;
pub mod storage;

#[cfg(test)]
mod testing;

pub use engine::{Engine, EngineBuilder, EngineStats};
pub use error::{EngineError, EngineResult};
