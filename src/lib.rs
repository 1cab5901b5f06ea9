//! Ratekeeper - Keyed Rate Limiting Engine
//!
//! This crate grants or denies units of work identified by a key according to
//! a fixed window or token bucket policy. Rate state lives in a [`store::Store`]:
//! either in-process maps or a Redis server shared by every instance, with
//! identical semantics on both.

pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod store;
