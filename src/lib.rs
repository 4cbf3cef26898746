//! Support Relay — mirrors external support threads into an append-only
//! thread store and forwards replies back out.

pub mod config;
pub mod error;
pub mod feed;
pub mod forward;
pub mod store;
pub mod surface;
pub mod sync;
pub mod worker;
