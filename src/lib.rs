//! feedmail: a one-shot batch engine that fetches syndication feeds,
//! decides which entries are new or changed, and emails each distinct
//! entry state exactly once.
//!
//! The binary in `main.rs` is a thin clap dispatcher; everything with
//! behavior worth testing lives here so the integration tests can drive
//! it directly.

pub mod commands;
pub mod config;
pub mod delivery;
pub mod feed;
pub mod hook;
pub mod message;
pub mod store;
pub mod util;
