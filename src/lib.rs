//! Pig Arena Server Library
//!
//! Real-time multiplayer sessions of the dice game Pig. Every session is run
//! by its own actor task which owns the game state exclusively; a directory
//! allocates, matches and reclaims those actors.
//!
//! # Features
//!
//! - `webtransport` - WebTransport join endpoint with TLS certificate loading (enabled by default)

pub mod config;
pub mod game;
pub mod lobby;
pub mod metrics;
pub mod net;
