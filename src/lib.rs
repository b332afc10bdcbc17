//! Transparent TCP/UDP forwarder with per-source flood blocking.
//!
//! Relays traffic for a fixed set of port mappings to a backend host and
//! temporarily blocks source addresses that exceed a packets-per-second
//! limit, reporting each block to an external backend.

pub mod api;
pub mod config;
pub mod core;
pub mod logging;
pub mod models;
pub mod utils;
