//! roster gateway library
//!
//! WebSocket presence and broadcast gateway: clients authenticate over a
//! persistent socket and receive join/leave/role notifications about
//! everyone else; administrators enumerate live connections and inject
//! broadcasts over an HTTP side channel; a durable presence store keeps
//! who-is-online across restarts.

pub mod cli;
pub mod config;
pub mod logging;
pub mod presence;
pub mod protocol;
pub mod server;
