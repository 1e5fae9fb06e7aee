//! Handlers installed by the server.
//!
//! - [`events`] — realtime event handlers
//! - [`commands`] — slash commands and webhook hooks

pub mod commands;
pub mod events;
