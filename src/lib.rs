//! Session lifecycle and durable-message core of a conversational web
//! front-end for command-line AI agents.
//!
//! The server accepts user messages over HTTP, persists them exactly once,
//! runs the nominated agent in the background under an explicit per-session
//! state machine, and fans streamed chunks out to every subscriber of the
//! conversation. Reconnecting clients resume from the canonical store state.

pub mod agent;
pub mod api;
pub mod background;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod hub;
pub mod server;
pub mod session;
pub mod store;
pub mod sync;
