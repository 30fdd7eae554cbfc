//! HTTP/WebSocket gateway. REST routes cover conversations, messages,
//! tasks, and notifications; the WebSocket endpoint carries chat and
//! notification push.

pub mod routes;
pub mod server;
pub mod ws;

pub use server::{AppState, build_router, run};
