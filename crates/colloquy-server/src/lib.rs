//! HTTP surface for the colloquy runtime.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `server` | Router construction, config, start/shutdown handle |
//! | `handlers` | `POST /sessions/chat_async`, long-polling events, health |

pub mod handlers;
pub mod server;

pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
