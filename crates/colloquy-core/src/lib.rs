//! Core domain types for the colloquy runtime.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `ids` | Branded id newtypes (session, agent, guideline, ...) |
//! | `correlation` | Scoped correlation ids and the threaded `Context` value |
//! | `events` | Session-log events: kinds, sources, typed payloads |
//! | `agents` | Agent identity and composition modes |
//! | `sessions` | Sessions, modes, per-cycle agent state snapshots |
//! | `guidelines` | Behavioral rules and matcher decisions |
//! | `journeys` | Node/edge graphs and their guideline projection |
//! | `tools` | Tool definitions, calls, results, the runner seam |
//! | `canned` | Pre-authored response templates |
//! | `glossary` | Domain terms loaded per context |
//! | `capabilities` | Agent capability descriptors |
//! | `context_vars` | Customer/agent scoped context variables |

pub mod agents;
pub mod canned;
pub mod capabilities;
pub mod context_vars;
pub mod correlation;
pub mod customers;
pub mod events;
pub mod glossary;
pub mod guidelines;
pub mod ids;
pub mod journeys;
pub mod sessions;
pub mod tools;
