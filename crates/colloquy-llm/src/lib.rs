//! LLM generation seam for the colloquy engine.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `generator` | `SchematicGenerator` trait — prompt in, schema-typed JSON out |
//! | `retry` | Temperature-ladder retries with backoff for transient failures |
//! | `mock` | Deterministic generator for tests, no API calls |
//! | `openai` | Thin adapter for OpenAI-compatible chat endpoints |

pub mod generator;
pub mod mock;
pub mod openai;
pub mod retry;

pub use generator::{
    generate, GenerationHints, GeneratorError, Generation, JsonGeneration, SchematicGenerator,
    UsageInfo,
};
