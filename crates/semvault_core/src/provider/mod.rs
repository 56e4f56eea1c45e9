//! External model provider boundary.
//!
//! # Responsibility
//! - Define the SPI the engine uses for generation and embeddings.
//! - Keep prompt wording and response parsing in one place.
//!
//! # Invariants
//! - No model response is trusted without going through `judgment`.

pub mod judgment;
pub mod prompts;
mod spi;

pub use spi::{embed_text, LanguageModel, ModelError};
