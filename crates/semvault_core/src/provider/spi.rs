//! Language model service provider interface.
//!
//! # Responsibility
//! - Define the text generation and embedding capability the engine consumes.
//! - Validate embedding responses before they reach storage.
//!
//! # Invariants
//! - Implementations are shared across threads (`Send + Sync`).
//! - The engine never assumes a specific backend.

use crate::similarity::Embedding;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Errors reported by a model backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Backend unreachable, overloaded or timed out. Retry later.
    Unavailable(String),
    /// Backend answered with a shape the engine cannot use.
    MalformedResponse(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "model unavailable: {message}"),
            Self::MalformedResponse(message) => {
                write!(f, "malformed model response: {message}")
            }
        }
    }
}

impl Error for ModelError {}

/// Text generation and embedding capability.
pub trait LanguageModel: Send + Sync {
    /// Identifier of the active embedding model. Embeddings tagged with any
    /// other identifier are stale.
    fn model_id(&self) -> &str;
    /// Returns free-form text for one prompt.
    fn generate(&self, prompt: &str) -> Result<String, ModelError>;
    /// Returns one vector per input text, in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ModelError>;
}

/// Embeds one text and tags the result with the active model id.
///
/// # Errors
/// - Propagates backend errors.
/// - `MalformedResponse` when the backend returns no vector, more than one
///   vector, an empty vector or non-finite values.
pub fn embed_text(model: &dyn LanguageModel, text: &str) -> Result<Embedding, ModelError> {
    let mut vectors = model.embed(&[text.to_string()])?;
    if vectors.len() != 1 {
        return Err(ModelError::MalformedResponse(format!(
            "expected 1 embedding, got {}",
            vectors.len()
        )));
    }
    let values = vectors.remove(0);
    if values.is_empty() {
        return Err(ModelError::MalformedResponse(
            "embedding is empty".to_string(),
        ));
    }
    if values.iter().any(|value| !value.is_finite()) {
        return Err(ModelError::MalformedResponse(
            "embedding contains non-finite values".to_string(),
        ));
    }
    Ok(Embedding::new(values, model.model_id()))
}
