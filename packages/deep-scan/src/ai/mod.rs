//! AI enrichment adapters.

pub mod openai;

pub use openai::OpenAiExtractor;
