pub mod types;
pub mod extract;
pub mod fallback;
pub mod prompt;
pub mod ollama;
pub mod orchestrator;
pub mod history;
pub mod persist;

pub use types::*;
pub use extract::*;
pub use fallback::*;
pub use prompt::*;
pub use ollama::*;
pub use orchestrator::*;
pub use history::*;
pub use persist::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiagnosisError {
    #[error("Ollama is not running at {0}")]
    OllamaConnection(String),

    #[error("Ollama returned error (status {status}): {body}")]
    OllamaError { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),

    #[error("Model returned an empty response")]
    EmptyResponse,

    #[error("Cannot read image {path}: {source}")]
    ImageRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid pipeline configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
