use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatRelayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
