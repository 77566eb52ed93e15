use thiserror::Error;

#[derive(Debug, Error)]
pub enum SseError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("taxon '{taxon}' does not match between the tree and the character data")]
    TaxonMismatch { taxon: String },

    #[error("{what}: no valid sample after {attempts} attempts")]
    SamplingExhausted { what: &'static str, attempts: usize },

    #[error("numerical integration failed: {0}")]
    Integration(String),

    #[error("malformed tree: {0}")]
    Tree(String),
}

pub type SseResult<T> = Result<T, SseError>;

pub(crate) fn config_err<T>(msg: impl Into<String>) -> SseResult<T> {
    Err(SseError::Config(msg.into()))
}
