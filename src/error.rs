//! Error types for robust-speech-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Signal processing error (STFT, filtering).
    #[error("audio: {0}")]
    Audio(String),

    /// Model weight loading error.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// Span masking could not be computed for the requested shape.
    #[error("masking: {0}")]
    Masking(String),

    /// A metric accumulator was reduced before anything was pushed into it.
    #[error("metric accumulator `{0}` is empty; on_stage_start must run before on_stage_end")]
    EmptyAccumulator(&'static str),

    /// More updates saw a non-finite loss than the configured patience allows.
    #[error("loss is not finite on {count} updates (patience {patience})")]
    NonFiniteLoss { count: usize, patience: usize },

    /// A forward pass that must produce a loss did not.
    #[error("forward pass produced no loss")]
    MissingLoss,

    /// An attack could not compute its perturbation.
    #[error("attack: {0}")]
    Attack(String),

    /// Checkpoint save/load error.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// HuggingFace Hub error.
    #[error("hf-hub: {0}")]
    HfHub(String),
}

impl From<hf_hub::api::sync::ApiError> for Error {
    fn from(error: hf_hub::api::sync::ApiError) -> Self {
        Error::HfHub(error.to_string())
    }
}
