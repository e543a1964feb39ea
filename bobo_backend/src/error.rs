/// Every recoverable failure the pet core can surface to a caller.
///
/// None of these are fatal: each leaves the conversation log in its last
/// valid state and the arbiter released.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PetError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("invalid oracle response: {0}")]
    InvalidOracleResponse(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("busy: an interaction is already in flight")]
    Busy,

    #[error("interaction cancelled")]
    Cancelled,
}

impl PetError {
    /// Stable machine-readable kind, used on the wire and in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            PetError::InvalidInput(_) => "invalid_input",
            PetError::ModelUnavailable(_) => "model_unavailable",
            PetError::InvalidOracleResponse(_) => "invalid_oracle_response",
            PetError::StoreUnavailable(_) => "store_unavailable",
            PetError::Busy => "busy",
            PetError::Cancelled => "cancelled",
        }
    }

    pub(crate) fn store(error: anyhow::Error) -> Self {
        // {:#} keeps the context chain on one line
        PetError::StoreUnavailable(format!("{error:#}"))
    }

    pub(crate) fn model(error: anyhow::Error) -> Self {
        PetError::ModelUnavailable(format!("{error:#}"))
    }
}

pub type PetResult<T> = std::result::Result<T, PetError>;
