use basalt_config::ConfigError;
use basalt_matrix::MatrixError;

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown record '{name}' (rid {rid})")]
    UnknownRecord { rid: i32, name: String },

    #[error("reserved cipher {cipher:#x}")]
    ReservedCipher { cipher: i32 },

    #[error("record '{record}' carries neither cipher nor symbol")]
    MissingSymbol { record: String },

    #[error("record '{record}' has no time and cannot be subscribed for history")]
    RecordWithoutTime { record: String },

    #[error("{what}: agent {agent}, key {key:#x}, rid {rid}")]
    ChainCorrupted {
        what: &'static str,
        agent: i32,
        key: i32,
        rid: i32,
    },

    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error("collector halted after fatal error: {reason}")]
    Halted { reason: String },
}

impl CollectorError {
    /// Errors that leave shared state inconsistent. Once one is recorded the
    /// collector refuses further work until the error is cleared.
    pub fn is_fatal(&self) -> bool {
        match self {
            CollectorError::Matrix(e) => !e.is_out_of_memory(),
            CollectorError::ReservedCipher { .. }
            | CollectorError::ChainCorrupted { .. }
            | CollectorError::IllegalState(_) => true,
            CollectorError::Config(_)
            | CollectorError::UnknownRecord { .. }
            | CollectorError::MissingSymbol { .. }
            | CollectorError::RecordWithoutTime { .. }
            | CollectorError::Halted { .. } => false,
        }
    }
}
