#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    #[error("capacity {capacity} is too large")]
    CapacityTooLarge { capacity: usize },

    #[error("failed to allocate {rows} rows")]
    OutOfMemory { rows: usize },

    #[error("repeated key detected: key {key:#x}, rid {rid}")]
    RepeatedKey { key: i32, rid: i32 },

    #[error("payload size overflow")]
    PayloadOverflow,

    #[error("payload size underflow")]
    PayloadUnderflow,

    #[error("payload integrity corrupted: expected {expected}, copied {copied}")]
    PayloadCorrupted { expected: usize, copied: usize },

    #[error("unknown mapped key {key:#x}")]
    UnknownKey { key: i32 },

    #[error("mapping counter overflow for key {key:#x}")]
    CounterOverflow { key: i32 },

    #[error("mapping counter underflow for key {key:#x}")]
    CounterUnderflow { key: i32 },

    #[error("mapping max counter overflow")]
    MaxCounterOverflow,

    #[error("mapping max counter underflow")]
    MaxCounterUnderflow,

    #[error("excess payload: {payload} mapped keys still referenced")]
    ExcessPayload { payload: usize },

    #[error("mapped key space exhausted")]
    KeySpaceExhausted,

    #[error("dirty counter for newly assigned key {key:#x}")]
    DirtyCounter { key: i32 },
}

impl MatrixError {
    /// Allocation failures leave the structure untouched.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            MatrixError::OutOfMemory { .. } | MatrixError::CapacityTooLarge { .. }
        )
    }
}
