pub mod debug_log;
pub mod error;
pub mod hashing;
pub mod mapper;
pub mod mapping;
pub mod sub_matrix;

pub use debug_log::{CollectingLog, DebugLog, TracingLog};
pub use error::MatrixError;
pub use mapper::Mapper;
pub use mapping::Mapping;
pub use sub_matrix::{SubMatrix, SubMatrixLayout};

/// Allocates `len` copies of `value`, reporting failure instead of aborting.
pub(crate) fn try_alloc<T: Clone>(len: usize, value: T) -> Result<Vec<T>, MatrixError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| MatrixError::OutOfMemory { rows: len })?;
    v.resize(len, value);
    Ok(v)
}
