pub mod jwks_cache;
pub mod permission_cache;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache operation failed: {0}")]
    OperationFailed(String),
}
