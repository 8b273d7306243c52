pub mod harvest;
pub mod search;

use scholia_common::ApiError;
use scholia_db::DbError;

/// Storage failures are never the client's fault.
pub(crate) fn internal(err: DbError) -> ApiError {
    ApiError::Internal(err.to_string())
}
