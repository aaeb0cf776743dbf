//! Maps `rusqlite`/`r2d2` failures onto the shared [`sa_domain::error::Error`]
//! taxonomy so callers never see a storage-crate-specific error type.

use sa_domain::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn map_rusqlite(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

pub(crate) fn map_pool(e: r2d2::Error) -> Error {
    Error::Storage(format!("connection pool: {e}"))
}
