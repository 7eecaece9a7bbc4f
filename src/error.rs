use thiserror::Error;

/// Library-level error for the store/db stack. Ingestion handlers and
/// `main.rs` convert these to `anyhow::Error` / HTTP status codes at the
/// boundary rather than propagating this type outward.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "database at {path} is schema version {found}, this binary supports up to {supported}; \
         upgrade ccpulse or delete/rename the file to start fresh"
    )]
    UnsupportedSchemaVersion {
        path: String,
        found: i64,
        supported: i64,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
