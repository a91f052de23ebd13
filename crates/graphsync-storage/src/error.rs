#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error on key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error on key {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Backend error: {0}")]
    Backend(String),
}
