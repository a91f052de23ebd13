//! Store errors.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Cannot deep-merge into reference attribute {attr_id}")]
    MergeOnRef { attr_id: String },

    #[error("Invalid tx-step: {0}")]
    InvalidTxStep(String),

    #[error("Unknown tx-step action: {0}")]
    UnknownAction(String),

    #[error("Invalid query: {0}")]
    Query(String),

    #[error("Unsupported store snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
