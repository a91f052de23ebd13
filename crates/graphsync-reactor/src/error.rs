//! Error types for the reactor.

use graphsync_store::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Failures lowering edit ops into tx-steps.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("lookup must be an object with a single unique attr and value, got {0}")]
    InvalidLookup(String),

    #[error("{0} is not a unique attribute")]
    NotUnique(String),

    #[error("{0} does not reference a valid link attribute")]
    NotALink(String),

    #[error("{0} is not a valid lookup attribute")]
    InvalidRefLookup(String),

    #[error("invalid edit op: {0}")]
    InvalidOp(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Structured body the server attaches to a rejected transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<Value>,
}

/// Why a mutation's result future rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MutationError {
    /// Validation or permission failure reported by the server.
    #[error("transaction rejected ({status}): {}", body.message)]
    Api { status: u16, body: ApiErrorBody },

    /// Client-side failure without a server error type (e.g. a transform error).
    #[error("{message}")]
    Client { message: String, hint: Option<Value> },

    #[error("transaction timed out")]
    Timeout,

    /// The pipeline was dropped before the mutation resolved.
    #[error("mutation abandoned")]
    Abandoned,
}

/// What the mutation-error channel receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationErrorDetails {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<Value>,
}

/// Top-level reactor error.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ReactorError>;
