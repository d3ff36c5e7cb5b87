use serde::{Deserialize, Serialize};

/// Title recorded when the caller does not supply one.
pub const DEFAULT_TITLE: &str = "Untitled Document";

/// A stored markdown document. Immutable once created; `short_code` is the
/// external lookup key, `id` is storage-internal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub short_code: String,
    pub title: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDocument {
    pub content: String,
    pub title: Option<String>,
}
