use serde::{Deserialize, Serialize};

/// Factual context fetched once per request to ground a generated response.
/// Discarded after prompt assembly; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDocument {
    pub title: String,
    pub summary: String,
    pub content: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSnippet {
    pub title: String,
    pub body: String,
    pub url: String,
}

impl SearchSnippet {
    pub fn has_body(&self) -> bool {
        !self.body.trim().is_empty()
    }
}
