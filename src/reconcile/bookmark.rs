use serde::{Deserialize, Serialize};

use super::Reconcilable;

/// A reading position inside one book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Bookmark {
    pub id: String,

    /// Book the position belongs to
    #[serde(default)]
    pub book_id: String,

    /// Opaque position, e.g. an EPUB CFI
    #[serde(default)]
    pub location: String,

    /// Fraction of the book read, 0.0 to 1.0
    #[serde(default)]
    pub progress: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Unix milliseconds of the last write
    #[serde(default)]
    pub timestamp: i64,
}

impl Bookmark {
    pub fn new(
        id: impl Into<String>,
        book_id: impl Into<String>,
        location: impl Into<String>,
        progress: f64,
    ) -> Self {
        Self {
            id: id.into(),
            book_id: book_id.into(),
            location: location.into(),
            progress: progress.clamp(0.0, 1.0),
            title: None,
            timestamp: 0,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

impl Reconcilable for Bookmark {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn touch(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }

    fn reference(&self) -> Option<&str> {
        (!self.book_id.is_empty()).then_some(self.book_id.as_str())
    }
}
