use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_FILE_STEM_CHARS: usize = 120;

/// Identity of a product across runs, derived from its display title.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProductKey(String);

impl ProductKey {
    pub fn from_title(title: &str) -> Self {
        Self(title.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn cache_key(&self) -> String {
        format!("product:{}", self.0)
    }

    /// Filesystem-safe variant of the key. Path separators, reserved
    /// characters and control characters become `_`.
    pub fn file_stem(&self) -> String {
        let cleaned: String = self
            .0
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .take(MAX_FILE_STEM_CHARS)
            .collect();
        let trimmed = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
        if trimmed.is_empty() {
            "product".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One catalogue item as persisted in the data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    #[serde(rename = "product_title")]
    pub title: String,
    #[serde(rename = "product_price")]
    pub price: f64,
    #[serde(rename = "path_to_image", default)]
    pub image_path: Option<String>,
}

impl ProductRecord {
    pub fn key(&self) -> ProductKey {
        ProductKey::from_title(&self.title)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScrapeRequest {
    #[serde(default)]
    pub pages: Option<u32>,
    #[serde(default)]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_scraped: usize,
    pub total_updated: usize,
    pub records_written: usize,
    pub records_skipped: usize,
    pub cache_degraded: usize,
    pub failed_pages: Vec<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
