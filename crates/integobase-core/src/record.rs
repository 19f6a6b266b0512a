use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntityKind, SourceKind};

/// Opaque source-side pagination cursor (page number or next-page URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(pub String);

impl PageToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Raw decoded payload for one entity from one API call.
///
/// Lives only for the duration of a fetch pass; nothing in the store refers
/// to it after reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source: SourceKind,
    pub kind: EntityKind,
    pub source_id: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

impl SourceRecord {
    pub fn new(source: SourceKind, kind: EntityKind, payload: serde_json::Value) -> Self {
        Self {
            source,
            kind,
            source_id: None,
            modified_at: None,
            payload,
        }
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_modified_at(mut self, modified_at: Option<DateTime<Utc>>) -> Self {
        self.modified_at = modified_at;
        self
    }
}

/// One page of records plus the token for the following page, if any.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourcePage {
    pub records: Vec<SourceRecord>,
    pub next: Option<PageToken>,
}

impl SourcePage {
    /// Terminal page: the source reported not-found or nothing left.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}
