//! Source client contracts and the helpdesk/RMM implementations.
//!
//! A [`SourceClient`] turns one (source, entity kind) pair into a sequence of
//! [`SourcePage`]s. Clients never touch the store; the sync job drives them
//! one page at a time through a [`Pager`].

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use integobase_core::{Checkpoint, EntityKind, PageToken, SourceKind, SourcePage};
use integobase_storage::FetchError;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod datto;
pub mod fixture;
pub mod freshservice;

pub use datto::{DattoClient, DattoConfig};
pub use fixture::FixtureSourceClient;
pub use freshservice::{FreshserviceClient, FreshserviceConfig};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{system} rejected the credentials: {detail}")]
    Auth { system: SourceKind, detail: String },
    #[error("{system} unavailable after {attempts} attempts: {detail}")]
    Unavailable {
        system: SourceKind,
        attempts: usize,
        detail: String,
    },
    #[error("{system} returned an undecodable page: {detail}")]
    Malformed { system: SourceKind, detail: String },
    #[error("{system} does not provide {kind} records")]
    Unsupported { system: SourceKind, kind: EntityKind },
}

impl SourceError {
    pub fn from_fetch(system: SourceKind, err: FetchError) -> Self {
        match err {
            FetchError::Auth { status, url } => SourceError::Auth {
                system,
                detail: format!("http {status} for {url}"),
            },
            FetchError::Unavailable {
                attempts,
                last_error,
            } => SourceError::Unavailable {
                system,
                attempts,
                detail: last_error,
            },
            FetchError::Decode { url, detail } => SourceError::Malformed {
                system,
                detail: format!("{url}: {detail}"),
            },
            other => SourceError::Unavailable {
                system,
                attempts: 1,
                detail: other.to_string(),
            },
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SourceError::Auth { .. })
    }

    pub fn system(&self) -> SourceKind {
        match self {
            SourceError::Auth { system, .. }
            | SourceError::Unavailable { system, .. }
            | SourceError::Malformed { system, .. }
            | SourceError::Unsupported { system, .. } => *system,
        }
    }
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source(&self) -> SourceKind;

    fn supports(&self, kind: EntityKind) -> bool {
        self.source().entity_kinds().contains(&kind)
    }

    /// Whether `fetch_page` narrows results by the checkpoint watermark.
    /// Non-incremental kinds are fully re-fetched every run.
    fn incremental(&self, kind: EntityKind) -> bool;

    /// Fetches one page. `page == None` requests the first page. A source
    /// reporting not-found for the collection yields an empty terminal page.
    async fn fetch_page(
        &self,
        kind: EntityKind,
        checkpoint: Option<&Checkpoint>,
        page: Option<&PageToken>,
    ) -> Result<SourcePage, SourceError>;
}

/// Lazily walks a source's pages; nothing is requested until `next_page`.
pub struct Pager<'a> {
    client: &'a dyn SourceClient,
    kind: EntityKind,
    checkpoint: Option<Checkpoint>,
    next: Option<PageToken>,
    started: bool,
    pages: u32,
}

impl<'a> Pager<'a> {
    pub fn new(client: &'a dyn SourceClient, kind: EntityKind, checkpoint: Option<Checkpoint>) -> Self {
        Self {
            client,
            kind,
            checkpoint,
            next: None,
            started: false,
            pages: 0,
        }
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages
    }

    pub async fn next_page(&mut self) -> Result<Option<SourcePage>, SourceError> {
        if self.started && self.next.is_none() {
            return Ok(None);
        }
        if !self.client.supports(self.kind) {
            return Err(SourceError::Unsupported {
                system: self.client.source(),
                kind: self.kind,
            });
        }
        let page = self
            .client
            .fetch_page(self.kind, self.checkpoint.as_ref(), self.next.as_ref())
            .await?;
        self.started = true;
        self.pages += 1;
        self.next = page.next.clone();
        Ok(Some(page))
    }
}

/// Source ids arrive as JSON numbers from the helpdesk and strings from the RMM.
pub(crate) fn id_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn parse_rfc3339(value: &JsonValue) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// RMM timestamps are epoch milliseconds.
pub fn parse_epoch_millis(value: &JsonValue) -> Option<DateTime<Utc>> {
    value
        .as_i64()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}
