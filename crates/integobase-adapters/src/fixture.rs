//! Offline client replaying recorded API responses.
//!
//! Layout: `<root>/<source>/<kind>.json` holding `{"pages": [<raw body>, ...]}`.
//! Bodies go through the same record extraction as the live clients, so the
//! recorded files must already include the per-item enrichment (ticket time
//! entries, site account numbers).

use std::path::PathBuf;

use async_trait::async_trait;
use integobase_core::{Checkpoint, EntityKind, PageToken, SourceKind, SourcePage};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{datto, freshservice, SourceClient, SourceError};

#[derive(Debug, Deserialize)]
struct RecordedPages {
    pages: Vec<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct FixtureSourceClient {
    source: SourceKind,
    root: PathBuf,
}

impl FixtureSourceClient {
    pub fn new(source: SourceKind, root: impl Into<PathBuf>) -> Self {
        Self {
            source,
            root: root.into(),
        }
    }

    fn path_for(&self, kind: EntityKind) -> PathBuf {
        self.root
            .join(self.source.as_str())
            .join(format!("{}.json", kind.as_str()))
    }
}

#[async_trait]
impl SourceClient for FixtureSourceClient {
    fn source(&self) -> SourceKind {
        self.source
    }

    fn incremental(&self, kind: EntityKind) -> bool {
        self.source == SourceKind::Helpdesk && kind == EntityKind::Ticket
    }

    async fn fetch_page(
        &self,
        kind: EntityKind,
        checkpoint: Option<&Checkpoint>,
        page: Option<&PageToken>,
    ) -> Result<SourcePage, SourceError> {
        let path = self.path_for(kind);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no recorded pages");
                return Ok(SourcePage::empty());
            }
            Err(err) => {
                return Err(SourceError::Unavailable {
                    system: self.source,
                    attempts: 1,
                    detail: format!("reading {}: {err}", path.display()),
                })
            }
        };
        let recorded: RecordedPages =
            serde_json::from_str(&raw).map_err(|err| SourceError::Malformed {
                system: self.source,
                detail: format!("{}: {err}", path.display()),
            })?;

        let index: usize = match page {
            Some(token) => token.as_str().parse().map_err(|_| SourceError::Malformed {
                system: self.source,
                detail: format!("bad page token `{}`", token.as_str()),
            })?,
            None => 0,
        };
        let Some(body) = recorded.pages.get(index) else {
            return Ok(SourcePage::empty());
        };

        let mut records = match self.source {
            SourceKind::Helpdesk => freshservice::page_records(kind, body)?,
            SourceKind::Rmm => datto::page_records(kind, body)?,
        };
        let watermark = checkpoint.and_then(|c| c.watermark);
        if let (true, Some(watermark)) = (self.incremental(kind), watermark) {
            records.retain(|r| r.modified_at.map_or(true, |m| m > watermark));
        }

        let next = (index + 1 < recorded.pages.len()).then(|| PageToken::new((index + 1).to_string()));
        Ok(SourcePage { records, next })
    }
}
