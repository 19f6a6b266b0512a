//! Helpdesk client: departments (clients), requesters (contacts) and closed
//! tickets with their logged time.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use integobase_core::{Checkpoint, EntityKind, PageToken, SourceKind, SourcePage, SourceRecord};
use integobase_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{id_string, parse_rfc3339, SourceClient, SourceError};

const SOURCE: SourceKind = SourceKind::Helpdesk;
/// Freshservice status code for closed tickets.
const CLOSED_STATUS: i64 = 5;

#[derive(Debug, Clone)]
pub struct FreshserviceConfig {
    pub base_url: String,
    pub api_key: String,
    pub per_page: u32,
    pub initial_lookback_days: i64,
}

impl FreshserviceConfig {
    /// Accepts a bare tenant domain (`acme.freshservice.com`) or a full URL.
    pub fn for_domain(domain: &str, api_key: impl Into<String>) -> Self {
        let domain = domain.trim().trim_end_matches('/');
        let base_url = if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.to_string()
        } else {
            format!("https://{domain}")
        };
        Self {
            base_url,
            api_key: api_key.into(),
            per_page: 100,
            initial_lookback_days: 365,
        }
    }
}

#[derive(Debug)]
pub struct FreshserviceClient {
    config: FreshserviceConfig,
    http: HttpFetcher,
}

impl FreshserviceClient {
    pub fn new(config: FreshserviceConfig, http: HttpClientConfig) -> Result<Self> {
        Ok(Self {
            config,
            http: HttpFetcher::new(http)?,
        })
    }

    async fn get_json(
        &self,
        label: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<JsonValue>, SourceError> {
        let url = format!("{}{}", self.config.base_url, path);
        let sent = self
            .http
            .send(label, |c| {
                c.get(&url)
                    .basic_auth(&self.config.api_key, Some("X"))
                    .query(query)
            })
            .await;
        match sent {
            Ok(resp) => resp
                .json::<JsonValue>()
                .map(Some)
                .map_err(|e| SourceError::from_fetch(SOURCE, e)),
            Err(FetchError::NotFound { url }) => {
                debug!(%url, "helpdesk collection not found");
                Ok(None)
            }
            Err(e) => Err(SourceError::from_fetch(SOURCE, e)),
        }
    }

    async fn time_entries(&self, ticket_id: &str) -> Result<JsonValue, SourceError> {
        let path = format!("/api/v2/tickets/{ticket_id}/time_entries");
        let body = self.get_json("helpdesk.time_entries", &path, &[]).await?;
        Ok(body
            .and_then(|mut b| b.get_mut("time_entries").map(JsonValue::take))
            .unwrap_or_else(|| JsonValue::Array(Vec::new())))
    }

    fn ticket_query(&self, checkpoint: Option<&Checkpoint>) -> String {
        let since = checkpoint
            .and_then(|c| c.watermark)
            .unwrap_or_else(|| Utc::now() - Duration::days(self.config.initial_lookback_days));
        format!(
            "\"(updated_at:>'{}' AND status:{CLOSED_STATUS})\"",
            since.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

#[async_trait]
impl SourceClient for FreshserviceClient {
    fn source(&self) -> SourceKind {
        SOURCE
    }

    fn incremental(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Ticket
    }

    async fn fetch_page(
        &self,
        kind: EntityKind,
        checkpoint: Option<&Checkpoint>,
        page: Option<&PageToken>,
    ) -> Result<SourcePage, SourceError> {
        let page_no: u32 = match page {
            Some(token) => token.as_str().parse().map_err(|_| SourceError::Malformed {
                system: SOURCE,
                detail: format!("bad page token `{}`", token.as_str()),
            })?,
            None => 1,
        };
        let mut query = vec![
            ("page", page_no.to_string()),
            ("per_page", self.config.per_page.to_string()),
        ];
        let path = match kind {
            EntityKind::Client => "/api/v2/departments",
            EntityKind::Contact => "/api/v2/requesters",
            EntityKind::Ticket => {
                query.push(("query", self.ticket_query(checkpoint)));
                "/api/v2/tickets/filter"
            }
            other => {
                return Err(SourceError::Unsupported {
                    system: SOURCE,
                    kind: other,
                })
            }
        };

        let Some(body) = self.get_json(path, path, &query).await? else {
            return Ok(SourcePage::empty());
        };
        let mut records = page_records(kind, &body)?;

        if kind == EntityKind::Ticket {
            for record in records.iter_mut() {
                let Some(id) = record.source_id.clone() else {
                    continue;
                };
                let entries = self.time_entries(&id).await?;
                if let Some(obj) = record.payload.as_object_mut() {
                    obj.insert("time_entries".to_string(), entries);
                }
            }
        }

        let next = (!records.is_empty()).then(|| PageToken::new((page_no + 1).to_string()));
        debug!(%kind, page = page_no, records = records.len(), "helpdesk page fetched");
        Ok(SourcePage { records, next })
    }
}

fn collection_field(kind: EntityKind) -> Result<&'static str, SourceError> {
    match kind {
        EntityKind::Client => Ok("departments"),
        EntityKind::Contact => Ok("requesters"),
        EntityKind::Ticket => Ok("tickets"),
        other => Err(SourceError::Unsupported {
            system: SOURCE,
            kind: other,
        }),
    }
}

/// Splits a helpdesk list response into records. Items keep their raw shape;
/// an item without an id still yields a record so it can be rejected and
/// counted downstream.
pub fn page_records(kind: EntityKind, body: &JsonValue) -> Result<Vec<SourceRecord>, SourceError> {
    let field = collection_field(kind)?;
    let items = body
        .get(field)
        .and_then(JsonValue::as_array)
        .ok_or_else(|| SourceError::Malformed {
            system: SOURCE,
            detail: format!("response has no `{field}` array"),
        })?;

    Ok(items
        .iter()
        .map(|item| {
            let record = SourceRecord::new(SOURCE, kind, item.clone())
                .with_modified_at(item.get("updated_at").and_then(parse_rfc3339));
            match item.get("id").and_then(id_string) {
                Some(id) => record.with_source_id(id),
                None => record,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn domain_is_normalised_to_https_base() {
        let cfg = FreshserviceConfig::for_domain("acme.freshservice.com/", "k");
        assert_eq!(cfg.base_url, "https://acme.freshservice.com");
        let cfg = FreshserviceConfig::for_domain("http://127.0.0.1:9000", "k");
        assert_eq!(cfg.base_url, "http://127.0.0.1:9000");
    }

    #[test]
    fn records_carry_id_and_marker() {
        let body = json!({"departments": [
            {"id": 11, "name": "Acme", "updated_at": "2025-02-01T10:00:00Z"},
            {"name": "No Id"}
        ]});
        let records = page_records(EntityKind::Client, &body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source_id.as_deref(), Some("11"));
        assert!(records[0].modified_at.is_some());
        assert!(records[1].source_id.is_none());
    }

    #[test]
    fn missing_collection_is_malformed() {
        let err = page_records(EntityKind::Ticket, &json!({"oops": true})).unwrap_err();
        assert!(matches!(err, SourceError::Malformed { .. }));
    }
}
