//! RMM client: sites (with their account-number variable) and devices.
//!
//! Authenticates with the OAuth password grant and caches the bearer token
//! until the API rejects it.

use anyhow::Result;
use async_trait::async_trait;
use integobase_core::{Checkpoint, EntityKind, PageToken, SourceKind, SourcePage, SourceRecord};
use integobase_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{id_string, SourceClient, SourceError};

const SOURCE: SourceKind = SourceKind::Rmm;
const PAGE_SIZE: u32 = 250;
/// Site variable linking an RMM site to a helpdesk client.
pub const ACCOUNT_VARIABLE: &str = "AccountNumber";

#[derive(Debug, Clone)]
pub struct DattoConfig {
    pub api_endpoint: String,
    pub api_key: String,
    pub api_secret: String,
}

impl DattoConfig {
    pub fn new(api_endpoint: &str, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_endpoint: api_endpoint.trim().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

enum Attempt {
    Done(Option<JsonValue>),
    TokenRejected,
}

#[derive(Debug)]
pub struct DattoClient {
    config: DattoConfig,
    http: HttpFetcher,
    token: Mutex<Option<String>>,
}

impl DattoClient {
    pub fn new(config: DattoConfig, http: HttpClientConfig) -> Result<Self> {
        Ok(Self {
            config,
            http: HttpFetcher::new(http)?,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, SourceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let url = format!("{}/auth/oauth/token", self.config.api_endpoint);
        let form = [
            ("grant_type", "password"),
            ("username", self.config.api_key.as_str()),
            ("password", self.config.api_secret.as_str()),
        ];
        let resp = self
            .http
            .send("rmm.token", |c| {
                c.post(&url)
                    .basic_auth("public-client", Some("public"))
                    .form(&form)
            })
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus { status, url } if status == 400 => SourceError::Auth {
                    system: SOURCE,
                    detail: format!("token request refused (http {status}) at {url}"),
                },
                other => SourceError::from_fetch(SOURCE, other),
            })?;
        let token: TokenResponse = resp.json().map_err(|e| SourceError::from_fetch(SOURCE, e))?;
        info!("obtained rmm access token");
        *cached = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    async fn get_once(&self, label: &str, url: &str) -> Result<Attempt, SourceError> {
        let token = self.access_token().await?;
        match self.http.send(label, |c| c.get(url).bearer_auth(&token)).await {
            Ok(resp) => resp
                .json::<JsonValue>()
                .map(|body| Attempt::Done(Some(body)))
                .map_err(|e| SourceError::from_fetch(SOURCE, e)),
            Err(FetchError::NotFound { .. }) => Ok(Attempt::Done(None)),
            Err(FetchError::Auth { .. }) => Ok(Attempt::TokenRejected),
            Err(e) => Err(SourceError::from_fetch(SOURCE, e)),
        }
    }

    /// GETs `url`, refreshing the token once if the cached one was rejected.
    async fn get_json(&self, label: &str, url: &str) -> Result<Option<JsonValue>, SourceError> {
        if let Attempt::Done(body) = self.get_once(label, url).await? {
            return Ok(body);
        }
        debug!("rmm token rejected, re-authenticating");
        self.token.lock().await.take();
        match self.get_once(label, url).await? {
            Attempt::Done(body) => Ok(body),
            Attempt::TokenRejected => Err(SourceError::Auth {
                system: SOURCE,
                detail: format!("bearer token rejected for {url}"),
            }),
        }
    }

    async fn site_account_number(&self, site_uid: &str) -> Result<Option<String>, SourceError> {
        let url = format!("{}/api/v2/site/{site_uid}/variables", self.config.api_endpoint);
        let Some(body) = self.get_json("rmm.site_variables", &url).await? else {
            return Ok(None);
        };
        Ok(site_variable(&body, ACCOUNT_VARIABLE))
    }
}

#[async_trait]
impl SourceClient for DattoClient {
    fn source(&self) -> SourceKind {
        SOURCE
    }

    fn incremental(&self, _kind: EntityKind) -> bool {
        false
    }

    async fn fetch_page(
        &self,
        kind: EntityKind,
        _checkpoint: Option<&Checkpoint>,
        page: Option<&PageToken>,
    ) -> Result<SourcePage, SourceError> {
        let collection = match kind {
            EntityKind::Site => "sites",
            EntityKind::Asset => "devices",
            other => {
                return Err(SourceError::Unsupported {
                    system: SOURCE,
                    kind: other,
                })
            }
        };
        let url = match page {
            Some(token) => token.as_str().to_string(),
            None => format!(
                "{}/api/v2/account/{collection}?max={PAGE_SIZE}",
                self.config.api_endpoint
            ),
        };

        let Some(body) = self.get_json(collection, &url).await? else {
            return Ok(SourcePage::empty());
        };
        let mut records = page_records(kind, &body)?;

        if kind == EntityKind::Site {
            for record in records.iter_mut() {
                let Some(uid) = record.source_id.clone() else {
                    continue;
                };
                let account = self.site_account_number(&uid).await?;
                if let Some(obj) = record.payload.as_object_mut() {
                    obj.insert(
                        "accountNumber".to_string(),
                        account.map(JsonValue::String).unwrap_or(JsonValue::Null),
                    );
                }
            }
        }

        debug!(%kind, records = records.len(), "rmm page fetched");
        Ok(SourcePage {
            records,
            next: next_page_url(&body).map(PageToken::new),
        })
    }
}

/// Splits an RMM list response (`sites` or `devices`) into records. The RMM
/// exposes no reliable modification marker, so none is set.
pub fn page_records(kind: EntityKind, body: &JsonValue) -> Result<Vec<SourceRecord>, SourceError> {
    let field = match kind {
        EntityKind::Site => "sites",
        EntityKind::Asset => "devices",
        other => {
            return Err(SourceError::Unsupported {
                system: SOURCE,
                kind: other,
            })
        }
    };
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
            let record = SourceRecord::new(SOURCE, kind, item.clone());
            match item.get("uid").and_then(id_string) {
                Some(uid) => record.with_source_id(uid),
                None => record,
            }
        })
        .collect())
}

pub fn next_page_url(body: &JsonValue) -> Option<String> {
    body.pointer("/pageDetails/nextPageUrl")
        .or_else(|| body.get("nextPageUrl"))
        .and_then(JsonValue::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn site_variable(body: &JsonValue, name: &str) -> Option<String> {
    body.get("variables")?
        .as_array()?
        .iter()
        .find(|v| v.get("name").and_then(JsonValue::as_str) == Some(name))
        .and_then(|v| v.get("value"))
        .and_then(id_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn next_page_url_reads_page_details() {
        let body = json!({"pageDetails": {"nextPageUrl": "https://rmm/api/v2/account/sites?page=2"}});
        assert_eq!(
            next_page_url(&body).as_deref(),
            Some("https://rmm/api/v2/account/sites?page=2")
        );
        assert_eq!(next_page_url(&json!({"pageDetails": {"nextPageUrl": null}})), None);
        assert_eq!(next_page_url(&json!({"pageDetails": {"nextPageUrl": ""}})), None);
    }

    #[test]
    fn account_variable_is_picked_by_name() {
        let body = json!({"variables": [
            {"name": "Other", "value": "x"},
            {"name": "AccountNumber", "value": "A-100"}
        ]});
        assert_eq!(site_variable(&body, ACCOUNT_VARIABLE).as_deref(), Some("A-100"));
        assert_eq!(site_variable(&json!({"variables": []}), ACCOUNT_VARIABLE), None);
    }

    #[test]
    fn device_records_use_uid() {
        let body = json!({"devices": [{"uid": "dev-1", "hostname": "srv01"}]});
        let records = page_records(EntityKind::Asset, &body).unwrap();
        assert_eq!(records[0].source_id.as_deref(), Some("dev-1"));
        assert!(records[0].modified_at.is_none());
    }
}
