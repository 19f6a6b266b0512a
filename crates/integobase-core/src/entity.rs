use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EntityKind, JobId, SourceKind};

/// Idempotency key for upserts: at most one [`Entity`] exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub source: SourceKind,
    pub kind: EntityKind,
    pub source_id: String,
}

impl EntityKey {
    pub fn new(source: SourceKind, kind: EntityKind, source_id: impl Into<String>) -> Self {
        Self {
            source,
            kind,
            source_id: source_id.into(),
        }
    }

    pub fn job(&self) -> JobId {
        JobId::new(self.source, self.kind)
    }
}

/// How a dependent record names its parent before it is resolved to a local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum ParentKey {
    /// The parent's identifier in its own source.
    SourceId(String),
    /// A business identifier the parent carries as [`Entity::natural_key`]
    /// (client account numbers, shared across sources).
    NaturalKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub source: SourceKind,
    pub kind: EntityKind,
    pub key: ParentKey,
}

impl ParentRef {
    pub fn by_source_id(source: SourceKind, kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            source,
            kind,
            key: ParentKey::SourceId(id.into()),
        }
    }

    pub fn by_natural_key(source: SourceKind, kind: EntityKind, key: impl Into<String>) -> Self {
        Self {
            source,
            kind,
            key: ParentKey::NaturalKey(key.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClientFields {
    pub name: String,
    pub account_number: String,
    pub contract_type: Option<String>,
    pub billing_plan: Option<String>,
    pub support_level: Option<String>,
    pub phone_number: Option<String>,
    pub client_start_date: Option<String>,
    pub domains: Vec<String>,
    pub company_owner: Option<String>,
    pub business_type: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContactFields {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub title: Option<String>,
    pub work_phone: Option<String>,
    pub mobile_phone: Option<String>,
    pub status: String,
    pub other_emails: Vec<String>,
    pub address: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketFields {
    pub subject: String,
    pub status: i64,
    pub last_updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub total_hours_spent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SiteFields {
    pub name: String,
    pub account_number: Option<String>,
    pub portal_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AssetFields {
    pub hostname: String,
    pub friendly_name: Option<String>,
    pub device_type: Option<String>,
    pub billing_type: String,
    pub operating_system: Option<String>,
    pub status: String,
    pub date_added: Option<DateTime<Utc>>,
    pub backup_data_bytes: u64,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
    pub last_logged_in_user: Option<String>,
    pub domain: Option<String>,
    pub is_64_bit: Option<bool>,
    pub is_online: Option<bool>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_reboot: Option<DateTime<Utc>>,
    pub last_audit_date: Option<DateTime<Utc>>,
    pub udf: serde_json::Value,
    pub antivirus: serde_json::Value,
    pub patch_management: serde_json::Value,
    pub portal_url: Option<String>,
    pub web_remote_url: Option<String>,
}

/// Type-specific payload of a persisted entity, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityFields {
    Client(ClientFields),
    Contact(ContactFields),
    Ticket(TicketFields),
    Site(SiteFields),
    Asset(AssetFields),
}

impl EntityFields {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityFields::Client(_) => EntityKind::Client,
            EntityFields::Contact(_) => EntityKind::Contact,
            EntityFields::Ticket(_) => EntityKind::Ticket,
            EntityFields::Site(_) => EntityKind::Site,
            EntityFields::Asset(_) => EntityKind::Asset,
        }
    }

    /// Human label used by the read API listings.
    pub fn display_name(&self) -> &str {
        match self {
            EntityFields::Client(c) => &c.name,
            EntityFields::Contact(c) => &c.email,
            EntityFields::Ticket(t) => &t.subject,
            EntityFields::Site(s) => &s.name,
            EntityFields::Asset(a) => &a.hostname,
        }
    }
}

/// Canonical persisted representation of a synchronized business object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub key: EntityKey,
    pub parent_id: Option<Uuid>,
    pub natural_key: Option<String>,
    pub source_modified_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    pub version: i64,
    pub fields: EntityFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
