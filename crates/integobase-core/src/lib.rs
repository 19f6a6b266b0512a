//! Core domain model for the Integobase sync engine.
//!
//! Everything the source clients, the reconciler and the store agree on lives
//! here: source/entity identifiers, raw page records, canonical entities and
//! the run/checkpoint bookkeeping.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod entity;
mod record;
mod run;

pub use entity::{
    AssetFields, ClientFields, ContactFields, Entity, EntityFields, EntityKey, ParentKey,
    ParentRef, SiteFields, TicketFields,
};
pub use record::{PageToken, SourcePage, SourceRecord};
pub use run::{
    next_watermark, Checkpoint, RecordError, RecordErrorKind, RunCounts, RunOutcome, RunTrigger,
    SyncRun,
};

/// External system a record was pulled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Ticketing platform (companies, requesters, tickets).
    Helpdesk,
    /// Remote monitoring and management platform (sites, devices).
    Rmm,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Helpdesk, SourceKind::Rmm];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Helpdesk => "helpdesk",
            SourceKind::Rmm => "rmm",
        }
    }

    /// Entity kinds this source is authoritative for.
    pub fn entity_kinds(&self) -> &'static [EntityKind] {
        match self {
            SourceKind::Helpdesk => &[EntityKind::Client, EntityKind::Contact, EntityKind::Ticket],
            SourceKind::Rmm => &[EntityKind::Site, EntityKind::Asset],
        }
    }
}

/// Canonical business object type persisted by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Client,
    Contact,
    Ticket,
    Site,
    Asset,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Client,
        EntityKind::Contact,
        EntityKind::Ticket,
        EntityKind::Site,
        EntityKind::Asset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Client => "client",
            EntityKind::Contact => "contact",
            EntityKind::Ticket => "ticket",
            EntityKind::Site => "site",
            EntityKind::Asset => "asset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what} `{value}`")]
pub struct ParseIdError {
    pub what: &'static str,
    pub value: String,
}

impl FromStr for SourceKind {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseIdError {
                what: "source",
                value: s.to_string(),
            })
    }
}

impl FromStr for EntityKind {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Accept the plural route form (`clients`) as well as the singular.
        let singular = s.strip_suffix('s').unwrap_or(s);
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s) || k.as_str().eq_ignore_ascii_case(singular))
            .ok_or_else(|| ParseIdError {
                what: "entity kind",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One synchronizable (source, entity kind) pair. Every Sync Job, checkpoint
/// and run history entry is scoped to exactly one `JobId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    pub source: SourceKind,
    pub kind: EntityKind,
}

impl JobId {
    pub const fn new(source: SourceKind, kind: EntityKind) -> Self {
        Self { source, kind }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.kind)
    }
}

impl FromStr for JobId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, kind) = s
            .split_once(['/', '.'])
            .ok_or_else(|| ParseIdError {
                what: "job id",
                value: s.to_string(),
            })?;
        Ok(JobId::new(source.parse()?, kind.parse()?))
    }
}
