//! Per-kind schemas turning raw source payloads into typed entity fields.
//!
//! Mapping is all-or-nothing: a record either yields a complete
//! [`EntityDraft`] or is rejected with a reason. Nothing partial is stored.

use chrono::{DateTime, Utc};
use integobase_adapters::parse_epoch_millis;
use integobase_core::{
    AssetFields, ClientFields, ContactFields, EntityFields, EntityKey, EntityKind, ParentRef,
    SiteFields, SourceKind, SourceRecord, TicketFields,
};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// Hours booked on a closed ticket with no time entries.
pub const DEFAULT_TICKET_HOURS: f64 = 0.25;
const CLOSED_STATUS: i64 = 5;
const BACKUP_UDF: &str = "udf6";
const SERVER_TYPE_UDF: &str = "udf7";

/// A validated record ready for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDraft {
    pub key: EntityKey,
    pub fields: EntityFields,
    pub parent: Option<ParentRef>,
    pub natural_key: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mapped {
    Valid(EntityDraft),
    Invalid {
        source_id: Option<String>,
        reason: String,
    },
}

/// Kinds whose natural key must be unique within one run; later duplicates
/// are rejected.
pub fn unique_natural_key(kind: EntityKind) -> bool {
    kind == EntityKind::Contact
}

pub fn map_record(record: &SourceRecord) -> Mapped {
    let Some(source_id) = record.source_id.clone() else {
        return Mapped::Invalid {
            source_id: None,
            reason: "record has no source id".to_string(),
        };
    };

    let payload = Payload(&record.payload);
    let mapped = match (record.source, record.kind) {
        (SourceKind::Helpdesk, EntityKind::Client) => map_client(payload),
        (SourceKind::Helpdesk, EntityKind::Contact) => map_contact(payload),
        (SourceKind::Helpdesk, EntityKind::Ticket) => map_ticket(payload),
        (SourceKind::Rmm, EntityKind::Site) => map_site(payload),
        (SourceKind::Rmm, EntityKind::Asset) => map_asset(payload),
        (source, kind) => Err(format!("{source} has no schema for {kind}")),
    };

    match mapped {
        Ok((fields, parent, natural_key)) => {
            let content_hash = content_hash(&fields, parent.as_ref(), natural_key.as_deref());
            Mapped::Valid(EntityDraft {
                key: EntityKey::new(record.source, record.kind, source_id),
                fields,
                parent,
                natural_key,
                modified_at: record.modified_at,
                content_hash,
            })
        }
        Err(reason) => Mapped::Invalid {
            source_id: Some(source_id),
            reason,
        },
    }
}

/// SHA-256 over the canonical JSON of everything that ends up persisted.
/// `serde_json` maps are ordered, so equal content always hashes equally.
pub fn content_hash(fields: &EntityFields, parent: Option<&ParentRef>, natural_key: Option<&str>) -> String {
    let canonical = serde_json::json!({
        "fields": fields,
        "parent": parent,
        "natural_key": natural_key,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

type Schema = Result<(EntityFields, Option<ParentRef>, Option<String>), String>;

#[derive(Clone, Copy)]
struct Payload<'a>(&'a JsonValue);

impl<'a> Payload<'a> {
    fn at(&self, pointer: &str) -> Option<&'a JsonValue> {
        self.0.pointer(pointer).filter(|v| !v.is_null())
    }

    fn text(&self, pointer: &str) -> Option<String> {
        match self.at(pointer)? {
            JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn required(&self, pointer: &str) -> Result<String, String> {
        self.text(pointer)
            .ok_or_else(|| format!("missing required field `{}`", pointer.trim_start_matches('/')))
    }

    fn flag(&self, pointer: &str) -> Option<bool> {
        self.at(pointer).and_then(JsonValue::as_bool)
    }

    fn strings(&self, pointer: &str) -> Vec<String> {
        self.at(pointer)
            .and_then(JsonValue::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn timestamp(&self, pointer: &str) -> Option<DateTime<Utc>> {
        self.at(pointer)
            .and_then(JsonValue::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn epoch_millis(&self, pointer: &str) -> Option<DateTime<Utc>> {
        self.at(pointer).and_then(parse_epoch_millis)
    }

    fn raw(&self, pointer: &str) -> JsonValue {
        self.at(pointer).cloned().unwrap_or(JsonValue::Null)
    }
}

fn map_client(p: Payload<'_>) -> Schema {
    let name = p.required("/name")?;
    let account_number = p
        .text("/custom_fields/account_number")
        .ok_or_else(|| format!("client `{name}` has no account number"))?;

    let fields = ClientFields {
        name,
        account_number: account_number.clone(),
        contract_type: p.text("/custom_fields/type_of_client"),
        billing_plan: p.text("/custom_fields/plan_selected"),
        support_level: p.text("/custom_fields/support_level"),
        phone_number: p.text("/custom_fields/company_main_number"),
        client_start_date: p.text("/custom_fields/company_start_date"),
        domains: p.strings("/domains"),
        company_owner: p.text("/head_name"),
        business_type: p.text("/custom_fields/profit_or_non_profit"),
        address: p.text("/custom_fields/address"),
    };
    Ok((EntityFields::Client(fields), None, Some(account_number)))
}

fn map_contact(p: Payload<'_>) -> Schema {
    let email = p.required("/primary_email")?.to_lowercase();
    if !email.contains('@') {
        return Err(format!("`{email}` is not an email address"));
    }
    let active = p.flag("/active").unwrap_or(false);

    let parent = p
        .at("/department_ids/0")
        .and_then(|v| match v {
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
        .map(|dept| ParentRef::by_source_id(SourceKind::Helpdesk, EntityKind::Client, dept));

    let fields = ContactFields {
        first_name: p.text("/first_name"),
        last_name: p.text("/last_name"),
        email: email.clone(),
        title: p.text("/job_title"),
        work_phone: p.text("/work_phone_number"),
        mobile_phone: p.text("/mobile_phone_number"),
        status: if active { "Active" } else { "Inactive" }.to_string(),
        other_emails: p.strings("/other_emails"),
        address: p.text("/address"),
        notes: p.text("/description").or_else(|| p.text("/background_information")),
    };
    Ok((EntityFields::Contact(fields), parent, Some(email)))
}

fn map_ticket(p: Payload<'_>) -> Schema {
    let last_updated_at = p
        .timestamp("/updated_at")
        .ok_or_else(|| "ticket has no valid `updated_at`".to_string())?;
    let status = p
        .at("/status")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| "ticket has no numeric `status`".to_string())?;

    let logged: f64 = p
        .at("/time_entries")
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.get("time_spent").and_then(JsonValue::as_str))
                .filter_map(parse_time_spent)
                .sum()
        })
        .unwrap_or(0.0);

    let parent = p
        .text("/department_id")
        .map(|dept| ParentRef::by_source_id(SourceKind::Helpdesk, EntityKind::Client, dept));

    let fields = TicketFields {
        subject: p.text("/subject").unwrap_or_else(|| "No Subject".to_string()),
        status,
        last_updated_at,
        closed_at: (status == CLOSED_STATUS).then_some(last_updated_at),
        total_hours_spent: if logged > 0.0 { logged } else { DEFAULT_TICKET_HOURS },
    };
    Ok((EntityFields::Ticket(fields), parent, None))
}

fn map_site(p: Payload<'_>) -> Schema {
    let name = p.required("/name")?;
    let account_number = p.text("/accountNumber");
    let parent = account_number
        .clone()
        .map(|account| ParentRef::by_natural_key(SourceKind::Helpdesk, EntityKind::Client, account));

    let fields = SiteFields {
        name,
        account_number,
        portal_url: p.text("/portalUrl"),
    };
    Ok((EntityFields::Site(fields), parent, None))
}

fn map_asset(p: Payload<'_>) -> Schema {
    let hostname = p.required("/hostname")?;
    let site_uid = p.required("/siteUid")?;
    let device_type = p.text("/deviceType/category");

    let billing_type = match device_type.as_deref() {
        Some("Server") if p.text(&format!("/udf/{SERVER_TYPE_UDF}")).as_deref() == Some("VM") => "VM",
        Some("Server") => "Server",
        _ => "Workstation",
    };
    let backup_data_bytes = p
        .text(&format!("/udf/{BACKUP_UDF}"))
        .filter(|v| v.chars().all(|c| c.is_ascii_digit()))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let udf = match p.at("/udf") {
        Some(v) => v.clone(),
        None => JsonValue::Object(Default::default()),
    };

    let fields = AssetFields {
        hostname,
        friendly_name: p.text("/description"),
        device_type,
        billing_type: billing_type.to_string(),
        operating_system: p.text("/operatingSystem"),
        status: "Active".to_string(),
        date_added: p.epoch_millis("/creationDate"),
        backup_data_bytes,
        internal_ip: p.text("/intIpAddress"),
        external_ip: p.text("/extIpAddress"),
        last_logged_in_user: p.text("/lastLoggedInUser"),
        domain: p.text("/domain"),
        is_64_bit: p.flag("/a64Bit"),
        is_online: p.flag("/online"),
        last_seen: p.epoch_millis("/lastSeen"),
        last_reboot: p.epoch_millis("/lastReboot"),
        last_audit_date: p.epoch_millis("/lastAuditDate"),
        udf,
        antivirus: p.raw("/antivirus"),
        patch_management: p.raw("/patchManagement"),
        portal_url: p.text("/portalUrl"),
        web_remote_url: p.text("/webRemoteUrl"),
    };
    let parent = ParentRef::by_source_id(SourceKind::Rmm, EntityKind::Site, site_uid);
    Ok((EntityFields::Asset(fields), Some(parent), None))
}

/// `H:MM` or `H:MM:SS` to fractional hours.
pub fn parse_time_spent(value: &str) -> Option<f64> {
    let parts: Vec<u32> = value
        .trim()
        .split(':')
        .map(|p| p.parse().ok())
        .collect::<Option<Vec<_>>>()?;
    match parts.as_slice() {
        [h, m] => Some(*h as f64 + *m as f64 / 60.0),
        [h, m, s] => Some(*h as f64 + *m as f64 / 60.0 + *s as f64 / 3600.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(source: SourceKind, kind: EntityKind, payload: JsonValue) -> SourceRecord {
        let id = payload
            .get("id")
            .or_else(|| payload.get("uid"))
            .map(|v| v.to_string().trim_matches('"').to_string());
        let record = SourceRecord::new(source, kind, payload);
        match id {
            Some(id) => record.with_source_id(id),
            None => record,
        }
    }

    fn valid(mapped: Mapped) -> EntityDraft {
        match mapped {
            Mapped::Valid(draft) => draft,
            Mapped::Invalid { reason, .. } => panic!("expected valid record, got: {reason}"),
        }
    }

    #[test]
    fn client_requires_account_number() {
        let ok = valid(map_record(&record(
            SourceKind::Helpdesk,
            EntityKind::Client,
            json!({"id": 1, "name": "Acme", "domains": ["acme.example"],
                   "custom_fields": {"account_number": 1001, "plan_selected": "Gold"}}),
        )));
        assert_eq!(ok.natural_key.as_deref(), Some("1001"));
        match ok.fields {
            EntityFields::Client(c) => {
                assert_eq!(c.billing_plan.as_deref(), Some("Gold"));
                assert_eq!(c.domains, vec!["acme.example"]);
            }
            other => panic!("unexpected fields {other:?}"),
        }

        let missing = map_record(&record(
            SourceKind::Helpdesk,
            EntityKind::Client,
            json!({"id": 2, "name": "NoAcct", "custom_fields": {}}),
        ));
        assert!(matches!(missing, Mapped::Invalid { source_id: Some(ref id), .. } if id == "2"));
    }

    #[test]
    fn contact_links_first_department_and_keeps_inactive() {
        let draft = valid(map_record(&record(
            SourceKind::Helpdesk,
            EntityKind::Contact,
            json!({"id": 9, "primary_email": "Ada@Example.com", "active": false,
                   "department_ids": [77, 78]}),
        )));
        assert_eq!(
            draft.parent,
            Some(ParentRef::by_source_id(SourceKind::Helpdesk, EntityKind::Client, "77"))
        );
        assert_eq!(draft.natural_key.as_deref(), Some("ada@example.com"));
        match draft.fields {
            EntityFields::Contact(c) => assert_eq!(c.status, "Inactive"),
            other => panic!("unexpected fields {other:?}"),
        }
    }

    #[test]
    fn ticket_hours_sum_entries_or_default() {
        let logged = valid(map_record(&record(
            SourceKind::Helpdesk,
            EntityKind::Ticket,
            json!({"id": 5, "status": 5, "updated_at": "2025-01-01T00:00:00Z",
                   "time_entries": [{"time_spent": "01:30"}, {"time_spent": "00:15:00"}, {"time_spent": "bad"}]}),
        )));
        match logged.fields {
            EntityFields::Ticket(t) => {
                assert!((t.total_hours_spent - 1.75).abs() < 1e-9);
                assert!(t.closed_at.is_some());
            }
            other => panic!("unexpected fields {other:?}"),
        }

        let empty = valid(map_record(&record(
            SourceKind::Helpdesk,
            EntityKind::Ticket,
            json!({"id": 6, "status": 5, "updated_at": "2025-01-01T00:00:00Z", "subject": "x"}),
        )));
        match empty.fields {
            EntityFields::Ticket(t) => assert_eq!(t.total_hours_spent, DEFAULT_TICKET_HOURS),
            other => panic!("unexpected fields {other:?}"),
        }
        assert!(empty.parent.is_none());
    }

    #[test]
    fn asset_billing_type_follows_category_and_udf() {
        let base = |category: &str, udf: JsonValue| {
            valid(map_record(&record(
                SourceKind::Rmm,
                EntityKind::Asset,
                json!({"uid": "d1", "hostname": "h", "siteUid": "s1",
                       "deviceType": {"category": category}, "udf": udf,
                       "creationDate": 1_700_000_000_000i64}),
            )))
        };
        let billing = |draft: EntityDraft| match draft.fields {
            EntityFields::Asset(a) => (a.billing_type, a.backup_data_bytes, a.date_added.is_some()),
            other => panic!("unexpected fields {other:?}"),
        };

        assert_eq!(billing(base("Server", json!({"udf7": "VM", "udf6": "2048"}))), ("VM".into(), 2048, true));
        assert_eq!(billing(base("Server", json!({}))), ("Server".into(), 0, true));
        assert_eq!(billing(base("Laptop", json!({"udf6": "12GB"}))), ("Workstation".into(), 0, true));
    }

    #[test]
    fn asset_without_site_is_invalid() {
        let mapped = map_record(&record(
            SourceKind::Rmm,
            EntityKind::Asset,
            json!({"uid": "d2", "hostname": "orphan"}),
        ));
        assert!(matches!(mapped, Mapped::Invalid { .. }));
    }

    #[test]
    fn site_parent_is_client_account_number() {
        let draft = valid(map_record(&record(
            SourceKind::Rmm,
            EntityKind::Site,
            json!({"uid": "s1", "name": "HQ", "accountNumber": "NW-1"}),
        )));
        assert_eq!(
            draft.parent,
            Some(ParentRef::by_natural_key(SourceKind::Helpdesk, EntityKind::Client, "NW-1"))
        );
    }

    #[test]
    fn record_without_id_is_invalid() {
        let mapped = map_record(&SourceRecord::new(
            SourceKind::Helpdesk,
            EntityKind::Client,
            json!({"name": "ghost"}),
        ));
        assert!(matches!(mapped, Mapped::Invalid { source_id: None, .. }));
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let a = EntityFields::Site(SiteFields {
            name: "HQ".into(),
            account_number: None,
            portal_url: None,
        });
        let b = EntityFields::Site(SiteFields {
            name: "HQ2".into(),
            account_number: None,
            portal_url: None,
        });
        assert_eq!(content_hash(&a, None, None), content_hash(&a, None, None));
        assert_ne!(content_hash(&a, None, None), content_hash(&b, None, None));
        assert_eq!(content_hash(&a, None, None).len(), 64);
    }

    #[test]
    fn time_spent_formats() {
        assert_eq!(parse_time_spent("02:30"), Some(2.5));
        assert_eq!(parse_time_spent("00:00:36"), Some(0.01));
        assert_eq!(parse_time_spent("1h"), None);
    }
}
