use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod classify;
mod normalize;

pub use classify::{
    ChangeCategory, ChangeRecord, PayloadSummary, PendingKey, classify, group_pending, summarize,
};
pub use normalize::{bracketed_title, normalize_city, normalize_text};

pub type WorkId = i64;
pub type TicketId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Active,
    Pending,
    Expired,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Expired => "expired",
        }
    }
}

impl std::str::FromStr for TicketStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "active" => Ok(Self::Active),
            "pending" => Ok(Self::Pending),
            "expired" => Ok(Self::Expired),
            other => Err(format!(
                "invalid ticket status '{other}', expected one of: active, pending, expired"
            )),
        }
    }
}

/// One sellable time-slot offering under a work. The id is unique across the
/// whole catalog and never changes work ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketLine {
    pub id: TicketId,
    pub work_id: WorkId,
    pub title: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: TicketStatus,
    pub total: Option<u32>,
    pub remaining: Option<u32>,
    pub price: Option<f64>,
    /// Sale-opens time; only meaningful while `status` is `pending` and may
    /// be unknown even then.
    pub valid_from: Option<DateTime<Utc>>,
}

impl TicketLine {
    /// Upstream rows carrying neither a title nor a capacity are treated as
    /// malformed and dropped before classification.
    pub fn is_malformed(&self) -> bool {
        self.title.trim().is_empty() && self.total.is_none()
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Hash of the canonical JSON form (object keys sorted recursively), so the
/// same logical payload always hashes identically regardless of key order.
pub fn payload_hash(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    content_hash(canonical.as_bytes())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn payload_hash_ignores_object_key_order() {
        let left = json!({"b": 1, "a": {"y": [1, 2], "x": "v"}});
        let right = json!({"a": {"x": "v", "y": [1, 2]}, "b": 1});
        assert_eq!(payload_hash(&left), payload_hash(&right));
    }

    #[test]
    fn payload_hash_distinguishes_array_order() {
        let left = json!({"a": [1, 2]});
        let right = json!({"a": [2, 1]});
        assert_ne!(payload_hash(&left), payload_hash(&right));
    }

    #[test]
    fn ticket_status_round_trips_through_str() {
        for status in [
            TicketStatus::Active,
            TicketStatus::Pending,
            TicketStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<TicketStatus>(), Ok(status));
        }
        assert!("sold_out".parse::<TicketStatus>().is_err());
    }

    #[test]
    fn malformed_requires_both_title_and_capacity_missing() {
        let mut line = TicketLine {
            id: "t1".to_owned(),
            work_id: 1,
            title: String::new(),
            start_time: None,
            end_time: None,
            status: TicketStatus::Active,
            total: None,
            remaining: None,
            price: None,
            valid_from: None,
        };
        assert!(line.is_malformed());

        line.total = Some(10);
        assert!(!line.is_malformed());

        line.total = None;
        line.title = "some show".to_owned();
        assert!(!line.is_malformed());
    }
}
