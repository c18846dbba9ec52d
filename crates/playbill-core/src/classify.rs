use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TicketId, TicketLine, TicketStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCategory {
    /// Ticket id not seen before for this work.
    New,
    /// Total capacity grew, including from zero or unknown.
    Add,
    /// Remaining count came back from zero or unknown while capacity held.
    Return,
    /// Watched line lost remaining seats.
    Sold,
    /// Watched line gained remaining seats without qualifying as a return.
    Back,
    /// Line is awaiting its sale-open time; bucketed by `valid_from`.
    Pending,
}

impl ChangeCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Add => "add",
            Self::Return => "return",
            Self::Sold => "sold",
            Self::Back => "back",
            Self::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub ticket_id: TicketId,
    pub category: ChangeCategory,
    pub old_total: Option<u32>,
    pub old_remaining: Option<u32>,
    pub new_total: Option<u32>,
    pub new_remaining: Option<u32>,
    /// Sale-open bucket key, populated only for `Pending` records. `None`
    /// means the source has not announced the sale-open time yet.
    pub valid_from: Option<DateTime<Utc>>,
}

/// Categorize the fresh ticket lines of one work against the previously
/// reconciled set. Pure function: no side effects, and identical inputs
/// always produce the identical record sequence, in `current` order.
///
/// `previous = None` means the work has never been reconciled; every line is
/// then new. `watched` carries the ticket ids an external subscription system
/// is tracking; sold/back movements are only reported for those.
pub fn classify(
    previous: Option<&HashMap<TicketId, TicketLine>>,
    current: &[TicketLine],
    watched: &HashSet<TicketId>,
) -> Vec<ChangeRecord> {
    let mut records = Vec::new();

    for line in current {
        if line.is_malformed() {
            continue;
        }

        let old = previous.and_then(|lines| lines.get(&line.id));
        let category = match old {
            None => Some(ChangeCategory::New),
            Some(old) => delta_category(old, line, watched.contains(&line.id)),
        };
        let Some(category) = category else {
            continue;
        };

        let category = reroute_pending(category, line);
        records.push(ChangeRecord {
            ticket_id: line.id.clone(),
            category,
            old_total: old.and_then(|old| old.total),
            old_remaining: old.and_then(|old| old.remaining),
            new_total: line.total,
            new_remaining: line.remaining,
            valid_from: if category == ChangeCategory::Pending {
                line.valid_from
            } else {
                None
            },
        });
    }

    records
}

fn delta_category(
    old: &TicketLine,
    new: &TicketLine,
    watched: bool,
) -> Option<ChangeCategory> {
    if new.total.unwrap_or(0) > old.total.unwrap_or(0) {
        return Some(ChangeCategory::Add);
    }

    let new_remaining = new.remaining.unwrap_or(0);
    match old.remaining {
        // Zero or unknown coming back to positive is a return (released
        // seats), independent of the watch list.
        None | Some(0) => (new_remaining > 0).then_some(ChangeCategory::Return),
        Some(old_remaining) if watched && new_remaining < old_remaining => {
            Some(ChangeCategory::Sold)
        }
        Some(old_remaining) if watched && new_remaining > old_remaining => {
            Some(ChangeCategory::Back)
        }
        Some(_) => None,
    }
}

/// Pending lines have no meaningful remaining-count semantics yet, so any
/// change on them lands in the sale-open bucket regardless of capacity
/// deltas. A brand-new line with no capacity at all is likewise listed but
/// not on sale yet.
fn reroute_pending(category: ChangeCategory, line: &TicketLine) -> ChangeCategory {
    if line.status == TicketStatus::Pending {
        return ChangeCategory::Pending;
    }
    if category == ChangeCategory::New
        && line.total.unwrap_or(0) == 0
        && line.remaining.unwrap_or(0) == 0
    {
        return ChangeCategory::Pending;
    }
    category
}

/// Sale-open bucket key; `None` collects the lines whose sale-open time the
/// source has not announced.
pub type PendingKey = Option<DateTime<Utc>>;

/// Group the pending records of a classification run by sale-open time. The
/// unknown bucket sorts first.
pub fn group_pending(records: &[ChangeRecord]) -> BTreeMap<PendingKey, Vec<&ChangeRecord>> {
    let mut buckets: BTreeMap<PendingKey, Vec<&ChangeRecord>> = BTreeMap::new();
    for record in records {
        if record.category == ChangeCategory::Pending {
            buckets.entry(record.valid_from).or_default().push(record);
        }
    }
    buckets
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSummary {
    pub active_lines: u32,
    pub pending_lines: u32,
    pub total_capacity: u32,
    pub total_remaining: u32,
}

/// Derived per-work summary stored alongside the ticket lines in a snapshot.
pub fn summarize(lines: &[TicketLine]) -> PayloadSummary {
    let mut summary = PayloadSummary::default();
    for line in lines {
        match line.status {
            TicketStatus::Active => {
                summary.active_lines += 1;
                summary.total_capacity += line.total.unwrap_or(0);
                summary.total_remaining += line.remaining.unwrap_or(0);
            }
            TicketStatus::Pending => summary.pending_lines += 1,
            TicketStatus::Expired => {}
        }
    }
    summary
}
