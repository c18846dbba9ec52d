use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use playbill_cache::{CacheError, SnapshotCache, SnapshotRefresher};
use playbill_core::{TicketId, TicketLine, WorkId, classify, group_pending};
use playbill_poller::{CallbackError, ChangeCallback, ChangeEvent};
use playbill_resolver::AliasResolver;
use playbill_store::CatalogStore;
use serde_json::Value;

use crate::fetch::{SOURCE_KIND, SourceClient, build_payload, lock_store, ticket_lines};

/// Default change consumer: classifies the fresh payload against the last
/// reconciled snapshot, reports every categorized movement, and atomically
/// replaces the snapshot.
pub struct SnapshotRebuild {
    cache: Arc<SnapshotCache>,
    resolver: Arc<AliasResolver>,
    store: Arc<Mutex<CatalogStore>>,
    ttl_seconds: i64,
    print_events: bool,
}

impl SnapshotRebuild {
    pub fn new(
        cache: Arc<SnapshotCache>,
        resolver: Arc<AliasResolver>,
        store: Arc<Mutex<CatalogStore>>,
        ttl_seconds: i64,
        print_events: bool,
    ) -> Self {
        Self {
            cache,
            resolver,
            store,
            ttl_seconds,
            print_events,
        }
    }

    /// Read-through enrichment: the resolver's primary search name as the
    /// display title, and the work's default city when the payload has none.
    fn display_context(&self, event: &ChangeEvent) -> (String, Option<String>) {
        let show_name = self
            .resolver
            .resolve_ordered_names(None, Some(event.work_id))
            .into_iter()
            .next()
            .unwrap_or_else(|| format!("work {}", event.work_id));

        let city = event.city_norm.clone().or_else(|| {
            lock_store(&self.store)
                .get_work(event.work_id)
                .ok()
                .flatten()
                .and_then(|work| work.default_city_norm)
        });

        (show_name, city)
    }
}

#[async_trait]
impl ChangeCallback for SnapshotRebuild {
    async fn on_change(&self, event: ChangeEvent) -> Result<(), CallbackError> {
        let previous = previous_lines(&self.store, event.work_id, event.city_norm.as_deref());
        let current = lines_from_payload(&event.payload);
        let records = classify(previous.as_ref(), &current, &HashSet::new());

        let (show_name, city) = self.display_context(&event);
        for record in &records {
            tracing::info!(
                work_id = event.work_id,
                show = %show_name,
                city = city.as_deref().unwrap_or("-"),
                ticket_id = %record.ticket_id,
                category = record.category.as_str(),
                old_remaining = record.old_remaining,
                new_remaining = record.new_remaining,
                "ticket change"
            );
            if self.print_events
                && let Ok(line) = serde_json::to_string(record)
            {
                println!("{line}");
            }
        }

        let pending = group_pending(&records);
        if !pending.is_empty() {
            tracing::info!(
                work_id = event.work_id,
                show = %show_name,
                buckets = pending.len(),
                "sale-open buckets updated"
            );
        }

        self.cache
            .write(
                event.work_id,
                event.city_norm.as_deref(),
                &event.payload,
                Some(self.ttl_seconds),
            )
            .map_err(|err| CallbackError(format!("snapshot write failed: {err}")))?;
        Ok(())
    }
}

/// Rebuilds a stale snapshot on demand by re-fetching the work's linked
/// source listing. Writes through the store so the replacement stays atomic.
pub struct SourceRefresher {
    client: SourceClient,
    store: Arc<Mutex<CatalogStore>>,
    ttl_seconds: i64,
}

impl SourceRefresher {
    pub fn new(client: SourceClient, store: Arc<Mutex<CatalogStore>>, ttl_seconds: i64) -> Self {
        Self {
            client,
            store,
            ttl_seconds,
        }
    }
}

#[async_trait]
impl SnapshotRefresher for SourceRefresher {
    async fn rebuild(&self, work_id: WorkId, city_norm: Option<&str>) -> Result<(), CacheError> {
        let link = lock_store(&self.store)
            .source_links_for_work(work_id)
            .map_err(CacheError::Store)?
            .into_iter()
            .find(|link| link.source == SOURCE_KIND)
            .ok_or_else(|| CacheError::Refresh(format!("work {work_id} has no source link")))?;

        let detail = self
            .client
            .event_details(&link.source_id)
            .await
            .map_err(|err| CacheError::Refresh(format!("{err:#}")))?;

        let now = Utc::now();
        let lines = ticket_lines(work_id, &detail, now);
        let payload = build_payload(
            work_id,
            &link.source_id,
            link.title_at_source.as_deref().unwrap_or(""),
            city_norm.or(link.city_hint.as_deref()),
            &lines,
            now,
        );
        let body = serde_json::to_string(&payload).map_err(CacheError::Payload)?;

        lock_store(&self.store)
            .upsert_snapshot(
                work_id,
                city_norm.unwrap_or(""),
                &body,
                self.ttl_seconds,
                now.timestamp(),
            )
            .map_err(CacheError::Store)?;
        Ok(())
    }
}

fn previous_lines(
    store: &Mutex<CatalogStore>,
    work_id: WorkId,
    city_norm: Option<&str>,
) -> Option<HashMap<TicketId, TicketLine>> {
    let snapshot = lock_store(store)
        .get_snapshot(work_id, city_norm)
        .ok()
        .flatten()?;
    let payload: Value = serde_json::from_str(&snapshot.payload).ok()?;
    let lines = lines_from_payload(&payload);
    Some(
        lines
            .into_iter()
            .map(|line| (line.id.clone(), line))
            .collect(),
    )
}

fn lines_from_payload(payload: &Value) -> Vec<TicketLine> {
    payload
        .get("tickets")
        .and_then(|tickets| serde_json::from_value(tickets.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use playbill_core::TicketStatus;
    use serde_json::json;

    use super::*;

    fn line_value(id: &str, total: u32, remaining: u32) -> Value {
        json!({
            "id": id,
            "work_id": 7,
            "title": "《海雾》",
            "start_time": "2025-07-19T20:00:00Z",
            "end_time": null,
            "status": "active",
            "total": total,
            "remaining": remaining,
            "price": 199.0,
            "valid_from": null,
        })
    }

    #[test]
    fn lines_round_trip_through_the_payload_body() {
        let payload = json!({"tickets": [line_value("t1", 10, 3)], "summary": {}});
        let lines = lines_from_payload(&payload);

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].id, "t1");
        assert_eq!(lines[0].status, TicketStatus::Active);
        assert_eq!(lines[0].total, Some(10));
        assert_eq!(lines[0].remaining, Some(3));
    }

    #[test]
    fn malformed_payloads_degrade_to_no_lines() {
        assert!(lines_from_payload(&json!({})).is_empty());
        assert!(lines_from_payload(&json!({"tickets": "garbage"})).is_empty());
        assert!(lines_from_payload(&Value::Null).is_empty());
    }
}
