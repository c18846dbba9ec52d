use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use playbill_config::SourceConfig;
use playbill_core::{
    TicketLine, TicketStatus, WorkId, bracketed_title, normalize_city, payload_hash, summarize,
};
use playbill_poller::{FetchError, UpdateFetcher, UpdatePayload};
use playbill_resolver::AliasResolver;
use playbill_store::{CatalogStore, SourceLinkRecord};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;

/// Source kind recorded on work_source_links rows written by this fetcher.
pub const SOURCE_KIND: &str = "clubz";

const LISTING_ATTEMPTS: u32 = 4;
const LISTING_RETRY_STEP: u32 = 5;
const DETAIL_ATTEMPTS: u32 = 3;
const RETRY_PAUSE_SECS: u64 = 1;
const REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Deserialize)]
struct ListingPage {
    #[serde(default)]
    events: Vec<ListingEntry>,
}

#[derive(Debug, Deserialize)]
struct ListingEntry {
    #[serde(rename = "timeMark", default)]
    time_mark: i64,
    basic_info: ListedEvent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListedEvent {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventDetail {
    #[serde(default)]
    pub ticket_details: Vec<SourceTicket>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceTicket {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ticket_price: Option<f64>,
    #[serde(default)]
    pub total_ticket: Option<u32>,
    #[serde(default)]
    pub left_ticket_count: Option<u32>,
    #[serde(default)]
    pub valid_from: Option<String>,
}

/// Thin client for the upstream ticketing endpoints.
#[derive(Clone)]
pub struct SourceClient {
    http: reqwest::Client,
    endpoint: String,
    page_size: u32,
}

impl SourceClient {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            page_size: config.page_size.max(1),
        })
    }

    /// The listing endpoint intermittently answers `false` or a truncated
    /// body under load; retry with a smaller page before giving up.
    pub async fn recommended_events(&self) -> Result<Vec<ListedEvent>> {
        let mut limit = self.page_size;
        for attempt in 0..LISTING_ATTEMPTS {
            if attempt > 0 {
                sleep(Duration::from_secs(RETRY_PAUSE_SECS)).await;
            }
            match self.listing_page(limit).await {
                Ok(events) if !events.is_empty() => return Ok(events),
                Ok(_) => {
                    tracing::warn!(limit, "listing returned no events; retrying");
                }
                Err(err) => {
                    tracing::warn!(limit, error = %err, "listing fetch failed; retrying");
                }
            }
            limit = limit.saturating_sub(LISTING_RETRY_STEP).max(1);
        }
        bail!("listing endpoint returned no usable data after {LISTING_ATTEMPTS} attempts")
    }

    async fn listing_page(&self, limit: u32) -> Result<Vec<ListedEvent>> {
        let url = format!(
            "{}/site/getevent.html?filter=recommendation&limit={limit}&page=0",
            self.endpoint
        );
        let body = self.get_json(&url).await?;
        let page: ListingPage =
            serde_json::from_value(body).context("unexpected listing body shape")?;

        // timeMark <= 0 marks listings that are no longer on sale.
        Ok(page
            .events
            .into_iter()
            .filter(|entry| entry.time_mark > 0)
            .map(|entry| entry.basic_info)
            .collect())
    }

    pub async fn event_details(&self, source_id: &str) -> Result<EventDetail> {
        let url = format!(
            "{}/event/getEventDetails.html?id={source_id}",
            self.endpoint
        );

        let mut last_error = None;
        for attempt in 0..DETAIL_ATTEMPTS {
            if attempt > 0 {
                sleep(Duration::from_secs(RETRY_PAUSE_SECS)).await;
            }
            match self.get_json(&url).await {
                Ok(body) => {
                    return serde_json::from_value(body).context("unexpected event detail shape");
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("event detail fetch failed"))
            .context(format!("giving up on event {source_id} after {DETAIL_ATTEMPTS} attempts")))
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let text = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        // The upstream serves UTF-8 with a BOM.
        let value: Value = serde_json::from_str(text.trim_start_matches('\u{feff}'))?;
        if !value.is_object() {
            bail!("source answered with a non-object body");
        }
        Ok(value)
    }
}

/// Production fetch collaborator: pages the listing endpoint, fans out
/// per-event detail requests under a bounded pool, correlates each listing
/// with its canonical work, and assembles one update payload per event.
pub struct SourceFetcher {
    client: SourceClient,
    store: Arc<Mutex<CatalogStore>>,
    resolver: Arc<AliasResolver>,
    detail_limit: usize,
}

impl SourceFetcher {
    pub fn new(
        client: SourceClient,
        store: Arc<Mutex<CatalogStore>>,
        resolver: Arc<AliasResolver>,
        detail_limit: usize,
    ) -> Self {
        Self {
            client,
            store,
            resolver,
            detail_limit: detail_limit.max(1),
        }
    }

    async fn fetch_all(&self) -> Result<Vec<UpdatePayload>> {
        let events = self.client.recommended_events().await?;

        let limiter = Arc::new(Semaphore::new(self.detail_limit));
        let mut detail_jobs = JoinSet::new();
        for (index, event) in events.iter().enumerate() {
            let client = self.client.clone();
            let limiter = limiter.clone();
            let source_id = event.id.to_string();

            detail_jobs.spawn(async move {
                let _permit = match limiter.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, None),
                };
                match client.event_details(&source_id).await {
                    Ok(detail) => (index, Some(detail)),
                    Err(err) => {
                        tracing::warn!(
                            source_id = %source_id,
                            error = %err,
                            "detail fetch failed; skipping event this cycle"
                        );
                        (index, None)
                    }
                }
            });
        }

        let mut details: Vec<Option<EventDetail>> = (0..events.len()).map(|_| None).collect();
        while let Some(joined) = detail_jobs.join_next().await {
            if let Ok((index, detail)) = joined {
                details[index] = detail;
            }
        }

        let now = Utc::now();
        let mut updates = Vec::new();
        for (event, detail) in events.iter().zip(details) {
            let Some(detail) = detail else { continue };

            let title = bracketed_title(&event.title).to_owned();
            let city_norm = event.location.as_deref().and_then(city_from_location);
            let work_id = self.correlate(event, &title, city_norm.as_deref())?;

            let lines = ticket_lines(work_id, &detail, now);
            let hash = payload_hash(&serde_json::to_value(&lines)?);
            self.record_link(work_id, event, &title, city_norm.as_deref(), &hash, now)?;

            updates.push(UpdatePayload {
                work_id,
                city_norm: city_norm.clone(),
                snapshot: build_payload(
                    work_id,
                    &event.id.to_string(),
                    &title,
                    city_norm.as_deref(),
                    &lines,
                    now,
                ),
                payload_hash: Some(hash),
            });
        }
        Ok(updates)
    }

    /// First sighting of a listing registers the canonical work and makes
    /// its source title directly searchable; afterwards the source link is
    /// the identity.
    fn correlate(
        &self,
        event: &ListedEvent,
        title: &str,
        city_norm: Option<&str>,
    ) -> Result<WorkId> {
        let source_id = event.id.to_string();
        if let Some(link) = lock_store(&self.store).find_source_link(SOURCE_KIND, &source_id)? {
            return Ok(link.work_id);
        }

        let work = lock_store(&self.store).upsert_work(title, city_norm)?;
        self.resolver
            .add_alias_with_source(work.id, title, "official")?;
        self.resolver.add_search_name(work.id, title)?;
        Ok(work.id)
    }

    fn record_link(
        &self,
        work_id: WorkId,
        event: &ListedEvent,
        title: &str,
        city_hint: Option<&str>,
        hash: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        lock_store(&self.store).upsert_source_link(&SourceLinkRecord {
            work_id,
            source: SOURCE_KIND.to_owned(),
            source_id: event.id.to_string(),
            title_at_source: Some(title.to_owned()),
            city_hint: city_hint.map(str::to_owned),
            confidence: 1.0,
            payload_hash: Some(hash.to_owned()),
            last_sync_at: now.timestamp(),
        })?;
        Ok(())
    }
}

#[async_trait]
impl UpdateFetcher for SourceFetcher {
    async fn fetch_updates(&self) -> Result<Vec<UpdatePayload>, FetchError> {
        self.fetch_all()
            .await
            .map_err(|err| FetchError(format!("{err:#}")))
    }
}

/// Convert one event's raw ticket rows into catalog ticket lines, dropping
/// rows the catalog cannot represent: no id, no capacity, no show time, an
/// unknown or expired status, or a show that already ended.
pub fn ticket_lines(
    work_id: WorkId,
    detail: &EventDetail,
    now: DateTime<Utc>,
) -> Vec<TicketLine> {
    let mut lines = Vec::new();
    for ticket in &detail.ticket_details {
        let Some(id) = ticket.id else { continue };
        let Ok(status) = ticket
            .status
            .as_deref()
            .unwrap_or("")
            .parse::<TicketStatus>()
        else {
            continue;
        };
        if status == TicketStatus::Expired {
            continue;
        }

        let start_time = ticket.start_time.as_deref().and_then(parse_source_time);
        if ticket.total_ticket.is_none() || start_time.is_none() {
            continue;
        }

        let end_time = ticket.end_time.as_deref().and_then(parse_source_time);
        if let Some(end) = end_time
            && end < now
        {
            continue;
        }

        lines.push(TicketLine {
            id: id.to_string(),
            work_id,
            title: ticket.title.clone().unwrap_or_default(),
            start_time,
            end_time,
            status,
            total: ticket.total_ticket,
            remaining: ticket.left_ticket_count,
            price: ticket.ticket_price,
            valid_from: ticket.valid_from.as_deref().and_then(parse_source_time),
        });
    }
    lines
}

/// The reconciled snapshot body written to the cache for one (work, city).
pub fn build_payload(
    work_id: WorkId,
    source_id: &str,
    title: &str,
    city_norm: Option<&str>,
    lines: &[TicketLine],
    generated_at: DateTime<Utc>,
) -> Value {
    json!({
        "work_id": work_id,
        "source": SOURCE_KIND,
        "source_id": source_id,
        "title": title,
        "city_norm": city_norm,
        "tickets": lines,
        "summary": summarize(lines),
        "generated_at": generated_at.to_rfc3339(),
    })
}

/// Source timestamps look like "2025-07-19 20:00:00"; "null" and empty
/// strings stand in for unknown.
pub fn parse_source_time(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return None;
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Venue strings read "city·venue"; the city is the first segment.
pub fn city_from_location(location: &str) -> Option<String> {
    let head = location.split(['·', '|', ' ']).next().unwrap_or(location);
    let city = normalize_city(head);
    (!city.is_empty()).then_some(city)
}

pub fn lock_store(store: &Mutex<CatalogStore>) -> MutexGuard<'_, CatalogStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ticket(id: i64, status: &str) -> SourceTicket {
        SourceTicket {
            id: Some(id),
            title: Some(format!("《海雾》07-19 20:00 ticket {id}")),
            start_time: Some("2025-07-19 20:00:00".to_owned()),
            end_time: Some("2025-07-19 21:00:00".to_owned()),
            status: Some(status.to_owned()),
            ticket_price: Some(199.0),
            total_ticket: Some(14),
            left_ticket_count: Some(3),
            valid_from: None,
        }
    }

    fn before_show() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn ticket_lines_keep_active_and_pending_rows_only() {
        let detail = EventDetail {
            ticket_details: vec![
                ticket(1, "active"),
                ticket(2, "pending"),
                ticket(3, "expired"),
                ticket(4, "unknown-status"),
            ],
        };

        let lines = ticket_lines(7, &detail, before_show());
        let ids: Vec<&str> = lines.iter().map(|line| line.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert!(lines.iter().all(|line| line.work_id == 7));
    }

    #[test]
    fn ticket_lines_drop_rows_missing_required_fields() {
        let mut no_id = ticket(1, "active");
        no_id.id = None;
        let mut no_total = ticket(2, "active");
        no_total.total_ticket = None;
        let mut no_start = ticket(3, "active");
        no_start.start_time = None;

        let detail = EventDetail {
            ticket_details: vec![no_id, no_total, no_start, ticket(4, "active")],
        };
        let lines = ticket_lines(7, &detail, before_show());
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].id, "4");
    }

    #[test]
    fn ticket_lines_sweep_lines_whose_show_already_ended() {
        let detail = EventDetail {
            ticket_details: vec![ticket(1, "active")],
        };

        let after_show = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        assert!(ticket_lines(7, &detail, after_show).is_empty());
        assert_eq!(ticket_lines(7, &detail, before_show()).len(), 1);
    }

    #[test]
    fn parse_source_time_handles_null_markers() {
        assert!(parse_source_time("null").is_none());
        assert!(parse_source_time("  ").is_none());
        assert!(parse_source_time("not a date").is_none());

        let parsed = parse_source_time("2025-07-19 20:00:00").expect("timestamp");
        assert_eq!(
            parsed,
            Utc.with_ymd_and_hms(2025, 7, 19, 20, 0, 0).unwrap()
        );
    }

    #[test]
    fn city_from_location_takes_the_leading_segment() {
        assert_eq!(city_from_location("上海·大剧院").as_deref(), Some("上海"));
        assert_eq!(city_from_location("北京"), Some("北京".to_owned()));
        assert_eq!(city_from_location(""), None);
    }

    #[test]
    fn build_payload_embeds_tickets_and_summary() {
        let lines = ticket_lines(
            7,
            &EventDetail {
                ticket_details: vec![ticket(1, "active")],
            },
            before_show(),
        );

        let payload = build_payload(7, "3863", "海雾", Some("上海"), &lines, before_show());
        assert_eq!(payload["work_id"], 7);
        assert_eq!(payload["source_id"], "3863");
        assert_eq!(payload["tickets"].as_array().map(Vec::len), Some(1));
        assert_eq!(payload["summary"]["total_remaining"], 3);
    }
}
