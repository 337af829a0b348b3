//! Retail pharmacy slot API.
//!
//! The slot endpoint says whether a store has appointment slots; the store
//! lookup then checks that the store offers the vaccine at all. Both go
//! through [`fetch_with_retries`] because this upstream blocks by IP.

use std::collections::BTreeSet;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};
use vaxwatch_core::{ScrapeStatus, VaccineType, WorkItem, WorkResult};

use super::{AvailabilityCheck, ProbeOutcome, SiteKind};
use crate::credentials::BrokerPool;
use crate::error::ScraperError;
use crate::rate_limit::fetch_with_retries;

const KEY_PREFIX: &str = "riteaid_";
const SUCCESS: &str = "SUCCESS";
/// Store attribute marking locations that administer the vaccine.
const VACCINE_ATTRIBUTE: &str = "PREF-112";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Data")]
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SlotData {
    #[serde(default)]
    slots: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct StoreData {
    #[serde(default)]
    stores: Vec<Value>,
}

/// Store number encoded in the location key (`riteaid_5204` -> 5204).
#[must_use]
pub fn store_number(item: &WorkItem) -> Option<u32> {
    item.key.strip_prefix(KEY_PREFIX)?.parse().ok()
}

/// Keeps the items with a store number, and of those only segment `segment`
/// of `segments` when segmenting (`store_number % segments == segment`).
#[must_use]
pub fn select_segment(items: Vec<WorkItem>, segment: u32, segments: u32) -> Vec<WorkItem> {
    items
        .into_iter()
        .filter(|item| match store_number(item) {
            Some(n) => segments == 0 || n % segments == segment,
            None => false,
        })
        .collect()
}

fn slot_tag(slot_id: &str) -> Option<VaccineType> {
    match slot_id {
        "9" => Some(VaccineType::Moderna),
        "11" => Some(VaccineType::Pfizer),
        "13" => Some(VaccineType::Johnson),
        _ => None,
    }
}

/// Slot ids 10 and 12 are second-dose slots and never count.
fn is_ignored_slot(slot_id: &str) -> bool {
    matches!(slot_id, "10" | "12")
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Whether any counted slot is open, and which vaccines those slots are for.
fn open_slots(slots: &Map<String, Value>) -> (bool, BTreeSet<VaccineType>) {
    let mut any_open = false;
    let mut tags = BTreeSet::new();
    for (slot_id, value) in slots {
        if is_ignored_slot(slot_id) || !is_truthy(value) {
            continue;
        }
        any_open = true;
        if let Some(tag) = slot_tag(slot_id) {
            tags.insert(tag);
        }
    }
    (any_open, tags)
}

pub struct SlotApiCheck {
    client: Client,
    base_url: String,
}

impl SlotApiCheck {
    #[must_use]
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// `None` when the upstream answered but not with a usable success.
    async fn get_envelope<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, ScraperError> {
        let response = fetch_with_retries(|| {
            self.client
                .get(url)
                .query(query)
                .header(ACCEPT, "application/json")
        })
        .await?;

        let status = response.status();
        let body = response.text().await?;
        debug!(url, status = status.as_u16(), body = %body, "slot api response");
        if !status.is_success() {
            return Ok(None);
        }

        let envelope: Envelope<T> =
            serde_json::from_str(&body).map_err(|e| ScraperError::Deserialize {
                context: format!("slot api ({url})"),
                source: e,
            })?;
        if envelope.status != SUCCESS {
            return Ok(None);
        }
        Ok(envelope.data)
    }

    fn store_number_of(item: &WorkItem) -> Result<u32, ScraperError> {
        store_number(item)
            .ok_or_else(|| ScraperError::Scrape(format!("{} has no store number", item.key)))
    }
}

#[async_trait]
impl AvailabilityCheck for SlotApiCheck {
    fn kind(&self) -> SiteKind {
        SiteKind::SlotApi
    }

    async fn probe(&self, item: &WorkItem) -> Result<ProbeOutcome, ScraperError> {
        let store = Self::store_number_of(item)?;
        let url = format!("{}/services/ext/v2/vaccine/checkSlots", self.base_url);
        let Some(data) = self
            .get_envelope::<SlotData>(&url, &[("storeNumber", store.to_string())])
            .await?
        else {
            return Ok(ProbeOutcome::Settled(WorkResult::unknown(&item.key)));
        };

        let (any_open, tags) = open_slots(&data.slots);
        debug!(item = %item.key, store, ?tags, "slot api vaccine types");
        if any_open {
            Ok(ProbeOutcome::Positive { tags })
        } else {
            Ok(ProbeOutcome::Settled(
                WorkResult::new(&item.key, ScrapeStatus::No).with_tags(tags),
            ))
        }
    }

    async fn confirm(
        &self,
        item: &WorkItem,
        _credentials: Option<&mut BrokerPool>,
    ) -> Result<WorkResult, ScraperError> {
        let store = Self::store_number_of(item)?;
        let url = format!("{}/services/ext/v2/stores/getStores", self.base_url);
        let query = [
            ("storeNumbers", store.to_string()),
            ("attrFilter", VACCINE_ATTRIBUTE.to_owned()),
            ("fetchMechanismVersion", "2".to_owned()),
        ];
        let Some(data) = self.get_envelope::<StoreData>(&url, &query).await? else {
            return Ok(WorkResult::unknown(&item.key));
        };

        if data.stores.is_empty() {
            info!(item = %item.key, store, "store has slots but does not offer the vaccine");
            Ok(WorkResult::new(&item.key, ScrapeStatus::No))
        } else {
            info!(item = %item.key, store, "slot api reports availability");
            Ok(WorkResult::new(&item.key, ScrapeStatus::Yes))
        }
    }
}
