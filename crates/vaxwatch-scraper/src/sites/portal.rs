//! Credential-gated pharmacy portal.
//!
//! The probe reads the portal's public availability feed. A positive probe is
//! confirmed against the scheduling API, which needs a session key and
//! cookies from the [`BrokerPool`].

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{Datelike, Months, NaiveDate, Utc};
use reqwest::header::{ACCEPT, COOKIE};
use reqwest::{Client, Url};
use serde::de::IgnoredAny;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use vaxwatch_core::{CredentialArtifact, ScrapeStatus, VaccineType, WorkItem, WorkResult};

use super::{decode_json, AvailabilityCheck, ProbeOutcome, SiteKind};
use crate::credentials::{BrokerPool, CredentialScope, CredentialUse};
use crate::error::ScraperError;

/// At this many open slots a location counts as plainly available.
pub const LIMITED_THRESHOLD: usize = 5;

const APPOINTMENT_KEY: &str = "COVID_VACCINE_DOSE1_APPT";
const EVENT_TYPE: &str = "COVID Vaccine Dose 1 Appt";

/// Where a portal location lives, parsed from its scraping URL
/// (`/vcl/{search_client_id}?clientId={store_id}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalStore {
    pub search_client_id: String,
    pub store_id: String,
}

#[must_use]
pub fn portal_store(item: &WorkItem) -> Option<PortalStore> {
    let url = Url::parse(&item.locator).ok()?;
    let search_client_id = url.path_segments()?.nth(1)?.to_owned();
    let store_id = url
        .query_pairs()
        .find(|(k, _)| k == "clientId")
        .map(|(_, v)| v.into_owned())?;
    if search_client_id.is_empty() || store_id.is_empty() {
        return None;
    }
    Some(PortalStore {
        search_client_id,
        store_id,
    })
}

/// Keeps the portal locations that belong to `scope`, recording each one's
/// search client as its external system id.
#[must_use]
pub fn select_items(items: Vec<WorkItem>, scope: &CredentialScope) -> Vec<WorkItem> {
    items
        .into_iter()
        .filter_map(|mut item| {
            let store = portal_store(&item)?;
            if !scope.covers(&store.search_client_id) {
                return None;
            }
            item.external_system_id = Some(store.search_client_id);
            Some(item)
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
struct FeedEntry {
    id: String,
    availability: String,
    #[serde(rename = "drugName", default)]
    drug_name: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Location {
    name: String,
    timezone: String,
    #[serde(rename = "clientName")]
    client_name: String,
}

#[derive(Debug, Deserialize)]
struct SlotDays {
    #[serde(rename = "slotDates", default)]
    slot_dates: Vec<String>,
}

fn vaccine_tags(drug_names: &[String]) -> BTreeSet<VaccineType> {
    drug_names
        .iter()
        .filter_map(|name| match name.as_str() {
            "Moderna" => Some(VaccineType::Moderna),
            "Pfizer" => Some(VaccineType::Pfizer),
            "JnJ" => Some(VaccineType::Johnson),
            _ => None,
        })
        .collect()
}

#[must_use]
pub fn classify_slot_count(count: usize) -> ScrapeStatus {
    match count {
        0 => ScrapeStatus::No,
        n if n < LIMITED_THRESHOLD => ScrapeStatus::Limited,
        _ => ScrapeStatus::Yes,
    }
}

fn with_credentials(
    builder: reqwest::RequestBuilder,
    artifact: &CredentialArtifact,
) -> reqwest::RequestBuilder {
    builder
        .header(COOKIE, artifact.cookie_header())
        .header(ACCEPT, "*/*")
}

fn cache_buster() -> String {
    (rand::random::<u64>() % 1_000_000_000_000_000_000).to_string()
}

pub struct PortalCheck {
    client: Client,
    feed_url: String,
    base_url: String,
    feed: OnceCell<HashMap<String, FeedEntry>>,
}

impl PortalCheck {
    #[must_use]
    pub fn new(client: Client, feed_url: &str, base_url: &str) -> Self {
        Self {
            client,
            feed_url: feed_url.to_owned(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            feed: OnceCell::new(),
        }
    }

    /// The feed is fetched once and reused for every item of the run.
    async fn feed(&self) -> Result<&HashMap<String, FeedEntry>, ScraperError> {
        self.feed
            .get_or_try_init(|| async {
                let response = self.client.get(&self.feed_url).send().await?;
                let entries: Vec<FeedEntry> = decode_json(response, "availability feed").await?;
                info!(entries = entries.len(), "loaded portal availability feed");
                Ok::<_, ScraperError>(entries.into_iter().map(|e| (e.id.clone(), e)).collect())
            })
            .await
    }

    async fn fetch_locations(
        &self,
        store: &PortalStore,
        registered: bool,
        artifact: CredentialArtifact,
    ) -> Result<Vec<Location>, ScraperError> {
        let mut query: Vec<(&str, String)> = if registered {
            vec![
                ("accessKey", store.search_client_id.clone()),
                ("externalClientId", store.store_id.clone()),
                ("clientIds", store.store_id.clone()),
                ("instore", "no".to_owned()),
            ]
        } else {
            vec![
                ("externalClientId", store.search_client_id.clone()),
                ("clientIds", store.store_id.clone()),
                ("instore", "yes".to_owned()),
            ]
        };
        query.extend([
            ("_r", cache_buster()),
            ("apptKey", APPOINTMENT_KEY.to_owned()),
            ("csrfKey", artifact.session_key.clone()),
        ]);

        let url = format!("{}/loadLocationsForClientAndApptType.do", self.base_url);
        let response = with_credentials(self.client.get(&url).query(&query), &artifact)
            .send()
            .await?;
        decode_json(response, "portal locations").await
    }

    async fn fetch_slot_days(
        &self,
        location: &Location,
        month: NaiveDate,
        artifact: CredentialArtifact,
    ) -> Result<SlotDays, ScraperError> {
        let url = format!("{}/loadEventSlotDaysForCoach.do", self.base_url);
        let response = with_credentials(
            self.client
                .post(&url)
                .query(&[
                    ("_r", cache_buster().as_str()),
                    ("csrfKey", artifact.session_key.as_str()),
                    ("cva", "true"),
                    ("type", "registration"),
                ])
                .form(&[
                    ("slotsYear", month.year().to_string()),
                    ("slotsMonth", month.month().to_string()),
                    ("companyName", location.client_name.clone()),
                    ("location", location.name.clone()),
                    ("locationTimezone", location.timezone.clone()),
                    ("csrfKey", artifact.session_key.clone()),
                    ("eventType", EVENT_TYPE.to_owned()),
                ]),
            &artifact,
        )
        .send()
        .await?;
        decode_json(response, "portal slot days").await
    }

    async fn fetch_slot_count(
        &self,
        location: &Location,
        date: &str,
        artifact: CredentialArtifact,
    ) -> Result<usize, ScraperError> {
        let url = format!("{}/loadEventSlotsForCoach.do", self.base_url);
        let response = with_credentials(
            self.client
                .post(&url)
                .query(&[
                    ("_r", cache_buster().as_str()),
                    ("csrfKey", artifact.session_key.as_str()),
                    ("cva", "true"),
                    ("type", "registration"),
                ])
                .form(&[
                    ("companyName", location.client_name.as_str()),
                    ("eventDate", date),
                    ("eventType", EVENT_TYPE),
                ]),
            &artifact,
        )
        .send()
        .await?;
        let slots: Vec<IgnoredAny> = decode_json(response, "portal slots").await?;
        Ok(slots.len())
    }
}

#[async_trait]
impl AvailabilityCheck for PortalCheck {
    fn kind(&self) -> SiteKind {
        SiteKind::Portal
    }

    async fn probe(&self, item: &WorkItem) -> Result<ProbeOutcome, ScraperError> {
        let store = portal_store(item).ok_or_else(|| {
            ScraperError::Scrape(format!("{} is not a portal location URL", item.locator))
        })?;
        let feed = self.feed().await?;

        Ok(match feed.get(&store.store_id) {
            Some(entry) if entry.availability == "no" => ProbeOutcome::Settled(
                WorkResult::new(&item.key, ScrapeStatus::No)
                    .with_tags(vaccine_tags(&entry.drug_name)),
            ),
            Some(entry) => ProbeOutcome::Positive {
                tags: vaccine_tags(&entry.drug_name),
            },
            None => {
                debug!(item = %item.key, store = %store.store_id, "location missing from feed");
                ProbeOutcome::Positive {
                    tags: BTreeSet::new(),
                }
            }
        })
    }

    async fn confirm(
        &self,
        item: &WorkItem,
        credentials: Option<&mut BrokerPool>,
    ) -> Result<WorkResult, ScraperError> {
        let pool = credentials.ok_or_else(|| {
            ScraperError::Scrape("portal confirmation needs a credential pool".to_owned())
        })?;
        let store = portal_store(item).ok_or_else(|| {
            ScraperError::Scrape(format!("{} is not a portal location URL", item.locator))
        })?;
        let registered = matches!(pool.scope(), CredentialScope::RegisteredCompany);

        let locations = pool
            .use_credentials(item, CredentialUse::NonDegrading, |artifact| {
                self.fetch_locations(&store, registered, artifact)
            })
            .await?;
        let Some(location) = locations.into_iter().next() else {
            return Ok(WorkResult::new(&item.key, ScrapeStatus::No));
        };

        let this_month = Utc::now().date_naive();
        let next_month = this_month
            .checked_add_months(Months::new(1))
            .unwrap_or(this_month);
        let mut dates = Vec::new();
        for month in [this_month, next_month] {
            let days = pool
                .use_credentials(item, CredentialUse::Degrading, |artifact| {
                    self.fetch_slot_days(&location, month, artifact)
                })
                .await?;
            dates.extend(days.slot_dates);
        }

        let mut open_slots = 0;
        for date in &dates {
            if open_slots >= LIMITED_THRESHOLD {
                break;
            }
            open_slots += pool
                .use_credentials(item, CredentialUse::Degrading, |artifact| {
                    self.fetch_slot_count(&location, date, artifact)
                })
                .await?;
        }

        debug!(item = %item.key, days = dates.len(), open_slots, "portal slots counted");
        Ok(WorkResult::new(&item.key, classify_slot_count(open_slots)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::scopes::{PORTLAND_SEARCH_CLIENT_ID, SEATTLE_SEARCH_CLIENT_ID};

    fn item(key: &str, locator: &str) -> WorkItem {
        WorkItem {
            id: format!("rec_{key}"),
            key: key.to_owned(),
            human_name: key.to_owned(),
            locator: locator.to_owned(),
            address: None,
            external_system_id: None,
        }
    }

    #[test]
    fn store_is_parsed_from_locator() {
        let store = portal_store(&item(
            "safeway_19_1078",
            "https://kordinator.mhealthcoach.net/vcl/1610137564207?clientId=1600119877325",
        ))
        .unwrap();
        assert_eq!(store.search_client_id, "1610137564207");
        assert_eq!(store.store_id, "1600119877325");
    }

    #[test]
    fn locator_without_client_id_is_not_a_store() {
        let bare = item("x", "https://kordinator.mhealthcoach.net/vcl/1610137564207");
        assert!(portal_store(&bare).is_none());
        assert!(portal_store(&item("x", "not a url")).is_none());
    }

    #[test]
    fn selection_partitions_by_scope() {
        let items = vec![
            item("sea", &format!("https://p/vcl/{SEATTLE_SEARCH_CLIENT_ID}?clientId=1")),
            item("pdx", &format!("https://p/vcl/{PORTLAND_SEARCH_CLIENT_ID}?clientId=2")),
            item("reg", "https://p/vcl/1599999999999?clientId=3"),
            item("bad", "https://p/other"),
        ];

        let seattle = select_items(items.clone(), &CredentialScope::seattle());
        assert_eq!(seattle.len(), 1);
        assert_eq!(seattle[0].key, "sea");
        assert_eq!(
            seattle[0].external_system_id.as_deref(),
            Some(SEATTLE_SEARCH_CLIENT_ID)
        );

        let registered = select_items(items, &CredentialScope::RegisteredCompany);
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].key, "reg");
    }

    #[test]
    fn drug_names_map_to_tags() {
        let tags = vaccine_tags(&["JnJ".to_owned(), "Pfizer".to_owned(), "Novavax".to_owned()]);
        assert_eq!(
            tags.into_iter().collect::<Vec<_>>(),
            vec![VaccineType::Pfizer, VaccineType::Johnson]
        );
    }

    #[test]
    fn slot_counts_classify() {
        assert_eq!(classify_slot_count(0), ScrapeStatus::No);
        assert_eq!(classify_slot_count(1), ScrapeStatus::Limited);
        assert_eq!(classify_slot_count(4), ScrapeStatus::Limited);
        assert_eq!(classify_slot_count(5), ScrapeStatus::Yes);
    }
}
