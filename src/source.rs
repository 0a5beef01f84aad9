use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::offer::Offer;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("offer request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("offer endpoint returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed offer payload: {0}")]
    Decode(String),
}

impl SourceError {
    /// Transient failures are skipped by the ingestion cycle and retried on
    /// the next run; anything else aborts the cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SourceError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            SourceError::Decode(_) => false,
        }
    }
}

/// Produces offers changed since a given marker. Pagination and retry live
/// entirely behind this trait; consumers only see a lazy, finite sequence.
pub trait OfferSource {
    fn fetch_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Box<dyn Iterator<Item = Result<Offer, SourceError>> + '_>;
}

/// Wire shape of one offer as the source API serves it.
#[derive(Debug, Deserialize)]
pub(crate) struct OfferDto {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub posted_at: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct OfferPageDto {
    results: Vec<OfferDto>,
    total: usize,
}

pub(crate) fn offer_from_dto(dto: OfferDto) -> Offer {
    let mut metadata = std::collections::HashMap::new();
    metadata.insert("title".to_string(), dto.title.clone());
    if let Some(organization) = dto.organization {
        metadata.insert("organization".to_string(), organization);
    }
    if let Some(city) = dto.city {
        metadata.insert("city".to_string(), city);
    }
    if let Some(country) = dto.country {
        metadata.insert("country".to_string(), country);
    }
    if let Some(url) = dto.url {
        metadata.insert("url".to_string(), url);
    }
    if let Some(posted_at) = dto.posted_at {
        metadata.insert("posted_at".to_string(), posted_at);
    }

    Offer {
        id: dto.id,
        text: format!("{}\n{}", dto.title, dto.description),
        metadata,
        updated_at: dto.updated_at,
    }
}

/// Paginated JSON offer API client. The configured timeout bounds every
/// page request; a page that times out surfaces as a transient error.
pub struct HttpOfferSource {
    client: Client,
    base_url: String,
    page_size: usize,
}

impl HttpOfferSource {
    pub fn new(base_url: String, timeout: Duration, page_size: usize) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpOfferSource {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size,
        })
    }

    fn fetch_page(&self, page: usize) -> Result<OfferPageDto, SourceError> {
        let url = format!("{}/offers", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("page", page.to_string()), ("pageSize", self.page_size.to_string())])
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(SourceError::Status { status, body });
        }
        let page: OfferPageDto = response
            .json()
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(page)
    }
}

impl OfferSource for HttpOfferSource {
    fn fetch_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Box<dyn Iterator<Item = Result<Offer, SourceError>> + '_> {
        Box::new(OfferPages {
            source: self,
            since,
            page: 0,
            seen: 0,
            total: None,
            buffer: VecDeque::new(),
            failed: false,
        })
    }
}

/// Lazily drains the API page by page, filtering on the since-marker.
struct OfferPages<'a> {
    source: &'a HttpOfferSource,
    since: Option<DateTime<Utc>>,
    page: usize,
    seen: usize,
    total: Option<usize>,
    buffer: VecDeque<OfferDto>,
    failed: bool,
}

impl Iterator for OfferPages<'_> {
    type Item = Result<Offer, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(dto) = self.buffer.pop_front() {
                if let Some(since) = self.since {
                    if dto.updated_at <= since {
                        continue;
                    }
                }
                return Some(Ok(offer_from_dto(dto)));
            }

            if let Some(total) = self.total {
                if self.seen >= total {
                    return None;
                }
            }

            match self.source.fetch_page(self.page) {
                Ok(page) => {
                    debug!(page = self.page, results = page.results.len(), total = page.total, "fetched offer page");
                    if page.results.is_empty() {
                        return None;
                    }
                    self.page += 1;
                    self.seen += page.results.len();
                    self.total = Some(page.total);
                    self.buffer.extend(page.results);
                }
                Err(e) => {
                    // One error ends the drain; the cycle decides whether it
                    // was transient.
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
