use scraper::{ElementRef, Html, Selector};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::SelectorConfig;
use crate::models::{Listing, SelectorSet};
use crate::utils::error::{AppError, Result};

/// Which configured selector set produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetId {
    Primary,
    /// Zero-based position in the fallback list.
    Fallback(usize),
}

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetId::Primary => write!(f, "primary"),
            SetId::Fallback(index) => write!(f, "fallback #{}", index + 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetAttempt {
    pub set: SetId,
    /// Containers matched by the structural selector.
    pub containers: usize,
    /// Containers that yielded at least one field.
    pub with_data: usize,
}

impl SetAttempt {
    pub fn succeeded(&self) -> bool {
        self.with_data > 0
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionReport {
    pub listings: Vec<Listing>,
    pub matched: SetId,
    /// Every set tried, in order, ending with the one that matched.
    pub attempts: Vec<SetAttempt>,
}

impl ExtractionReport {
    pub fn used_fallback(&self) -> bool {
        self.matched != SetId::Primary
    }
}

struct CompiledSet {
    id: SetId,
    listing: Selector,
    title: Selector,
    price: Selector,
    link: Selector,
}

impl CompiledSet {
    fn compile(id: SetId, set: &SelectorSet) -> Result<Self> {
        Ok(Self {
            id,
            listing: parse_selector(&set.listing)?,
            title: parse_selector(&set.title)?,
            price: parse_selector(&set.price)?,
            link: parse_selector(&set.link)?,
        })
    }

    fn extract(&self, document: &Html) -> (SetAttempt, Vec<Listing>) {
        let mut containers = 0;
        let listings: Vec<Listing> = document
            .select(&self.listing)
            .inspect(|_| containers += 1)
            .map(|container| Listing {
                title: first_text(container, &self.title),
                price_text: first_text(container, &self.price),
                url: container
                    .select(&self.link)
                    .next()
                    .and_then(|link| link.value().attr("href"))
                    .map(str::trim)
                    .filter(|href| !href.is_empty())
                    .map(str::to_string),
            })
            .filter(Listing::has_data)
            .collect();

        let attempt = SetAttempt {
            set: self.id,
            containers,
            with_data: listings.len(),
        };
        (attempt, listings)
    }
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| {
        warn!("Invalid CSS selector '{}': {:?}", selector, e);
        AppError::InvalidSelector {
            selector: selector.to_string(),
        }
    })
}

/// Whitespace-collapsed text of the first match, `None` when absent or blank.
fn first_text(container: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let element = container.select(selector).next()?;
    let text = element.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Extracts listings by cascading through a primary and ordered fallback selector sets.
///
/// Sets are tried strictly in configured order and never reordered by past success.
/// A set wins when at least one of its containers yields any field; missing fields on
/// individual containers are left empty.
pub struct SelectorEngine {
    sets: Vec<CompiledSet>,
}

impl SelectorEngine {
    pub fn new(primary: &SelectorSet, fallbacks: &[SelectorSet]) -> Result<Self> {
        let mut sets = Vec::with_capacity(fallbacks.len() + 1);
        sets.push(CompiledSet::compile(SetId::Primary, primary)?);
        for (index, set) in fallbacks.iter().enumerate() {
            sets.push(CompiledSet::compile(SetId::Fallback(index), set)?);
        }
        Ok(Self { sets })
    }

    pub fn from_config(config: &SelectorConfig) -> Result<Self> {
        Self::new(&config.primary, &config.fallbacks)
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    pub fn extract_listings(&self, html: &str) -> Result<Vec<Listing>> {
        self.extract(html).map(|report| report.listings)
    }

    /// Fails with `StructureChanged` only after every set has been tried.
    pub fn extract(&self, html: &str) -> Result<ExtractionReport> {
        let document = Html::parse_document(html);
        let mut attempts = Vec::with_capacity(self.sets.len());

        for set in &self.sets {
            let (attempt, listings) = set.extract(&document);
            let succeeded = attempt.succeeded();

            if succeeded {
                if set.id == SetId::Primary {
                    debug!("Primary selectors matched {} listings", listings.len());
                } else {
                    info!("Using {} selectors, matched {} listings", set.id, listings.len());
                }
                attempts.push(attempt);
                return Ok(ExtractionReport {
                    listings,
                    matched: set.id,
                    attempts,
                });
            }

            if attempt.containers == 0 {
                debug!("No containers for {} selectors", set.id);
            } else {
                debug!("{} containers for {} selectors, none with data", attempt.containers, set.id);
            }
            attempts.push(attempt);
        }

        warn!("All {} selector sets failed, page structure changed", attempts.len());
        Err(AppError::StructureChanged {
            attempted: attempts.len(),
        })
    }
}
