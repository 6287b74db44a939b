//! Identifier lists for each universe.
//!
//! A universe's tickers come either from the config file or from an index
//! constituent page. Page parsing is kept in pure functions so it can be
//! tested against saved HTML.

use crate::config::{SyncConfig, UniverseConfig, UniverseSource};
use crate::domain::Universe;
use crate::provider::{DataError, SymbolConvention};
use scraper::{Html, Selector};
use std::collections::BTreeSet;
use std::time::Duration;

/// Anything that can produce a list of provider symbols.
pub trait ConstituentSource {
    fn describe(&self) -> String;

    fn fetch(&self) -> Result<Vec<String>, DataError>;
}

pub struct StaticList {
    tickers: Vec<String>,
    convention: SymbolConvention,
}

impl StaticList {
    pub fn new(tickers: Vec<String>, convention: SymbolConvention) -> Self {
        Self {
            tickers,
            convention,
        }
    }
}

impl ConstituentSource for StaticList {
    fn describe(&self) -> String {
        format!("static list ({} tickers)", self.tickers.len())
    }

    fn fetch(&self) -> Result<Vec<String>, DataError> {
        Ok(finalize(
            self.tickers
                .iter()
                .filter(|t| !t.trim().is_empty())
                .map(|t| t.trim().to_string()),
            &self.convention,
        ))
    }
}

/// Which HTML layout a constituent page uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLayout {
    /// `div.component-list-item_code` cells inside table rows.
    Nikkei,
    /// `td > a[href*="/stock/"]` links ending in the code.
    Minkabu,
}

pub struct ConstituentPage {
    url: String,
    layout: PageLayout,
    client: reqwest::blocking::Client,
    convention: SymbolConvention,
}

impl ConstituentPage {
    pub fn new(
        url: impl Into<String>,
        layout: PageLayout,
        client: reqwest::blocking::Client,
        convention: SymbolConvention,
    ) -> Self {
        Self {
            url: url.into(),
            layout,
            client,
            convention,
        }
    }
}

impl ConstituentSource for ConstituentPage {
    fn describe(&self) -> String {
        format!("{:?} page {}", self.layout, self.url)
    }

    fn fetch(&self) -> Result<Vec<String>, DataError> {
        let resp = self.client.get(&self.url).send().map_err(|e| {
            if e.is_timeout() {
                DataError::Timeout(format!("{}: {e}", self.url))
            } else {
                DataError::NetworkUnreachable(format!("{}: {e}", self.url))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DataError::Scrape(format!("HTTP {status} for {}", self.url)));
        }

        let html = resp
            .text()
            .map_err(|e| DataError::Scrape(format!("read body of {}: {e}", self.url)))?;

        let codes = match self.layout {
            PageLayout::Nikkei => parse_nikkei_codes(&html)?,
            PageLayout::Minkabu => parse_minkabu_codes(&html)?,
        };
        Ok(finalize(codes.into_iter(), &self.convention))
    }
}

fn selector(css: &str) -> Result<Selector, DataError> {
    Selector::parse(css).map_err(|e| DataError::Scrape(format!("bad selector '{css}': {e}")))
}

fn is_security_code(code: &str) -> bool {
    code.len() == 4 && code.chars().all(|c| c.is_ascii_digit())
}

/// Four-digit codes from the Nikkei component list.
pub fn parse_nikkei_codes(html: &str) -> Result<Vec<String>, DataError> {
    let document = Html::parse_document(html);
    let row_selector = selector("tr")?;
    let code_selector = selector("div.component-list-item_code")?;

    let mut codes = Vec::new();
    for row in document.select(&row_selector) {
        if let Some(cell) = row.select(&code_selector).next() {
            let code = cell.text().collect::<String>().trim().to_string();
            if is_security_code(&code) {
                codes.push(code);
            }
        }
    }
    Ok(codes)
}

/// Four-digit codes from the last segment of Minkabu `/stock/<code>` links.
pub fn parse_minkabu_codes(html: &str) -> Result<Vec<String>, DataError> {
    let document = Html::parse_document(html);
    let link_selector = selector(r#"td > a[href*="/stock/"]"#)?;

    let codes = document
        .select(&link_selector)
        .filter_map(|link| link.value().attr("href"))
        .filter_map(|href| {
            let parts: Vec<&str> = href.split('/').collect();
            match parts.last() {
                Some(last) if parts.len() > 2 && is_security_code(last) => {
                    Some((*last).to_string())
                }
                _ => None,
            }
        })
        .collect();
    Ok(codes)
}

/// Suffix, de-duplicate, and sort.
fn finalize(codes: impl Iterator<Item = String>, convention: &SymbolConvention) -> Vec<String> {
    codes
        .map(|c| convention.to_provider(&c))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Builds each configured universe's identifier list.
pub struct UniverseResolver {
    client: reqwest::blocking::Client,
    convention: SymbolConvention,
    pause: Duration,
}

impl UniverseResolver {
    pub fn new(config: &SyncConfig) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.constituents.timeout())
            .user_agent(config.provider.user_agent.as_str())
            .build()
            .map_err(|e| DataError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            convention: SymbolConvention::with_suffix(config.provider.symbol_suffix.clone()),
            pause: config.constituents.request_pause(),
        })
    }

    fn source_for(&self, universe: &UniverseConfig) -> Box<dyn ConstituentSource> {
        match &universe.source {
            UniverseSource::Static { tickers } => {
                Box::new(StaticList::new(tickers.clone(), self.convention.clone()))
            }
            UniverseSource::NikkeiPage { url } => Box::new(ConstituentPage::new(
                url.clone(),
                PageLayout::Nikkei,
                self.client.clone(),
                self.convention.clone(),
            )),
            UniverseSource::MinkabuPage { url } => Box::new(ConstituentPage::new(
                url.clone(),
                PageLayout::Minkabu,
                self.client.clone(),
                self.convention.clone(),
            )),
        }
    }

    /// Resolve the selected universes (all of them when `only` is empty).
    ///
    /// A source that fails yields an empty identifier list; whether that is
    /// fatal is decided by the universe's `required` flag downstream.
    pub fn resolve(&self, config: &SyncConfig, only: &[String]) -> Vec<Universe> {
        let mut universes = Vec::new();
        let mut fetched_page = false;

        for uc in &config.universes {
            if !only.is_empty() && !only.iter().any(|n| n == &uc.name) {
                continue;
            }

            let is_page = !matches!(uc.source, UniverseSource::Static { .. });
            if is_page && fetched_page && !self.pause.is_zero() {
                std::thread::sleep(self.pause);
            }
            fetched_page |= is_page;

            let source = self.source_for(uc);
            let identifiers = match source.fetch() {
                Ok(ids) => {
                    if ids.is_empty() {
                        tracing::warn!(
                            universe = %uc.name,
                            source = %source.describe(),
                            "no identifiers found; page layout may have changed"
                        );
                    } else {
                        tracing::info!(universe = %uc.name, count = ids.len(), "identifiers acquired");
                    }
                    ids
                }
                Err(e) => {
                    tracing::error!(
                        universe = %uc.name,
                        source = %source.describe(),
                        error = %e,
                        "identifier list acquisition failed"
                    );
                    Vec::new()
                }
            };

            universes.push(Universe {
                name: uc.name.clone(),
                identifiers,
                path: config.resolve_path(&uc.path),
                required: uc.required,
            });
        }

        universes
    }
}
