//! Record extraction from listing and detail pages
//!
//! This module applies a site's selectors to fetched HTML:
//! - Compiling and validating the selectors once per job
//! - Splitting a listing page into cards, in document order
//! - Capturing card fields, the record link and detail-page fields
//! - Computing listing page URLs for each pagination pattern
//!
//! Parsed documents never outlive the call that created them, so nothing
//! here is held across an await point.

use crate::site::{Locator, PaginationPattern, Selectors};
use crate::url::resolve_link;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

/// A locator that failed to compile
#[derive(Debug, Clone, Error)]
#[error("invalid selector for {label} ('{locator}'): {message}")]
pub struct SelectorError {
    pub label: String,
    pub locator: String,
    pub message: String,
}

/// Result of applying one locator inside a card
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    /// No element matched
    Missing,
    /// An element matched but produced no text (or lacked the attribute)
    Empty,
    Value(String),
}

impl Capture {
    pub fn is_match(&self) -> bool {
        !matches!(self, Self::Missing)
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledLocator {
    selector: Selector,
    attribute: Option<String>,
}

impl CompiledLocator {
    fn compile(label: &str, raw: &str) -> Result<Self, SelectorError> {
        let locator = Locator::parse(raw);
        let selector = Selector::parse(locator.selector).map_err(|e| SelectorError {
            label: label.to_string(),
            locator: raw.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            selector,
            attribute: locator.attribute.map(str::to_string),
        })
    }

    fn capture(&self, scope: ElementRef<'_>) -> Capture {
        let Some(element) = scope.select(&self.selector).next() else {
            return Capture::Missing;
        };
        capture_element(element, self.attribute.as_deref())
    }
}

fn capture_element(element: ElementRef<'_>, attribute: Option<&str>) -> Capture {
    let raw = match attribute {
        Some(attr) => element.value().attr(attr).unwrap_or("").to_string(),
        None => element.text().collect::<Vec<_>>().join(" "),
    };
    let value = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if value.is_empty() {
        Capture::Empty
    } else {
        Capture::Value(value)
    }
}

/// A site's selectors, compiled
#[derive(Debug, Clone)]
pub struct CompiledSelectors {
    card: Selector,
    link: CompiledLocator,
    fields: Vec<(String, CompiledLocator)>,
    detail: Vec<(String, CompiledLocator)>,
    next_link: Option<Selector>,
}

impl CompiledSelectors {
    /// Compiles every locator, failing on the first one that does not parse
    pub fn compile(
        selectors: &Selectors,
        pagination: &PaginationPattern,
    ) -> Result<Self, SelectorError> {
        let card = Selector::parse(selectors.card.trim()).map_err(|e| SelectorError {
            label: "card".to_string(),
            locator: selectors.card.clone(),
            message: e.to_string(),
        })?;
        let mut link = CompiledLocator::compile("link", &selectors.link)?;
        if link.attribute.is_none() {
            link.attribute = Some("href".to_string());
        }

        let fields = selectors
            .fields
            .iter()
            .map(|(name, raw)| {
                CompiledLocator::compile(&format!("field '{}'", name), raw)
                    .map(|loc| (name.clone(), loc))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let detail = selectors
            .detail
            .iter()
            .map(|(name, raw)| {
                CompiledLocator::compile(&format!("detail '{}'", name), raw)
                    .map(|loc| (name.clone(), loc))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let next_link = match pagination {
            PaginationPattern::NextLink { selector } => {
                Some(Selector::parse(selector.trim()).map_err(|e| SelectorError {
                    label: "next link".to_string(),
                    locator: selector.clone(),
                    message: e.to_string(),
                })?)
            }
            _ => None,
        };

        Ok(Self {
            card,
            link,
            fields,
            detail,
            next_link,
        })
    }

    pub fn has_detail_fields(&self) -> bool {
        !self.detail.is_empty()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }
}

/// Raw captures of one card
#[derive(Debug, Clone)]
pub struct CardCaptures {
    /// Raw link value (usually an `href`)
    pub link: Option<String>,
    pub fields: BTreeMap<String, Capture>,
}

/// A listing card turned into a record candidate
#[derive(Debug, Clone, PartialEq)]
pub struct ListingCard {
    /// Normalized record URL, `None` if the link could not be resolved
    pub url: Option<Url>,
    /// Non-empty field values
    pub fields: BTreeMap<String, String>,
}

/// Everything extracted from one listing page
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub cards: Vec<ListingCard>,
    /// Next listing page for `next_link` pagination
    pub next_page: Option<Url>,
}

/// Applies the card and field selectors to a document, in document order
pub fn capture_cards(html: &str, compiled: &CompiledSelectors) -> Vec<CardCaptures> {
    let document = Html::parse_document(html);
    capture_cards_in(&document, compiled)
}

fn capture_cards_in(document: &Html, compiled: &CompiledSelectors) -> Vec<CardCaptures> {
    document
        .select(&compiled.card)
        .map(|card| {
            let link = match compiled.link.capture(card) {
                Capture::Value(v) => Some(v),
                // A card that is itself the link
                _ => compiled
                    .link
                    .attribute
                    .as_deref()
                    .and_then(|attr| card.value().attr(attr))
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty()),
            };

            let fields = compiled
                .fields
                .iter()
                .map(|(name, locator)| (name.clone(), locator.capture(card)))
                .collect();

            CardCaptures { link, fields }
        })
        .collect()
}

/// Extracts the cards of a listing page
///
/// # Arguments
///
/// * `html` - The listing page body
/// * `page_url` - URL the page was fetched from, used to resolve links
/// * `compiled` - The site's compiled selectors
pub fn extract_listing(html: &str, page_url: &Url, compiled: &CompiledSelectors) -> ListingPage {
    let document = Html::parse_document(html);

    let cards = capture_cards_in(&document, compiled)
        .into_iter()
        .map(|captures| ListingCard {
            url: captures
                .link
                .as_deref()
                .and_then(|href| resolve_link(page_url, href)),
            fields: captures
                .fields
                .into_iter()
                .filter_map(|(name, capture)| match capture {
                    Capture::Value(v) => Some((name, v)),
                    _ => None,
                })
                .collect(),
        })
        .collect();

    let next_page = compiled.next_link.as_ref().and_then(|selector| {
        document
            .select(selector)
            .find_map(|el| el.value().attr("href"))
            .and_then(|href| resolve_link(page_url, href))
    });

    ListingPage { cards, next_page }
}

/// Extracts the detail fields of a record page
pub fn extract_detail(html: &str, compiled: &CompiledSelectors) -> BTreeMap<String, String> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    compiled
        .detail
        .iter()
        .filter_map(|(name, locator)| match locator.capture(root) {
            Capture::Value(v) => Some((name.clone(), v)),
            _ => None,
        })
        .collect()
}

/// Computes the URL of listing page `index` (zero-based)
///
/// The first page is always the site's base URL. Returns `None` when the
/// pattern cannot produce the page (no pagination, or `next_link`, whose pages
/// come from the previous page).
pub fn listing_page_url(base: &Url, pattern: &PaginationPattern, index: u32) -> Option<Url> {
    if index == 0 {
        return Some(base.clone());
    }

    match pattern {
        PaginationPattern::None | PaginationPattern::NextLink { .. } => None,
        PaginationPattern::QueryParam { param, start } => {
            let page = start.saturating_add(index);
            let mut url = base.clone();
            let pairs: Vec<(String, String)> = base
                .query_pairs()
                .filter(|(k, _)| k != param.as_str())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            url.query_pairs_mut()
                .clear()
                .extend_pairs(pairs)
                .append_pair(param, &page.to_string());
            Some(url)
        }
        PaginationPattern::PathTemplate { template } => {
            let page = index.saturating_add(1);
            let filled = template.replace("{page}", &page.to_string());
            base.join(&filled).ok()
        }
    }
}
