use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::ExtractionFailure;
use crate::models::{ListingRecord, ListingReference, ListingStatus, RawPage};

/// One way of locating a logical field in a page. Each field has a
/// priority-ordered list of these; the first hit wins, so markup drift only
/// requires appending a strategy, not rewriting the extractor.
type FieldStrategy = fn(&Html) -> Option<String>;

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").expect("static regex"))
}

fn km_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)([\d,\.]+)\s*km\b").expect("static regex"))
}

fn bids_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s+bids?").expect("static regex"))
}

fn countdown_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\d+\s*(d|day|days|h|hour|hours|m|min|minutes|s|sec|seconds)\b")
            .expect("static regex")
    })
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn first_match(doc: &Html, strategies: &[FieldStrategy]) -> Option<String> {
    strategies.iter().find_map(|strategy| strategy(doc))
}

/// First numeric token of a price-like string, commas stripped.
fn parse_price(text: &str) -> Option<f64> {
    let m = digits_re().find(text)?;
    m.as_str().replace(',', "").parse().ok()
}

fn parse_odometer(text: &str) -> Option<u64> {
    let caps = km_re().captures(text)?;
    caps[1].replace([',', '.'], "").parse().ok()
}

/// Find the `dd` that follows a `dt` whose label contains `label`.
fn dl_lookup(doc: &Html, label: &str) -> Option<String> {
    let dt_sel = sel("dt");
    let needle = label.to_lowercase();
    for dt in doc.select(&dt_sel) {
        if !element_text(dt).to_lowercase().contains(&needle) {
            continue;
        }
        let mut node = dt.next_sibling();
        while let Some(n) = node {
            if let Some(el) = ElementRef::wrap(n) {
                if el.value().name() == "dd" {
                    let text = element_text(el);
                    if !text.is_empty() {
                        return Some(text);
                    }
                }
            }
            node = n.next_sibling();
        }
    }
    None
}

// ── identifier ────────────────────────────────────────────────

fn identifier_canonical_link(doc: &Html) -> Option<String> {
    let link = doc.select(&sel(r#"link[rel="canonical"]"#)).next()?;
    let href = link.value().attr("href")?;
    Some(ListingReference::from_url(href)?.identifier)
}

fn identifier_og_url(doc: &Html) -> Option<String> {
    let meta = doc.select(&sel(r#"meta[property="og:url"]"#)).next()?;
    let content = meta.value().attr("content")?;
    Some(ListingReference::from_url(content)?.identifier)
}

fn identifier_lot_anchor(doc: &Html) -> Option<String> {
    for a in doc.select(&sel(r#"a[href*="/lot/"]"#)) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        let absolute = if href.starts_with('/') {
            format!("https://host.invalid{href}")
        } else {
            href.to_string()
        };
        if let Some(r) = ListingReference::from_url(&absolute) {
            return Some(r.identifier);
        }
    }
    None
}

const IDENTIFIER_STRATEGIES: &[FieldStrategy] = &[
    identifier_canonical_link,
    identifier_og_url,
    identifier_lot_anchor,
];

// ── price ─────────────────────────────────────────────────────

fn price_itemprop(doc: &Html) -> Option<String> {
    doc.select(&sel(r#"span[itemprop="price"]"#))
        .map(element_text)
        .find(|t| !t.is_empty())
}

fn price_meta_itemprop(doc: &Html) -> Option<String> {
    doc.select(&sel(r#"meta[itemprop="price"]"#))
        .find_map(|m| m.value().attr("content").map(str::to_string))
}

fn price_current_bid(doc: &Html) -> Option<String> {
    doc.select(&sel(r#"[class*="current-bid"]"#))
        .map(element_text)
        .find(|t| digits_re().is_match(t))
}

const PRICE_STRATEGIES: &[FieldStrategy] =
    &[price_itemprop, price_meta_itemprop, price_current_bid];

// ── odometer ──────────────────────────────────────────────────

fn odometer_dl(doc: &Html) -> Option<String> {
    dl_lookup(doc, "odometer")
}

fn odometer_class(doc: &Html) -> Option<String> {
    doc.select(&sel(r#"[class*="odometer"]"#))
        .map(element_text)
        .find(|t| km_re().is_match(t))
}

fn odometer_km_text(doc: &Html) -> Option<String> {
    doc.select(&sel("dd, span, li"))
        .map(element_text)
        .find(|t| t.len() < 60 && km_re().is_match(t))
}

const ODOMETER_STRATEGIES: &[FieldStrategy] = &[odometer_dl, odometer_class, odometer_km_text];

// ── seller ────────────────────────────────────────────────────

fn seller_dl(doc: &Html) -> Option<String> {
    dl_lookup(doc, "seller")
}

fn seller_class(doc: &Html) -> Option<String> {
    doc.select(&sel(r#"[class*="seller"]"#))
        .map(element_text)
        .find(|t| !t.is_empty() && t.len() < 120)
}

const SELLER_STRATEGIES: &[FieldStrategy] = &[seller_dl, seller_class];

// ── location ──────────────────────────────────────────────────

fn location_dl(doc: &Html) -> Option<String> {
    dl_lookup(doc, "location")
}

fn location_class(doc: &Html) -> Option<String> {
    doc.select(&sel(r#"[class*="location"]"#))
        .map(element_text)
        .find(|t| !t.is_empty() && t.len() < 120)
}

const LOCATION_STRATEGIES: &[FieldStrategy] = &[location_dl, location_class];

// ── status markers ────────────────────────────────────────────

fn countdown_text(doc: &Html) -> Option<String> {
    doc.select(&sel("span#lot-closing-countdown"))
        .map(element_text)
        .find(|t| countdown_re().is_match(t))
}

fn date_sold_text(doc: &Html) -> Option<String> {
    doc.select(&sel("abbr.endtime"))
        .map(element_text)
        .find(|t| !t.is_empty())
}

fn withdrawn_stamp(doc: &Html) -> bool {
    let referred = doc
        .select(&sel("div.dls-heading-3"))
        .any(|el| element_text(el).contains("Referred"));
    let closed = doc
        .select(&sel("p.large-stamp-sale-closed"))
        .any(|el| element_text(el).contains("Sale closed"));
    referred || closed
}

fn extract_bids(doc: &Html) -> u32 {
    doc.select(&sel("a"))
        .map(element_text)
        .find_map(|t| {
            let caps = bids_re().captures(&t)?;
            caps[1].parse().ok()
        })
        .unwrap_or(0)
}

/// Extract all listing references from a search-results page, deduplicated
/// by identifier in first-seen order.
pub fn listing_links(html: &str, base_url: &str) -> Vec<ListingReference> {
    let doc = Html::parse_document(html);
    let base = Url::parse(base_url).ok();
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for a in doc.select(&sel("a[href]")) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        let absolute = if href.starts_with("http") {
            href.to_string()
        } else if let Some(base) = &base {
            match base.join(href) {
                Ok(u) => u.to_string(),
                Err(_) => continue,
            }
        } else {
            continue;
        };
        if let Some(reference) = ListingReference::from_url(&absolute) {
            if seen.insert(reference.identifier.clone()) {
                out.push(reference);
            }
        }
    }
    out
}

/// Pure extraction of a structured record from one fetched page.
///
/// Missing optional fields become explicit unknown markers; a page whose
/// identifier cannot be confirmed (or names a different lot than the one
/// requested) is an `ExtractionFailure` for that listing only.
pub fn extract(page: &RawPage) -> Result<ListingRecord, ExtractionFailure> {
    if !page.success || page.body.is_empty() {
        return Err(ExtractionFailure::new("content", &page.reference.url));
    }
    let doc = Html::parse_document(&page.body);

    let identifier = first_match(&doc, IDENTIFIER_STRATEGIES)
        .ok_or_else(|| ExtractionFailure::new("identifier", &page.reference.url))?;
    if identifier != page.reference.identifier {
        return Err(ExtractionFailure::new("identifier", &page.reference.url));
    }

    let price = first_match(&doc, PRICE_STRATEGIES).and_then(|t| parse_price(&t));
    let odometer = first_match(&doc, ODOMETER_STRATEGIES).and_then(|t| parse_odometer(&t));
    let seller = first_match(&doc, SELLER_STRATEGIES);
    let location = first_match(&doc, LOCATION_STRATEGIES);
    let bids = extract_bids(&doc);

    let countdown = countdown_text(&doc);
    let date_sold = date_sold_text(&doc);
    let (status, time_remaining_or_date_sold) = if let Some(countdown) = countdown {
        (ListingStatus::Active, Some(countdown))
    } else if withdrawn_stamp(&doc) {
        (ListingStatus::Withdrawn, None)
    } else if let (Some(date), true) = (date_sold, bids > 0) {
        (ListingStatus::Sold, Some(date))
    } else if price.is_some() && bids > 0 {
        // No explicit end time on the page; fall back to the fetch date.
        (
            ListingStatus::Sold,
            Some(page.fetched_at.format("%Y-%m-%d").to_string()),
        )
    } else {
        (ListingStatus::Unknown, None)
    };

    Ok(ListingRecord {
        identifier,
        url: page.reference.url.clone(),
        price,
        seller,
        odometer,
        location,
        status,
        bids,
        time_remaining_or_date_sold,
        last_seen: page.fetched_at,
    })
}
