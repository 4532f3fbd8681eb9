use async_trait::async_trait;
use intake_core::{ContentItem, ContentKind, Metadata};
use intake_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::text::{
    all_texts, first_attr, first_text, parse_amount_range, parse_loose_date, parse_selector,
};
use crate::{
    build_items, check_source, fetch_source_payload, AdapterContext, AdapterError, HtmlSelectors,
    RawPayload, RecordFields, SourceAdapter, SourceConfig, SourceFormat,
};

/// Directory pages parsed with CSS selectors, one record per `item` match.
#[derive(Debug, Clone)]
pub struct HtmlListingAdapter {
    config: SourceConfig,
    selectors: HtmlSelectors,
}

struct CompiledSelectors {
    item: Selector,
    title: Selector,
    link: Selector,
    description: Selector,
    amount: Selector,
    date: Selector,
    organization: Selector,
    eligibility: Selector,
    tags: Selector,
}

impl CompiledSelectors {
    fn compile(s: &HtmlSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            item: parse_selector(&s.item)?,
            title: parse_selector(&s.title)?,
            link: parse_selector(&s.link)?,
            description: parse_selector(&s.description)?,
            amount: parse_selector(&s.amount)?,
            date: parse_selector(&s.date)?,
            organization: parse_selector(&s.organization)?,
            eligibility: parse_selector(&s.eligibility)?,
            tags: parse_selector(&s.tags)?,
        })
    }
}

impl HtmlListingAdapter {
    /// Fails when any configured selector does not parse.
    pub fn new(config: SourceConfig) -> Result<Self, AdapterError> {
        let selectors = config.selectors.clone().unwrap_or_default();
        CompiledSelectors::compile(&selectors)?;
        Ok(Self { config, selectors })
    }
}

fn resolve_link(base: Option<&Url>, href: &str) -> Option<String> {
    match base {
        Some(base) => base.join(href).ok().map(String::from),
        None => Url::parse(href).ok().map(String::from),
    }
}

fn record_from_card(
    card: &ElementRef<'_>,
    sel: &CompiledSelectors,
    base: Option<&Url>,
    kind: ContentKind,
) -> RecordFields {
    let href = first_attr(card, &sel.link, "href");
    let url = href.as_deref().and_then(|h| resolve_link(base, h));
    let amount_text = first_text(card, &sel.amount);
    let date_text = first_text(card, &sel.date);
    let date = date_text.as_deref().and_then(parse_loose_date);

    let mut metadata = Metadata::new();
    metadata.insert("listing_url", base.map(|b| b.to_string()));
    metadata.insert("amount_text", amount_text.clone());
    metadata.insert("date_text", date_text.clone());
    if date_text
        .as_deref()
        .is_some_and(|t| t.to_ascii_lowercase().contains("rolling"))
    {
        metadata.insert("rolling", true);
    }

    RecordFields {
        title: first_text(card, &sel.title),
        url: url.clone(),
        description: first_text(card, &sel.description),
        published_at: match kind {
            ContentKind::Funding => None,
            _ => date.and_then(|d| d.and_hms_opt(0, 0, 0)).map(|dt| dt.and_utc()),
        },
        tags: all_texts(card, &sel.tags),
        amount: amount_text.as_deref().map(parse_amount_range).unwrap_or_default(),
        deadline: match kind {
            ContentKind::Funding => date,
            _ => None,
        },
        eligibility: first_text(card, &sel.eligibility),
        organization: first_text(card, &sel.organization),
        apply_url: url,
        metadata,
        ..Default::default()
    }
}

#[async_trait]
impl SourceAdapter for HtmlListingAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn kind(&self) -> ContentKind {
        self.config.kind
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::HtmlListing
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawPayload>, AdapterError> {
        let headers = [("accept", "text/html,application/xhtml+xml".to_string())];
        Ok(vec![fetch_source_payload(&self.config, http, ctx, &headers).await?])
    }

    fn transform(&self, raw: &RawPayload) -> Result<Vec<ContentItem>, AdapterError> {
        check_source(&self.config, raw)?;
        let sel = CompiledSelectors::compile(&self.selectors)?;
        let document = Html::parse_document(raw.text()?);
        let base = Url::parse(&raw.url).ok();
        let records = document
            .select(&sel.item)
            .map(|card| record_from_card(&card, &sel, base.as_ref(), self.config.kind))
            .collect();
        Ok(build_items(&self.config.source_id, self.config.kind, raw.fetched_at, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceMode;
    use chrono::{NaiveDate, TimeZone, Utc};
    use intake_core::ContentDetails;

    const PAGE: &str = r#"
<html><body>
  <div class="program">
    <h3>Climate Seed Grant</h3>
    <a href="/programs/climate-seed?utm_source=dir">Apply</a>
    <p class="description">Non-dilutive grants for early climate startups.</p>
    <span class="amount">$25k - $150,000</span>
    <span class="deadline">Deadline: April 15, 2026</span>
    <span class="organization">Green Future Fund</span>
    <span class="eligibility">Pre-seed companies in the EU</span>
    <span class="tag">climate</span><span class="tag">grant</span>
  </div>
  <div class="program">
    <h3>Untitled link only</h3>
  </div>
</body></html>
"#;

    fn config(selectors: Option<HtmlSelectors>) -> SourceConfig {
        SourceConfig {
            source_id: "grant-dir".into(),
            display_name: "Grant Directory".into(),
            enabled: true,
            kind: ContentKind::Funding,
            format: SourceFormat::HtmlListing,
            mode: SourceMode::Live,
            endpoint: "https://grants.example/programs".into(),
            api_key_env: None,
            selectors,
            fixture_path: None,
            rate_limit: None,
        }
    }

    fn payload() -> RawPayload {
        RawPayload {
            source_id: "grant-dir".into(),
            url: "https://grants.example/programs".into(),
            content_type: "text/html".into(),
            body: PAGE.as_bytes().to_vec(),
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn funding_cards_resolve_links_and_amounts() {
        let adapter = HtmlListingAdapter::new(config(None)).unwrap();
        let items = adapter.transform(&payload()).unwrap();
        assert_eq!(items.len(), 1, "card without link or description is skipped");
        let item = &items[0];
        assert_eq!(item.title(), "Climate Seed Grant");
        assert_eq!(item.url_key(), "https://grants.example/programs/climate-seed");
        let ContentDetails::Funding(funding) = item.details() else {
            panic!("funding expected");
        };
        assert_eq!(funding.amount_min, Some(25_000.0));
        assert_eq!(funding.amount_max, Some(150_000.0));
        assert_eq!(funding.currency.as_deref(), Some("USD"));
        assert_eq!(funding.deadline, NaiveDate::from_ymd_opt(2026, 4, 15));
        assert_eq!(funding.organization.as_deref(), Some("Green Future Fund"));
    }

    #[test]
    fn transform_is_deterministic() {
        let adapter = HtmlListingAdapter::new(config(None)).unwrap();
        assert_eq!(adapter.transform(&payload()).unwrap(), adapter.transform(&payload()).unwrap());
    }

    #[test]
    fn invalid_selectors_fail_at_construction() {
        let selectors = HtmlSelectors {
            item: "div[".into(),
            ..Default::default()
        };
        assert!(matches!(
            HtmlListingAdapter::new(config(Some(selectors))),
            Err(AdapterError::Selector { .. })
        ));
    }
}
