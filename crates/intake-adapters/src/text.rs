//! Text helpers shared by the format parsers.

use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;

use crate::AdapterError;

pub(crate) fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let collapsed = collapse(value.as_ref());
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Visible text of an HTML fragment with whitespace collapsed.
pub(crate) fn strip_html(fragment: &str) -> String {
    let parsed = Html::parse_fragment(fragment);
    collapse(&parsed.root_element().text().collect::<Vec<_>>().join(" "))
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn first_text(element: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
}

pub(crate) fn all_texts(element: &ElementRef<'_>, selector: &Selector) -> Vec<String> {
    element
        .select(selector)
        .filter_map(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
        .collect()
}

pub(crate) fn first_attr(element: &ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none)
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str().filter(|s| !s.trim().is_empty())
}

pub(crate) fn json_u64(value: &JsonValue, path: &[&str]) -> Option<u64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_u64()
}

pub(crate) fn json_string_vec(value: &JsonValue, path: &[&str]) -> Vec<String> {
    let mut cur = value;
    for segment in path {
        match cur.get(*segment) {
            Some(next) => cur = next,
            None => return Vec::new(),
        }
    }
    cur.as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).filter_map(text_or_none).collect())
        .unwrap_or_default()
}

/// Parses `2026-03-31`, `March 31, 2026`, `Mar 31, 2026` and `31 March 2026`.
/// Anything else, including "rolling", is treated as no date.
pub(crate) fn parse_loose_date(text: &str) -> Option<NaiveDate> {
    let cleaned = collapse(text)
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string();
    let cleaned = ["deadline:", "due:", "closes", "apply by"]
        .iter()
        .fold(cleaned, |acc, prefix| {
            if acc.to_ascii_lowercase().starts_with(prefix) {
                acc[prefix.len()..].trim().to_string()
            } else {
                acc
            }
        });
    let date_part = cleaned.get(..10).unwrap_or(&cleaned);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(&cleaned, "%B %d, %Y").ok())
        .or_else(|| NaiveDate::parse_from_str(&cleaned, "%b %d, %Y").ok())
        .or_else(|| NaiveDate::parse_from_str(&cleaned, "%d %B %Y").ok())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct AmountRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub currency: Option<String>,
}

/// Extracts a money range from text such as `$25k - $150,000`, `up to €2M` or
/// `50,000 USD`.
pub(crate) fn parse_amount_range(text: &str) -> AmountRange {
    let lower = text.to_ascii_lowercase();
    let amounts = extract_amounts(text);
    let currency = if text.contains('$') || lower.contains("usd") {
        Some("USD")
    } else if text.contains('€') || lower.contains("eur") {
        Some("EUR")
    } else if text.contains('£') || lower.contains("gbp") {
        Some("GBP")
    } else {
        None
    };
    let (min, max) = match amounts.as_slice() {
        [] => (None, None),
        [only] if lower.contains("up to") => (None, Some(*only)),
        [only] => (Some(*only), Some(*only)),
        [first, .., last] => (Some(first.min(*last)), Some(first.max(*last))),
    };
    AmountRange {
        min,
        max,
        currency: currency.filter(|_| min.is_some() || max.is_some()).map(str::to_string),
    }
}

fn extract_amounts(text: &str) -> Vec<f64> {
    let chars = text.chars().collect::<Vec<_>>();
    let mut out = Vec::new();
    let mut idx = 0;
    while idx < chars.len() {
        if !chars[idx].is_ascii_digit() {
            idx += 1;
            continue;
        }
        let mut digits = String::new();
        while idx < chars.len() && (chars[idx].is_ascii_digit() || chars[idx] == ',' || chars[idx] == '.') {
            if chars[idx] != ',' {
                digits.push(chars[idx]);
            }
            idx += 1;
        }
        let Ok(mut value) = digits.trim_end_matches('.').parse::<f64>() else {
            continue;
        };
        let rest = chars[idx..].iter().collect::<String>().to_ascii_lowercase();
        let rest = rest.trim_start();
        if rest.starts_with("million") || rest.starts_with("mm") {
            value *= 1_000_000.0;
        } else if rest.starts_with('k') && !rest.starts_with("kr") {
            value *= 1_000.0;
        } else if rest.starts_with('m') && !rest.starts_with("mo") && !rest.starts_with("min") {
            value *= 1_000_000.0;
        } else if rest.starts_with("thousand") {
            value *= 1_000.0;
        }
        out.push(value);
    }
    out
}
