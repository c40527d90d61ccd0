//! Rate-limit counters carried in ARM response headers.
//!
//! Example values:
//! ```text
//! x-ms-ratelimit-remaining-resource: Microsoft.Compute/HighCostGet3Min;133,Microsoft.Compute/HighCostGet30Min;657
//! x-ms-ratelimit-remaining-subscription-reads: 11535
//! ```

use log::debug;
use regex::Regex;
use reqwest::header::HeaderMap;
use std::sync::OnceLock;

use crate::counters::{CounterSet, SUBSCRIPTION_READS};
use crate::error::{LimitometerError, Result};

pub const REMAINING_RESOURCE: &str = "x-ms-ratelimit-remaining-resource";
pub const REMAINING_SUBSCRIPTION_READS: &str = "x-ms-ratelimit-remaining-subscription-reads";

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(Microsoft\.[A-Za-z0-9_]+/[A-Za-z0-9_]+);([0-9]+)").expect("static pattern"))
}

/// All counters found in one response's headers.
pub fn extract(headers: &HeaderMap) -> Result<CounterSet> {
    let mut set = extract_resource_remaining(headers)?;
    set.merge(extract_subscription_reads(headers)?);
    Ok(set)
}

/// Parse the comma-separated `Category;Count` list. Segments that do not
/// look like a counter are ignored; a later segment wins over an earlier one
/// with the same category.
pub fn extract_resource_remaining(headers: &HeaderMap) -> Result<CounterSet> {
    let mut set = CounterSet::new();
    let Some(raw) = headers.get(REMAINING_RESOURCE) else {
        return Ok(set);
    };
    let value = String::from_utf8_lossy(raw.as_bytes());

    for segment in value.split(',') {
        let Some(caps) = segment_pattern().captures(segment) else {
            continue;
        };
        let category = &caps[1];
        let count = caps[2]
            .parse::<u64>()
            .map_err(|_| LimitometerError::MalformedCounter {
                header: REMAINING_RESOURCE,
                value: segment.to_string(),
            })?;
        set.insert(category, count);
    }
    Ok(set)
}

/// Parse the subscription-level bare integer into the [`SUBSCRIPTION_READS`] entry.
pub fn extract_subscription_reads(headers: &HeaderMap) -> Result<CounterSet> {
    let mut set = CounterSet::new();
    let Some(raw) = headers.get(REMAINING_SUBSCRIPTION_READS) else {
        return Ok(set);
    };
    let value = String::from_utf8_lossy(raw.as_bytes());
    let value = value.trim();
    if value.is_empty() {
        debug!("{} present but empty", REMAINING_SUBSCRIPTION_READS);
        return Ok(set);
    }
    let count = value
        .parse::<u64>()
        .map_err(|_| LimitometerError::MalformedCounter {
            header: REMAINING_SUBSCRIPTION_READS,
            value: value.to_string(),
        })?;
    set.insert(SUBSCRIPTION_READS, count);
    Ok(set)
}
