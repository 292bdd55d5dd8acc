//! Canonical contract-opportunity model shared by every bidscope crate.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "bidscope-core";

/// Upstream feed a record was ingested from. Part of the dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Federal,
    Ny,
    Il,
}

impl SourceTag {
    pub const ALL: [SourceTag; 3] = [SourceTag::Federal, SourceTag::Ny, SourceTag::Il];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Federal => "federal",
            SourceTag::Ny => "ny",
            SourceTag::Il => "il",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown source tag `{0}` (expected one of: federal, ny, il)")]
pub struct SourceTagError(pub String);

impl FromStr for SourceTag {
    type Err = SourceTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "federal" => Ok(SourceTag::Federal),
            "ny" => Ok(SourceTag::Ny),
            "il" => Ok(SourceTag::Il),
            other => Err(SourceTagError(other.to_string())),
        }
    }
}

/// Award value that is always finite and non-negative.
///
/// Anything else (NaN, infinities, negative numbers) collapses to `0.0`, so the
/// invariant holds no matter how the value was produced or deserialized.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct AwardAmount(f64);

impl AwardAmount {
    pub const ZERO: AwardAmount = AwardAmount(0.0);

    pub fn new(value: f64) -> Self {
        if value.is_finite() && value >= 0.0 {
            Self(value)
        } else {
            Self::ZERO
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl From<f64> for AwardAmount {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl From<AwardAmount> for f64 {
    fn from(amount: AwardAmount) -> Self {
        amount.0
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Awardee {
    pub name: Option<String>,
    pub id: Option<String>,
    /// Upstream location blob, kept verbatim.
    pub location: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Award {
    pub date: Option<DateTime<Utc>>,
    pub number: Option<String>,
    #[serde(default)]
    pub amount: AwardAmount,
    pub awardee: Option<Awardee>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRef {
    pub code: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOfPerformance {
    pub state: Option<StateRef>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub zip: Option<String>,
}

impl PlaceOfPerformance {
    pub fn state_code(&self) -> Option<&str> {
        self.state.as_ref().and_then(|s| s.code.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.city.is_none() && self.country.is_none() && self.zip.is_none()
    }
}

/// Normalized listing persisted per `(source, natural_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRecord {
    pub natural_key: String,
    pub source: SourceTag,
    pub title: String,
    pub description: Option<String>,
    pub posted_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub notice_type: Option<String>,
    pub classification: Option<String>,
    pub naics_code: Option<String>,
    /// Legacy set-aside field still used by older dashboard filters.
    pub set_aside: Option<String>,
    pub type_of_set_aside: Option<String>,
    pub set_aside_description: Option<String>,
    #[serde(default)]
    pub award: Award,
    pub place_of_performance: Option<PlaceOfPerformance>,
    pub link: Option<String>,
    pub ui_link: Option<String>,
    pub additional_info_link: Option<String>,
    #[serde(default)]
    pub resource_links: Vec<String>,
    #[serde(default)]
    pub point_of_contact: Vec<JsonValue>,
}

impl ContractRecord {
    /// Empty record carrying only identity; mappers fill in the rest.
    pub fn new(source: SourceTag, natural_key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            natural_key: natural_key.into(),
            source,
            title: title.into(),
            description: None,
            posted_date: None,
            due_date: None,
            notice_type: None,
            classification: None,
            naics_code: None,
            set_aside: None,
            type_of_set_aside: None,
            set_aside_description: None,
            award: Award::default(),
            place_of_performance: None,
            link: None,
            ui_link: None,
            additional_info_link: None,
            resource_links: Vec::new(),
            point_of_contact: Vec::new(),
        }
    }

    /// Human-readable dedup key, e.g. `federal:abc123`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.source, self.natural_key)
    }

    pub fn state_code(&self) -> Option<&str> {
        self.place_of_performance
            .as_ref()
            .and_then(PlaceOfPerformance::state_code)
    }
}

/// A record as the store returns it, with write timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredContract {
    #[serde(flatten)]
    pub record: ContractRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inclusive posted-date window requested from an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Longest lookback any source may request.
pub const MAX_LOOKBACK_DAYS: i64 = 3650;

impl DateWindow {
    /// Window ending on `now`'s date. `days` is clamped to `0..=MAX_LOOKBACK_DAYS`.
    pub fn lookback(now: DateTime<Utc>, days: i64) -> Self {
        let to = now.date_naive();
        let from = TimeDelta::try_days(days.clamp(0, MAX_LOOKBACK_DAYS))
            .and_then(|span| to.checked_sub_signed(span))
            .unwrap_or(NaiveDate::MIN);
        Self { from, to }
    }
}
