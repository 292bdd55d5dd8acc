//! Upstream JSON to [`ContractRecord`] mapping.
//!
//! Each source has a [`FieldMap`]: for every canonical field, an ordered list
//! of candidate paths into the raw record. Paths are dotted; a numeric segment
//! indexes into an array (`pointOfContact.0.email`). The first candidate that
//! resolves to a non-blank value wins.

use bidscope_core::{
    Award, AwardAmount, Awardee, ContractRecord, PlaceOfPerformance, SourceTag, StateRef,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;

/// Title used when a record has an identifier but no usable title.
pub const UNTITLED: &str = "Untitled";

type Paths = &'static [&'static str];

/// Candidate paths per canonical field for one upstream.
#[derive(Debug)]
pub struct FieldMap {
    pub natural_key: Paths,
    pub title: Paths,
    pub description: Paths,
    pub posted_date: Paths,
    pub due_date: Paths,
    pub notice_type: Paths,
    pub classification: Paths,
    pub naics_code: Paths,
    pub set_aside: Paths,
    pub set_aside_description: Paths,
    pub award_date: Paths,
    pub award_number: Paths,
    pub award_amount: Paths,
    pub awardee_name: Paths,
    pub awardee_id: Paths,
    pub awardee_location: Paths,
    pub state_code: Paths,
    pub state_name: Paths,
    pub city: Paths,
    pub country: Paths,
    pub zip: Paths,
    pub link: Paths,
    pub ui_link: Paths,
    pub additional_info_link: Paths,
    pub resource_links: Paths,
    pub point_of_contact: Paths,
    /// Identifier paths a detail URL may be built from.
    pub link_key: Paths,
    /// Detail page template; `{key}` is replaced by the `link_key` value.
    pub detail_url: Option<&'static str>,
    /// Every record of this source is performed in this state.
    pub fixed_state: Option<(&'static str, &'static str)>,
}

pub static FEDERAL_FIELDS: FieldMap = FieldMap {
    natural_key: &["noticeId", "noticeID", "solicitationNumber"],
    title: &["title"],
    description: &["description"],
    posted_date: &["postedDate"],
    due_date: &["responseDeadLine", "responseDeadline", "reponseDeadLine"],
    notice_type: &["type", "baseType"],
    classification: &["classificationCode"],
    naics_code: &["naicsCode", "naicsCodes.0"],
    set_aside: &["typeOfSetAside", "setAside"],
    set_aside_description: &["typeOfSetAsideDescription", "setAsideDescription"],
    award_date: &["award.date"],
    award_number: &["award.number"],
    award_amount: &["award.amount", "awardAmount", "totalValue"],
    awardee_name: &["award.awardee.name"],
    awardee_id: &["award.awardee.ueiSAM", "award.awardee.duns"],
    awardee_location: &["award.awardee.location"],
    state_code: &["placeOfPerformance.state.code"],
    state_name: &["placeOfPerformance.state.name"],
    city: &["placeOfPerformance.city.name", "placeOfPerformance.city"],
    country: &["placeOfPerformance.country.code", "placeOfPerformance.country"],
    zip: &["placeOfPerformance.zip"],
    link: &["link"],
    ui_link: &["uiLink"],
    additional_info_link: &["additionalInfoLink"],
    resource_links: &["resourceLinks"],
    point_of_contact: &["pointOfContact"],
    link_key: &["noticeId", "noticeID"],
    detail_url: Some("https://sam.gov/opp/{key}/view"),
    fixed_state: None,
};

pub static NY_FIELDS: FieldMap = FieldMap {
    natural_key: &["epin"],
    title: &["short_title", "type_of_notice_description"],
    description: &["printout_1", "additional_description_1"],
    posted_date: &["registration_date", "start_date"],
    due_date: &["due_date"],
    notice_type: &["type_of_notice_description"],
    classification: &["category_description"],
    naics_code: &[],
    set_aside: &[],
    set_aside_description: &[],
    award_date: &["end_date"],
    award_number: &["pin"],
    award_amount: &["contract_amount"],
    awardee_name: &["vendor_name"],
    awardee_id: &[],
    awardee_location: &["vendor_address"],
    state_code: &[],
    state_name: &[],
    city: &[],
    country: &[],
    zip: &[],
    link: &[],
    ui_link: &[],
    additional_info_link: &[],
    resource_links: &[],
    point_of_contact: &["contact_name"],
    link_key: &["epin"],
    detail_url: Some("https://passport.cityofnewyork.us/page.aspx/en/ctr/contract_public?cn={key}"),
    fixed_state: Some(("NY", "New York")),
};

pub static IL_FIELDS: FieldMap = FieldMap {
    natural_key: &["contract_number", "contract_no"],
    title: &["contract_title", "description"],
    description: &["description", "contract_title"],
    posted_date: &["award_date", "start_date"],
    due_date: &["end_date"],
    notice_type: &["contract_type"],
    classification: &["department", "using_agency"],
    naics_code: &[],
    set_aside: &[],
    set_aside_description: &[],
    award_date: &["award_date"],
    award_number: &["contract_number"],
    award_amount: &["contract_amount", "amount"],
    awardee_name: &["vendor_name", "vendor"],
    awardee_id: &["vendor_id"],
    awardee_location: &[],
    state_code: &[],
    state_name: &[],
    city: &[],
    country: &[],
    zip: &[],
    link: &[],
    ui_link: &[],
    additional_info_link: &[],
    resource_links: &[],
    point_of_contact: &[],
    link_key: &["contract_number", "contract_no"],
    detail_url: Some("https://datacatalog.cookcountyil.gov/resource/qh8j-6k63?contract_number={key}"),
    fixed_state: Some(("IL", "Illinois")),
};

pub fn field_map(source: SourceTag) -> &'static FieldMap {
    match source {
        SourceTag::Federal => &FEDERAL_FIELDS,
        SourceTag::Ny => &NY_FIELDS,
        SourceTag::Il => &IL_FIELDS,
    }
}

/// Map one upstream record. `None` means neither a natural key nor a title
/// could be resolved and the record must be dropped.
pub fn normalize(source: SourceTag, raw: &JsonValue) -> Option<ContractRecord> {
    normalize_with(source, field_map(source), raw)
}

pub fn normalize_with(source: SourceTag, map: &FieldMap, raw: &JsonValue) -> Option<ContractRecord> {
    let id = first_text(raw, map.natural_key);
    let title = first_text(raw, map.title);

    let natural_key = match (&id, &title) {
        (Some(id), _) => id.clone(),
        (None, Some(title)) => title.clone(),
        (None, None) => return None,
    };

    let mut record = ContractRecord::new(
        source,
        natural_key,
        title.unwrap_or_else(|| UNTITLED.to_string()),
    );
    record.description = first_text(raw, map.description);
    record.posted_date = first_present(raw, map.posted_date).and_then(parse_date);
    record.due_date = first_present(raw, map.due_date).and_then(parse_date);
    record.notice_type = first_text(raw, map.notice_type);
    record.classification = first_text(raw, map.classification);
    record.naics_code = first_text(raw, map.naics_code);

    let set_aside = first_text(raw, map.set_aside);
    record.type_of_set_aside = set_aside.clone();
    record.set_aside = set_aside;
    record.set_aside_description = first_text(raw, map.set_aside_description);

    record.award = Award {
        date: first_present(raw, map.award_date).and_then(parse_date),
        number: first_text(raw, map.award_number),
        amount: parse_amount(first_present(raw, map.award_amount)),
        awardee: awardee(raw, map),
    };
    record.place_of_performance = place_of_performance(raw, map);

    record.link = match (map.detail_url, first_text(raw, map.link_key)) {
        (Some(template), Some(key)) => Some(template.replace("{key}", &key)),
        _ => first_text(raw, map.link),
    };
    record.ui_link = first_text(raw, map.ui_link);
    record.additional_info_link = first_text(raw, map.additional_info_link);
    record.resource_links = first_present(raw, map.resource_links)
        .map(string_list)
        .unwrap_or_default();
    record.point_of_contact = match first_present(raw, map.point_of_contact) {
        Some(JsonValue::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
        None => Vec::new(),
    };

    Some(record)
}

fn awardee(raw: &JsonValue, map: &FieldMap) -> Option<Awardee> {
    let awardee = Awardee {
        name: first_text(raw, map.awardee_name),
        id: first_text(raw, map.awardee_id),
        location: first_present(raw, map.awardee_location).cloned(),
    };
    if awardee.name.is_none() && awardee.id.is_none() && awardee.location.is_none() {
        None
    } else {
        Some(awardee)
    }
}

fn place_of_performance(raw: &JsonValue, map: &FieldMap) -> Option<PlaceOfPerformance> {
    let state = match map.fixed_state {
        Some((code, name)) => Some(StateRef {
            code: Some(code.to_string()),
            name: Some(name.to_string()),
        }),
        None => {
            let code = first_text(raw, map.state_code);
            let name = first_text(raw, map.state_name);
            (code.is_some() || name.is_some()).then_some(StateRef { code, name })
        }
    };
    let place = PlaceOfPerformance {
        state,
        city: first_text(raw, map.city),
        country: first_text(raw, map.country),
        zip: first_text(raw, map.zip),
    };
    (!place.is_empty()).then_some(place)
}

/// Resolve one dotted path. Blank strings, nulls and empty containers count as
/// absent.
pub fn lookup<'a>(raw: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut cur = raw;
    for segment in path.split('.') {
        cur = match cur {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    (!is_blank(cur)).then_some(cur)
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn first_present<'a>(raw: &'a JsonValue, paths: Paths) -> Option<&'a JsonValue> {
    paths.iter().find_map(|path| lookup(raw, path))
}

fn first_text(raw: &JsonValue, paths: Paths) -> Option<String> {
    paths
        .iter()
        .find_map(|path| lookup(raw, path).and_then(text_of))
}

/// Flatten the shapes text fields arrive in: plain strings, scalars, objects
/// carrying the text under a well-known key, or arrays of those.
pub fn text_of(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Object(map) => ["body", "text", "value", "description", "name"]
            .iter()
            .find_map(|key| map.get(*key).and_then(text_of)),
        JsonValue::Array(items) => {
            let parts = items.iter().filter_map(text_of).collect::<Vec<_>>();
            (!parts.is_empty()).then(|| parts.join("\n\n"))
        }
        JsonValue::Null => None,
    }
}

fn string_list(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::Array(items) => items.iter().filter_map(text_of).collect(),
        other => text_of(other).into_iter().collect(),
    }
}

/// Best-effort coercion to a non-negative finite amount; anything else is 0.
pub fn parse_amount(value: Option<&JsonValue>) -> AwardAmount {
    let raw = match value {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => {
            let cleaned = s
                .chars()
                .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
                .collect::<String>();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    };
    AwardAmount::new(raw.unwrap_or(0.0))
}

/// Accepts strings in the formats the upstreams emit and epoch milliseconds.
pub fn parse_date(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => parse_date_str(s.trim()),
        JsonValue::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn parse_date_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn day(y: i32, m: u32, d: u32) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single()
    }

    #[test]
    fn record_without_key_or_title_is_dropped() {
        assert!(normalize(SourceTag::Federal, &json!({"description": "orphan"})).is_none());
        assert!(normalize(SourceTag::Ny, &json!({"short_title": "   "})).is_none());
        assert!(normalize(SourceTag::Il, &json!([])).is_none());
    }

    #[test]
    fn key_without_title_gets_placeholder_title() {
        let record = normalize(SourceTag::Federal, &json!({"noticeId": "abc"})).unwrap();
        assert_eq!(record.natural_key, "abc");
        assert_eq!(record.title, UNTITLED);
        assert_eq!(record.link.as_deref(), Some("https://sam.gov/opp/abc/view"));
    }

    #[test]
    fn amount_falls_back_through_aliases_and_coerces() {
        let cases = [
            (json!({"noticeId": "a", "award": {"amount": 1200.5}}), 1200.5),
            (json!({"noticeId": "a", "awardAmount": "$12,500.00"}), 12_500.0),
            (json!({"noticeId": "a", "totalValue": 99}), 99.0),
            (json!({"noticeId": "a", "award": {"amount": -5}}), 0.0),
            (json!({"noticeId": "a", "award": {"amount": "NaN"}}), 0.0),
            (json!({"noticeId": "a", "award": {"amount": "n/a"}}), 0.0),
            (json!({"noticeId": "a"}), 0.0),
        ];
        for (raw, expected) in cases {
            let record = normalize(SourceTag::Federal, &raw).unwrap();
            assert_eq!(record.award.amount.value(), expected, "raw: {raw}");
        }
    }

    #[test]
    fn renamed_fields_resolve_through_alias_table() {
        let raw = json!({
            "noticeID": "N-77",
            "title": "Boiler maintenance",
            "reponseDeadLine": "2026-04-01",
            "setAside": "SBA",
            "setAsideDescription": "Total Small Business"
        });
        let record = normalize(SourceTag::Federal, &raw).unwrap();
        assert_eq!(record.natural_key, "N-77");
        assert_eq!(record.due_date, day(2026, 4, 1));
        assert_eq!(record.set_aside.as_deref(), Some("SBA"));
        assert_eq!(record.type_of_set_aside.as_deref(), Some("SBA"));
        assert_eq!(record.set_aside_description.as_deref(), Some("Total Small Business"));
    }

    #[test]
    fn dates_accept_upstream_formats_and_reject_garbage() {
        let expected = day(2026, 1, 5);
        for raw in [
            "2026-01-05",
            "2026-01-05T00:00:00.000",
            "2026-01-05T00:00:00Z",
            "2026-01-05 00:00:00",
            "01/05/2026",
        ] {
            assert_eq!(parse_date(&json!(raw)), expected, "input: {raw}");
        }
        assert_eq!(parse_date(&json!("next tuesday")), None);
        assert_eq!(parse_date(&json!(true)), None);

        let record = normalize(
            SourceTag::Ny,
            &json!({"epin": "E1", "short_title": "x", "registration_date": "soon"}),
        )
        .unwrap();
        assert_eq!(record.posted_date, None);
    }

    #[test]
    fn description_shapes_are_flattened() {
        let object = json!({"noticeId": "a", "title": "t", "description": {"body": "from object"}});
        let array = json!({"noticeId": "a", "title": "t", "description": ["one", {"text": "two"}]});
        assert_eq!(
            normalize(SourceTag::Federal, &object).unwrap().description.as_deref(),
            Some("from object")
        );
        assert_eq!(
            normalize(SourceTag::Federal, &array).unwrap().description.as_deref(),
            Some("one\n\ntwo")
        );
    }

    #[test]
    fn title_derived_key_never_builds_a_detail_link() {
        let record = normalize(
            SourceTag::Ny,
            &json!({"type_of_notice_description": "Award", "contract_amount": "-5"}),
        )
        .unwrap();
        assert_eq!(record.natural_key, "Award");
        assert_eq!(record.link, None);
        assert_eq!(record.award.amount, AwardAmount::ZERO);
        assert_eq!(record.state_code(), Some("NY"));
    }

    #[test]
    fn numeric_path_segments_index_arrays() {
        let raw = json!({"noticeId": "a", "naicsCodes": ["541511", "541512"]});
        assert_eq!(lookup(&raw, "naicsCodes.1"), Some(&json!("541512")));
        assert_eq!(lookup(&raw, "naicsCodes.x"), None);
        let record = normalize(SourceTag::Federal, &raw).unwrap();
        assert_eq!(record.naics_code.as_deref(), Some("541511"));
    }
}
