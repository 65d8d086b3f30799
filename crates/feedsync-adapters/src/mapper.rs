//! Upstream record → feed leaves.
//!
//! Every rule here degrades to an empty string or a documented fallback
//! when the upstream record is incomplete. The only hard failure is a
//! record without an id, which cannot be placed in the feed at all.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use feedsync_core::document::decode_entities;
use feedsync_core::{coerce, FieldMap, JobRecord};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

pub const FALLBACK_EMPLOYMENT_TYPE: &str = "Contract";
pub const FALLBACK_TITLE: &str = "Untitled Position";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("record has no id")]
    MissingId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrandRule {
    /// Case-insensitive substring of the company name.
    pub company_contains: String,
    pub base_url: String,
}

/// Lookup tables for the fixed-vocabulary leaves.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingRules {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    pub default_company: String,
    #[serde(default = "default_employment_type")]
    pub default_employment_type: String,
    #[serde(default)]
    pub employment_types: BTreeMap<String, String>,
    #[serde(default)]
    pub remote_types: BTreeMap<String, String>,
    /// Used when the remote indicator is missing or unmapped.
    #[serde(default)]
    pub remote_fallback: String,
    pub default_base_url: String,
    #[serde(default)]
    pub brands: Vec<BrandRule>,
    #[serde(default = "default_tracking_query")]
    pub tracking_query: String,
}

fn default_employment_type() -> String {
    FALLBACK_EMPLOYMENT_TYPE.to_string()
}

fn default_tracking_query() -> String {
    "source=LinkedIn".to_string()
}

impl Default for MappingRules {
    fn default() -> Self {
        let table = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        Self {
            version: 1,
            default_company: "Myticas Consulting".to_string(),
            default_employment_type: default_employment_type(),
            employment_types: table(&[
                ("contract", "Contract"),
                ("contract to hire", "Contract to Hire"),
                ("direct hire", "Full-time"),
                ("permanent", "Full-time"),
                ("full time", "Full-time"),
                ("part time", "Part-time"),
                ("temporary", "Temporary"),
                ("internship", "Internship"),
            ]),
            remote_types: table(&[
                ("remote", "Remote"),
                ("hybrid", "Hybrid"),
                ("on site", "On-site"),
                ("onsite", "On-site"),
            ]),
            remote_fallback: String::new(),
            default_base_url: "https://apply.myticas.com".to_string(),
            brands: vec![BrandRule {
                company_contains: "stsi".to_string(),
                base_url: "https://apply.stsigroup.com".to_string(),
            }],
            tracking_query: default_tracking_query(),
        }
    }
}

impl MappingRules {
    pub fn base_url_for(&self, company: &str) -> &str {
        let company = company.to_ascii_lowercase();
        self.brands
            .iter()
            .find(|b| company.contains(&b.company_contains.to_ascii_lowercase()))
            .map(|b| b.base_url.as_str())
            .unwrap_or(&self.default_base_url)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecruiterTag {
    pub name: String,
    pub tag: String,
}

/// Known recruiters → fixed LinkedIn tag codes. Unknown names get a tag
/// synthesized from their initials.
#[derive(Debug, Clone, Deserialize)]
pub struct RecruiterTable {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default = "default_tag_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub recruiters: Vec<RecruiterTag>,
}

fn default_tag_prefix() -> String {
    "#LI-".to_string()
}

impl Default for RecruiterTable {
    fn default() -> Self {
        Self {
            version: 1,
            prefix: default_tag_prefix(),
            recruiters: Vec::new(),
        }
    }
}

impl RecruiterTable {
    pub fn tag_for(&self, first: &str, last: &str) -> String {
        let full = normalize_key(&format!("{first} {last}"));
        if full.is_empty() {
            return String::new();
        }
        if let Some(known) = self.recruiters.iter().find(|r| normalize_key(&r.name) == full) {
            return known.tag.clone();
        }
        let initials: String = [first, last]
            .iter()
            .filter_map(|part| part.trim().chars().next())
            .flat_map(char::to_uppercase)
            .collect();
        format!("{}{}", self.prefix, initials)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldMapper {
    rules: MappingRules,
    recruiters: RecruiterTable,
}

impl FieldMapper {
    pub fn new(rules: MappingRules, recruiters: RecruiterTable) -> Self {
        Self { rules, recruiters }
    }

    /// Load `mapping.yaml` and `recruiters.yaml` from `rules_dir`; a missing
    /// file falls back to the built-in table.
    pub fn from_rules_dir(rules_dir: &Path) -> anyhow::Result<Self> {
        let rules = read_yaml_or_default::<MappingRules>(&rules_dir.join("mapping.yaml"))?;
        let recruiters = read_yaml_or_default::<RecruiterTable>(&rules_dir.join("recruiters.yaml"))?;
        Ok(Self::new(rules, recruiters))
    }

    pub fn rules(&self) -> &MappingRules {
        &self.rules
    }

    /// Non-static leaves for one record. Deterministic.
    pub fn map_fields(&self, record: &JobRecord) -> Result<FieldMap, MappingError> {
        let id = record.id.trim();
        if id.is_empty() {
            return Err(MappingError::MissingId);
        }

        let raw_title = record.text(&["title"]).unwrap_or_default();
        let clean_title = match strip_job_id_suffix(&raw_title) {
            "" => FALLBACK_TITLE,
            clean => clean,
        };
        let company = record
            .text(&["company"])
            .unwrap_or_else(|| self.rules.default_company.clone());
        let description = record
            .text(&["publicDescription"])
            .or_else(|| record.text(&["description"]))
            .unwrap_or_default();
        let (first, last) = assigned_recruiter(record);

        let mut fields = FieldMap::new();
        fields.insert("title".into(), format!("{clean_title} ({id})"));
        fields.insert("url".into(), self.application_url(&company, id, clean_title));
        fields.insert("company".into(), company);
        fields.insert("date".into(), posted_date(record));
        fields.insert("description".into(), normalize_description(&description));
        fields.insert("jobtype".into(), self.employment_type(record));
        fields.insert("city".into(), record.text(&["address", "city"]).unwrap_or_default());
        fields.insert("state".into(), record.text(&["address", "state"]).unwrap_or_default());
        fields.insert(
            "country".into(),
            record
                .text(&["address", "countryName"])
                .or_else(|| record.text(&["address", "countryCode"]))
                .or_else(|| record.text(&["address", "country"]))
                .unwrap_or_default(),
        );
        fields.insert("remotetype".into(), self.remote_type(record));
        fields.insert("assignedrecruiter".into(), self.recruiters.tag_for(&first, &last));
        Ok(fields)
    }

    fn employment_type(&self, record: &JobRecord) -> String {
        record
            .text(&["employmentType"])
            .and_then(|raw| self.rules.employment_types.get(&normalize_key(&raw)).cloned())
            .unwrap_or_else(|| self.rules.default_employment_type.clone())
    }

    fn remote_type(&self, record: &JobRecord) -> String {
        record
            .text(&["onSite"])
            .or_else(|| record.text(&["remoteType"]))
            .and_then(|raw| self.rules.remote_types.get(&normalize_key(&raw)).cloned())
            .unwrap_or_else(|| self.rules.remote_fallback.clone())
    }

    fn application_url(&self, company: &str, id: &str, clean_title: &str) -> String {
        let base = self.rules.base_url_for(company);
        let query = &self.rules.tracking_query;
        let Ok(mut url) = Url::parse(base) else {
            return format!("{}/{id}/{clean_title}/?{query}", base.trim_end_matches('/'));
        };
        match url.path_segments_mut() {
            Ok(mut segments) => {
                segments.pop_if_empty().push(id).push(clean_title).push("");
            }
            Err(()) => return format!("{}/{id}/{clean_title}/?{query}", base.trim_end_matches('/')),
        }
        url.set_query(Some(query.as_str()));
        url.to_string()
    }
}

fn read_yaml_or_default<T>(path: &Path) -> anyhow::Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match std::fs::read_to_string(path) {
        Ok(text) => serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "rules file missing; using built-in table");
            Ok(T::default())
        }
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Lowercase, `-`/`_` to spaces, whitespace collapsed.
pub fn normalize_key(input: &str) -> String {
    input
        .to_lowercase()
        .replace(['-', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drop any trailing `(<digits>)` job-id suffixes: `"Dev (12) (12)"` → `"Dev"`.
pub fn strip_job_id_suffix(title: &str) -> &str {
    let mut rest = title.trim();
    while let Some(inner) = rest.strip_suffix(')') {
        let Some(open) = inner.rfind('(') else { break };
        let digits = &inner[open + 1..];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            break;
        }
        rest = inner[..open].trim_end();
    }
    rest
}

fn assigned_recruiter(record: &JobRecord) -> (String, String) {
    for key in ["assignedUsers", "owner"] {
        let Some(user) = record.get(&[key]).and_then(coerce::first_object) else {
            continue;
        };
        let name_part = |k: &str| user.get(k).and_then(coerce::first_text).unwrap_or_default();
        let (first, last) = (name_part("firstName"), name_part("lastName"));
        if !first.is_empty() || !last.is_empty() {
            return (first, last);
        }
    }
    (String::new(), String::new())
}

/// `dateAdded` epoch millis → `"March 04, 2026"`. Strings pass through.
fn posted_date(record: &JobRecord) -> String {
    let Some(value) = record.get(&["dateAdded"]) else {
        return String::new();
    };
    let format = |dt: DateTime<Utc>| dt.format("%B %d, %Y").to_string();
    if let serde_json::Value::String(raw) = value {
        return match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(dt) => format(dt.with_timezone(&Utc)),
            Err(_) => raw.trim().to_string(),
        };
    }
    coerce::as_i64(value)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(format)
        .unwrap_or_default()
}

/// Undo one level of entity double-encoding, decode escaped markup, and
/// wrap plain text in a paragraph.
pub fn normalize_description(raw: &str) -> String {
    let collapsed = collapse_double_escaping(raw.trim());
    let decoded = if has_escaped_markup(&collapsed) {
        decode_entities(&collapsed).into_owned()
    } else {
        collapsed
    };
    let decoded = decoded.trim();
    if decoded.is_empty() {
        String::new()
    } else if looks_like_html(decoded) {
        decoded.to_string()
    } else {
        format!("<p>{decoded}</p>")
    }
}

/// `&amp;lt;` → `&lt;`, `&amp;#39;` → `&#39;`; a lone `&amp;` is left alone.
fn collapse_double_escaping(input: &str) -> String {
    const DOUBLE: &str = "&amp;";
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(idx) = rest.find(DOUBLE) {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + DOUBLE.len()..];
        let entity_len = after
            .find(';')
            .filter(|&end| end > 0 && end <= 8)
            .filter(|&end| after[..end].chars().all(|c| c.is_ascii_alphanumeric() || c == '#'));
        if entity_len.is_some() {
            out.push('&');
        } else {
            out.push_str(DOUBLE);
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

fn has_escaped_markup(text: &str) -> bool {
    text.match_indices("&lt;").any(|(idx, m)| {
        text[idx + m.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '/')
    })
}

fn looks_like_html(text: &str) -> bool {
    text.match_indices('<').any(|(idx, _)| {
        let after = &text[idx + 1..];
        after
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '/')
            && after.contains('>')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> JobRecord {
        JobRecord::from_value(value).unwrap()
    }

    fn mapper() -> FieldMapper {
        let recruiters = RecruiterTable {
            recruiters: vec![RecruiterTag {
                name: "Rachel Smith".into(),
                tag: "#LI-RS1".into(),
            }],
            ..RecruiterTable::default()
        };
        FieldMapper::new(MappingRules::default(), recruiters)
    }

    #[test]
    fn maps_a_complete_record() {
        let fields = mapper()
            .map_fields(&record(json!({
                "id": 34567,
                "title": "Senior Java Developer (34567)",
                "employmentType": "Direct Hire",
                "onSite": "Hybrid",
                "address": {"city": ["Ottawa"], "state": "ON", "countryName": "Canada"},
                "assignedUsers": {"data": [{"firstName": "Rachel", "lastName": "Smith"}]},
                "publicDescription": "Build services",
                "dateAdded": 1_700_000_000_000i64
            })))
            .unwrap();

        assert_eq!(fields["title"], "Senior Java Developer (34567)");
        assert_eq!(fields["jobtype"], "Full-time");
        assert_eq!(fields["remotetype"], "Hybrid");
        assert_eq!(fields["city"], "Ottawa");
        assert_eq!(fields["country"], "Canada");
        assert_eq!(fields["assignedrecruiter"], "#LI-RS1");
        assert_eq!(fields["description"], "<p>Build services</p>");
        assert_eq!(fields["company"], "Myticas Consulting");
        assert_eq!(fields["date"], "November 14, 2023");
        assert_eq!(
            fields["url"],
            "https://apply.myticas.com/34567/Senior%20Java%20Developer/?source=LinkedIn"
        );
        assert!(!fields.contains_key("referencenumber"));
        assert!(!fields.contains_key("jobfunction"));
    }

    #[test]
    fn sparse_record_degrades_to_fallbacks() {
        let fields = mapper().map_fields(&record(json!({"id": "9"}))).unwrap();
        assert_eq!(fields["title"], "Untitled Position (9)");
        assert_eq!(fields["jobtype"], "Contract");
        assert_eq!(fields["remotetype"], "");
        assert_eq!(fields["city"], "");
        assert_eq!(fields["assignedrecruiter"], "");
        assert_eq!(fields["description"], "");
        assert_eq!(fields["date"], "");
    }

    #[test]
    fn blank_id_is_the_only_failure() {
        let blank = JobRecord::new("  ", serde_json::Map::new());
        assert_eq!(mapper().map_fields(&blank), Err(MappingError::MissingId));
    }

    #[test]
    fn unknown_vocabulary_falls_back() {
        let fields = mapper()
            .map_fields(&record(json!({"id": 1, "employmentType": "Gig", "onSite": "No Preference"})))
            .unwrap();
        assert_eq!(fields["jobtype"], "Contract");
        assert_eq!(fields["remotetype"], "");
    }

    #[test]
    fn title_suffix_is_never_doubled() {
        assert_eq!(strip_job_id_suffix("Dev (12) (12)"), "Dev");
        assert_eq!(strip_job_id_suffix("Dev (Remote)"), "Dev (Remote)");
        assert_eq!(strip_job_id_suffix("Dev (v2) (3)"), "Dev (v2)");
        let fields = mapper()
            .map_fields(&record(json!({"id": 12, "title": "Dev (99)"})))
            .unwrap();
        assert_eq!(fields["title"], "Dev (12)");
    }

    #[test]
    fn secondary_brand_uses_its_own_domain() {
        let fields = mapper()
            .map_fields(&record(json!({"id": 5, "title": "QA/Test Lead", "company": "STSI Group"})))
            .unwrap();
        assert_eq!(
            fields["url"],
            "https://apply.stsigroup.com/5/QA%2FTest%20Lead/?source=LinkedIn"
        );
    }

    #[test]
    fn unknown_recruiters_get_initials_and_owner_is_a_fallback() {
        let fields = mapper()
            .map_fields(&record(json!({
                "id": 3,
                "assignedUsers": [],
                "owner": {"firstName": "jane", "lastName": "doe"}
            })))
            .unwrap();
        assert_eq!(fields["assignedrecruiter"], "#LI-JD");
    }

    #[test]
    fn double_escaped_descriptions_are_repaired() {
        assert_eq!(
            normalize_description("&amp;lt;p&amp;gt;Hello&amp;lt;/p&amp;gt;"),
            "<p>Hello</p>"
        );
        assert_eq!(normalize_description("&lt;ul&gt;&lt;li&gt;A&lt;/li&gt;&lt;/ul&gt;"), "<ul><li>A</li></ul>");
        assert_eq!(normalize_description("Tom &amp; Jerry"), "<p>Tom &amp; Jerry</p>");
        assert_eq!(normalize_description("<div>ok</div>"), "<div>ok</div>");
        assert_eq!(normalize_description("   "), "");
    }

    #[test]
    fn unknown_entities_survive_markup_decoding() {
        assert_eq!(
            normalize_description("&lt;p&gt;Caf&eacute; &amp; bar&lt;/p&gt;"),
            "<p>Caf&eacute; & bar</p>"
        );
    }
}
