//! XML feed parsing and serialization.
//!
//! The published feed looks like:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <source>
//!   <publisher><![CDATA[Acme Staffing]]></publisher>
//!   <job>
//!     <title><![CDATA[Engineer (100)]]></title>
//!     <bhatsid><![CDATA[100]]></bhatsid>
//!     ...
//!   </job>
//! </source>
//! ```
//!
//! Feeds found in the wild were hand-edited and re-generated by several
//! tools, so the parser accepts nested CDATA markers, HTML named entities
//! and raw markup inside leaves. Only structural breakage is an error.

use std::borrow::Cow;
use std::str::FromStr;

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::{Document, DocumentJob, FIELD_ID};

pub const ROOT_ELEMENT: &str = "source";
pub const JOB_ELEMENT: &str = "job";
pub const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Canonical leaf order inside `<job>`. Unknown leaves follow alphabetically.
pub const JOB_FIELD_ORDER: &[&str] = &[
    "title",
    "company",
    "date",
    "referencenumber",
    FIELD_ID,
    "url",
    "description",
    "jobtype",
    "city",
    "state",
    "country",
    "category",
    "remotetype",
    "assignedrecruiter",
    "jobfunction",
    "jobindustries",
    "senioritylevel",
];

const CDATA_OPEN: &str = "<![CDATA[";
const CDATA_CLOSE: &str = "]]>";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document contains no root element")]
    Empty,
    #[error("malformed xml at byte {position}: {message}")]
    Malformed { position: u64, message: String },
    #[error("element <{0}> is not closed before end of document")]
    Unclosed(String),
    #[error("content found after the root element closed at byte {0}")]
    TrailingContent(u64),
    #[error("invalid utf-8 at byte {0}")]
    InvalidUtf8(u64),
}

/// Job ordering applied before serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum JobOrder {
    /// Keep document order: existing jobs in place, new jobs appended.
    #[default]
    Insertion,
    Id,
    Field(String),
}

impl FromStr for JobOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "insertion" => Ok(Self::Insertion),
            "id" => Ok(Self::Id),
            other => match other.strip_prefix("field:") {
                Some(name) if !name.is_empty() => Ok(Self::Field(name.to_string())),
                _ => Err(format!("unknown job order '{other}'")),
            },
        }
    }
}

/// Text being collected for one leaf element.
struct LeafCapture {
    name: String,
    /// Stack depth at which the leaf was opened.
    depth: usize,
    text: String,
}

#[derive(Default)]
struct JobBuilder {
    id: Option<String>,
    job: DocumentJob,
}

/// Jobs dropped while parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    /// Later `<job>` elements repeating an id already seen.
    pub duplicates: usize,
    /// `<job>` elements with neither an id leaf nor an id title suffix.
    pub unidentified: usize,
}

pub fn parse(bytes: &[u8]) -> Result<Document, ParseError> {
    parse_with_stats(bytes).map(|(document, _)| document)
}

pub fn parse_with_stats(bytes: &[u8]) -> Result<(Document, ParseStats), ParseError> {
    let mut reader = Reader::from_reader(bytes);

    let mut stack: Vec<String> = Vec::new();
    let mut root: Option<String> = None;
    let mut root_closed = false;
    let mut metadata: Vec<(String, String)> = Vec::new();
    let mut jobs: Vec<DocumentJob> = Vec::new();
    let mut current_job: Option<JobBuilder> = None;
    let mut capture: Option<LeafCapture> = None;
    let mut unidentified = 0usize;

    loop {
        let position = reader.buffer_position() as u64;
        let event = reader.read_event().map_err(|err| ParseError::Malformed {
            position,
            message: err.to_string(),
        })?;

        match event {
            Event::Start(start) => {
                let name = utf8(start.name().as_ref(), position)?.to_string();
                if root_closed {
                    return Err(ParseError::TrailingContent(position));
                }
                if let Some(leaf) = capture.as_mut() {
                    // Raw markup inside a leaf is kept as text.
                    leaf.text.push('<');
                    leaf.text.push_str(utf8(&start, position)?);
                    leaf.text.push('>');
                } else {
                    match stack.len() {
                        0 => root = Some(name.clone()),
                        1 if name == JOB_ELEMENT => current_job = Some(JobBuilder::default()),
                        1 => {
                            capture = Some(LeafCapture {
                                name: name.clone(),
                                depth: 2,
                                text: String::new(),
                            })
                        }
                        2 if current_job.is_some() => {
                            capture = Some(LeafCapture {
                                name: name.clone(),
                                depth: 3,
                                text: String::new(),
                            })
                        }
                        _ => {}
                    }
                }
                stack.push(name);
            }
            Event::Empty(empty) => {
                let name = utf8(empty.name().as_ref(), position)?.to_string();
                if root_closed {
                    return Err(ParseError::TrailingContent(position));
                }
                if let Some(leaf) = capture.as_mut() {
                    leaf.text.push('<');
                    leaf.text.push_str(utf8(&empty, position)?);
                    leaf.text.push_str("/>");
                    continue;
                }
                match stack.len() {
                    0 => {
                        root = Some(name);
                        root_closed = true;
                    }
                    1 if name == JOB_ELEMENT => unidentified += 1,
                    1 => metadata.push((name, String::new())),
                    2 => {
                        if let Some(builder) = current_job.as_mut() {
                            store_leaf(builder, name, String::new());
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(text) => {
                let raw = utf8(&text, position)?;
                if let Some(leaf) = capture.as_mut() {
                    let decoded = decode_entities(raw);
                    leaf.text.push_str(&decoded.replace(CDATA_CLOSE, ""));
                } else if root_closed && !raw.trim().is_empty() {
                    return Err(ParseError::TrailingContent(position));
                }
            }
            Event::CData(cdata) => {
                if let Some(leaf) = capture.as_mut() {
                    let inner = utf8(&cdata, position)?;
                    leaf.text.push_str(&inner.replace(CDATA_OPEN, ""));
                } else if root_closed {
                    return Err(ParseError::TrailingContent(position));
                }
            }
            Event::End(end) => {
                let name = utf8(end.name().as_ref(), position)?.to_string();
                stack.pop();
                let depth = stack.len();

                let closes_leaf = capture.as_ref().is_some_and(|leaf| leaf.depth == depth + 1);
                if closes_leaf {
                    if let Some(leaf) = capture.take() {
                        let value = leaf.text.trim().to_string();
                        match current_job.as_mut() {
                            Some(builder) => store_leaf(builder, leaf.name, value),
                            None => metadata.push((leaf.name, value)),
                        }
                    }
                } else if let Some(leaf) = capture.as_mut() {
                    leaf.text.push_str("</");
                    leaf.text.push_str(&name);
                    leaf.text.push('>');
                } else if depth == 1 && name == JOB_ELEMENT {
                    if let Some(builder) = current_job.take() {
                        match finish_job(builder) {
                            Some(job) => jobs.push(job),
                            None => unidentified += 1,
                        }
                    }
                } else if depth == 0 {
                    root_closed = true;
                }
            }
            Event::Eof => break,
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
        }
    }

    if let Some(open) = stack.pop() {
        return Err(ParseError::Unclosed(open));
    }
    let Some(root) = root else {
        return Err(ParseError::Empty);
    };

    let (mut document, duplicates) = Document::from_jobs(jobs);
    document.root = root;
    document.metadata = metadata;
    if duplicates > 0 || unidentified > 0 {
        tracing::warn!(duplicates, unidentified, "dropped jobs while parsing feed");
    }
    Ok((
        document,
        ParseStats {
            duplicates,
            unidentified,
        },
    ))
}

fn utf8(bytes: &[u8], position: u64) -> Result<&str, ParseError> {
    std::str::from_utf8(bytes).map_err(|err| ParseError::InvalidUtf8(position + err.valid_up_to() as u64))
}

fn store_leaf(builder: &mut JobBuilder, name: String, value: String) {
    if name == FIELD_ID {
        builder.id = Some(value);
    } else {
        builder.job.fields.insert(name, value);
    }
}

/// A job needs an id; feeds that lost the id leaf still carry it as a
/// `(123)` title suffix.
fn finish_job(builder: JobBuilder) -> Option<DocumentJob> {
    let JobBuilder { id, mut job } = builder;
    let id = id
        .filter(|id| !id.is_empty())
        .or_else(|| trailing_paren_id(job.field("title")))?;
    job.id = id;
    Some(job)
}

fn trailing_paren_id(title: &str) -> Option<String> {
    let inner = title.trim_end().strip_suffix(')')?;
    let open = inner.rfind('(')?;
    let digits = &inner[open + 1..];
    (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())).then(|| digits.to_string())
}

/// Decode character and entity references one at a time. Names neither XML
/// nor [`resolve_entity`] knows, and bare `&`, stay as written.
pub fn decode_entities(raw: &str) -> Cow<'_, str> {
    if !raw.contains('&') {
        return Cow::Borrowed(raw);
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let reference = tail[1..]
            .find(';')
            .filter(|&end| end > 0 && end <= MAX_ENTITY_LEN)
            .map(|end| &tail[1..=end]);
        match reference.and_then(resolve_reference) {
            Some(resolved) => {
                out.push_str(&resolved);
                // `&` + name + `;`
                rest = &tail[reference.map_or(0, str::len) + 2..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

const MAX_ENTITY_LEN: usize = 32;

fn resolve_reference(name: &str) -> Option<Cow<'static, str>> {
    let Some(number) = name.strip_prefix('#') else {
        return resolve_entity(name).map(Cow::Borrowed);
    };
    let code = match number.strip_prefix('x').or_else(|| number.strip_prefix('X')) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => number.parse().ok()?,
    };
    char::from_u32(code)
        .filter(|c| *c != '\0')
        .map(|c| Cow::Owned(c.to_string()))
}

/// XML predefined entities plus the HTML ones that show up in job descriptions.
pub fn resolve_entity(entity: &str) -> Option<&'static str> {
    Some(match entity {
        "lt" => "<",
        "gt" => ">",
        "amp" => "&",
        "apos" => "'",
        "quot" => "\"",
        "nbsp" => "\u{a0}",
        "ndash" => "\u{2013}",
        "mdash" => "\u{2014}",
        "lsquo" => "\u{2018}",
        "rsquo" => "\u{2019}",
        "ldquo" => "\u{201c}",
        "rdquo" => "\u{201d}",
        "bull" => "\u{2022}",
        "hellip" => "\u{2026}",
        "middot" => "\u{b7}",
        "copy" => "\u{a9}",
        "reg" => "\u{ae}",
        "trade" => "\u{2122}",
        _ => return None,
    })
}

pub fn serialize(document: &Document) -> Vec<u8> {
    let mut out = String::with_capacity(256 + document.len() * 1024);
    out.push_str(XML_DECLARATION);
    out.push('\n');
    out.push('<');
    out.push_str(document.root());
    out.push_str(">\n");

    for (name, value) in document.metadata() {
        write_leaf(&mut out, 1, name, value);
    }

    for job in document.jobs() {
        out.push_str("  <");
        out.push_str(JOB_ELEMENT);
        out.push_str(">\n");
        for (name, value) in ordered_leaves(job) {
            write_leaf(&mut out, 2, name, value);
        }
        out.push_str("  </");
        out.push_str(JOB_ELEMENT);
        out.push_str(">\n");
    }

    out.push_str("</");
    out.push_str(document.root());
    out.push_str(">\n");
    out.into_bytes()
}

fn ordered_leaves(job: &DocumentJob) -> Vec<(&str, &str)> {
    let mut leaves = Vec::with_capacity(job.fields.len() + 1);
    for name in JOB_FIELD_ORDER {
        if *name == FIELD_ID {
            leaves.push((FIELD_ID, job.id.as_str()));
        } else if let Some(value) = job.fields.get(*name) {
            leaves.push((*name, value.as_str()));
        }
    }
    leaves.extend(
        job.fields
            .iter()
            .filter(|(name, _)| !JOB_FIELD_ORDER.contains(&name.as_str()))
            .map(|(name, value)| (name.as_str(), value.as_str())),
    );
    leaves
}

fn write_leaf(out: &mut String, indent: usize, name: &str, value: &str) {
    for _ in 0..indent {
        out.push_str("  ");
    }
    out.push('<');
    out.push_str(name);
    out.push('>');
    out.push_str(CDATA_OPEN);
    // `]]>` cannot appear inside one CDATA section; split it across two.
    out.push_str(&value.replace(CDATA_CLOSE, "]]]]><![CDATA[>"));
    out.push_str(CDATA_CLOSE);
    out.push_str("</");
    out.push_str(name);
    out.push_str(">\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<source>
  <publisher><![CDATA[ Acme Staffing ]]></publisher>
  <publisherurl>https://acme.example</publisherurl>
  <job>
    <title><![CDATA[ Engineer (100) ]]></title>
    <referencenumber><![CDATA[AB100CD]]></referencenumber>
    <bhatsid><![CDATA[ 100 ]]></bhatsid>
    <description><![CDATA[<p>Build &amp; ship</p>]]></description>
    <city>Ottawa</city>
    <jobfunction/>
  </job>
  <job>
    <title><![CDATA[Analyst (200)]]></title>
    <bhatsid>200</bhatsid>
  </job>
</source>
"#;

    #[test]
    fn parses_metadata_and_jobs() {
        let document = parse(SAMPLE.as_bytes()).expect("parse");
        assert_eq!(document.root(), "source");
        assert_eq!(document.metadata_value("publisher"), Some("Acme Staffing"));
        assert_eq!(document.ids(), vec!["100", "200"]);

        let job = document.get("100").unwrap();
        assert_eq!(job.field("title"), "Engineer (100)");
        assert_eq!(job.reference_number(), "AB100CD");
        assert_eq!(job.field("description"), "<p>Build &amp; ship</p>");
        assert_eq!(job.field("city"), "Ottawa");
        assert_eq!(job.field("jobfunction"), "");
        assert!(!job.fields.contains_key(FIELD_ID));
    }

    #[test]
    fn tolerates_nested_cdata_and_html_entities() {
        let xml = r#"<source><job>
            <bhatsid>1</bhatsid>
            <title><![CDATA[ <![CDATA[ Nurse ]]> ]]></title>
            <description>Caf&eacute;&nbsp;work &rsquo;24</description>
            <company>R&D</company>
        </job></source>"#;
        let document = parse(xml.as_bytes()).expect("lenient parse");
        let job = document.get("1").unwrap();
        assert_eq!(job.field("title"), "Nurse");
        // Only the unknown entity is left as written.
        assert_eq!(job.field("description"), "Caf&eacute;\u{a0}work \u{2019}24");
        assert_eq!(job.field("company"), "R&D");
    }

    #[test]
    fn unknown_entity_does_not_block_known_ones() {
        let xml = "<source><job><bhatsid>1</bhatsid><company>AT&amp;T &eacute;quipe &#233;t&#xE9;</company></job></source>";
        let document = parse(xml.as_bytes()).unwrap();
        let company = document.get("1").unwrap().field("company");
        assert_eq!(company, "AT&T &eacute;quipe \u{e9}t\u{e9}");

        let xml = String::from_utf8(serialize(&document)).unwrap();
        assert!(xml.contains("<company><![CDATA[AT&T &eacute;quipe \u{e9}t\u{e9}]]></company>"));
    }

    #[test]
    fn decode_entities_leaves_stray_ampersands() {
        assert_eq!(decode_entities("a & b"), "a & b");
        assert_eq!(decode_entities("&;&#;&#xZZ;&amp"), "&;&#;&#xZZ;&amp");
        assert_eq!(decode_entities("&lt;p&gt; &amp;amp;"), "<p> &amp;");
        assert!(matches!(decode_entities("plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let xml = b"<source><job><bhatsid>1</bhatsid><title>Caf\xff</title></job></source>";
        assert!(matches!(parse(xml), Err(ParseError::InvalidUtf8(_))));

        let cdata = b"<source><job><bhatsid>1</bhatsid><title><![CDATA[Caf\xff]]></title></job></source>";
        assert!(matches!(parse(cdata), Err(ParseError::InvalidUtf8(_))));
    }

    #[test]
    fn html_entities_are_resolved_when_known() {
        let xml = "<source><job><bhatsid>1</bhatsid><description>a&nbsp;b &rsquo;</description></job></source>";
        let document = parse(xml.as_bytes()).unwrap();
        assert_eq!(document.get("1").unwrap().field("description"), "a\u{a0}b \u{2019}");
    }

    #[test]
    fn raw_markup_in_leaf_is_kept_as_text() {
        let xml = "<source><job><bhatsid>5</bhatsid><description><p>Hi <b>there</b></p><br/></description></job></source>";
        let document = parse(xml.as_bytes()).unwrap();
        assert_eq!(
            document.get("5").unwrap().field("description"),
            "<p>Hi <b>there</b></p><br/>"
        );
    }

    #[test]
    fn missing_id_leaf_falls_back_to_title_suffix() {
        let xml = "<source><job><title>Welder (321)</title></job><job><title>No id</title></job></source>";
        let document = parse(xml.as_bytes()).unwrap();
        assert_eq!(document.ids(), vec!["321"]);
    }

    #[test]
    fn duplicate_ids_keep_first_occurrence() {
        let xml = "<source><job><bhatsid>1</bhatsid><title>A</title></job><job><bhatsid>1</bhatsid><title>B</title></job></source>";
        let (document, stats) = parse_with_stats(xml.as_bytes()).unwrap();
        assert_eq!(document.len(), 1);
        assert_eq!(document.get("1").unwrap().field("title"), "A");
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.unidentified, 0);
    }

    #[test]
    fn structural_breakage_is_an_error() {
        assert!(matches!(parse(b""), Err(ParseError::Empty)));
        assert!(matches!(
            parse(b"<source><job><bhatsid>1</bhatsid></job>"),
            Err(ParseError::Unclosed(_) | ParseError::Malformed { .. })
        ));
        assert!(matches!(
            parse(b"<source><job></source>"),
            Err(ParseError::Malformed { .. })
        ));
        assert!(matches!(
            parse(b"<source></source><source></source>"),
            Err(ParseError::TrailingContent(_))
        ));
    }

    #[test]
    fn serialize_emits_declaration_cdata_and_canonical_order() {
        let mut job = DocumentJob::new("9");
        job.set_field("zeta", "last");
        job.set_field("city", "Austin");
        job.set_field("title", "Dev (9)");
        let (mut document, _) = Document::from_jobs(vec![job]);
        document.set_metadata("publisher", "Acme");

        let xml = String::from_utf8(serialize(&document)).unwrap();
        assert!(xml.starts_with(XML_DECLARATION));
        assert!(xml.contains("<publisher><![CDATA[Acme]]></publisher>"));
        let title = xml.find("<title>").unwrap();
        let id = xml.find("<bhatsid><![CDATA[9]]></bhatsid>").unwrap();
        let city = xml.find("<city>").unwrap();
        let zeta = xml.find("<zeta>").unwrap();
        assert!(title < id && id < city && city < zeta);
        assert_eq!(serialize(&document), serialize(&document));
    }

    #[test]
    fn cdata_terminator_inside_value_round_trips() {
        let mut job = DocumentJob::new("1");
        job.set_field("description", "a ]]> b");
        let (document, _) = Document::from_jobs(vec![job]);
        let parsed = parse(&serialize(&document)).unwrap();
        assert_eq!(parsed, document);
    }

    #[test]
    fn job_order_parses_from_config_strings() {
        assert_eq!("id".parse::<JobOrder>().unwrap(), JobOrder::Id);
        assert_eq!(
            "field:date".parse::<JobOrder>().unwrap(),
            JobOrder::Field("date".into())
        );
        assert!("random".parse::<JobOrder>().is_err());
    }

    fn leaf_value() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            "[A-Za-z0-9&<>\\]]([A-Za-z0-9 &<>\\]/]{0,24}[A-Za-z0-9&<>\\]])?",
        ]
    }

    fn arb_job() -> impl Strategy<Value = DocumentJob> {
        (
            "[1-9][0-9]{0,6}",
            proptest::collection::btree_map(
                prop_oneof![
                    Just("title".to_string()),
                    Just("description".to_string()),
                    Just("referencenumber".to_string()),
                    Just("city".to_string()),
                    Just("extra".to_string()),
                ],
                leaf_value(),
                0..5,
            ),
        )
            .prop_map(|(id, fields)| DocumentJob { id, fields })
    }

    proptest! {
        #[test]
        fn parse_inverts_serialize(jobs in proptest::collection::vec(arb_job(), 0..6)) {
            let (document, _) = Document::from_jobs(jobs);
            let parsed = parse(&serialize(&document)).unwrap();
            prop_assert_eq!(parsed, document);
        }
    }
}
