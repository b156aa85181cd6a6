use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Header fields of an `experience.md`; `raw` keeps every key for `meta`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frontmatter {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub raw: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTags {
    One(String),
    Many(Vec<serde_yml::Value>),
}

#[derive(Debug, Default, Deserialize)]
struct RawHeader {
    name: Option<serde_yml::Value>,
    description: Option<serde_yml::Value>,
    tags: Option<RawTags>,
}

/// Splits a document into its frontmatter and body. A document without a
/// closed `---` block, or whose header is not valid YAML, is all body.
pub fn split(text: &str) -> (Frontmatter, &str) {
    let trimmed = text.trim_start_matches('\u{feff}');
    let Some(rest) = trimmed.strip_prefix("---") else {
        return (Frontmatter::default(), text);
    };
    let Some(rest) = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n")) else {
        return (Frontmatter::default(), text);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim() == "---" {
            let header = &rest[..offset];
            let body = rest[offset + line.len()..].trim_start();
            return match parse_header(header) {
                Some(frontmatter) => (frontmatter, body),
                None => (Frontmatter::default(), text),
            };
        }
        offset += line.len();
    }

    (Frontmatter::default(), text)
}

fn parse_header(header: &str) -> Option<Frontmatter> {
    if header.trim().is_empty() {
        return Some(Frontmatter::default());
    }

    let yaml: serde_yml::Value = match serde_yml::from_str(header) {
        Ok(yaml) => yaml,
        Err(err) => {
            warn!(error = %err, "ignoring malformed skill frontmatter");
            return None;
        }
    };
    if !yaml.is_mapping() {
        warn!("ignoring skill frontmatter that is not a mapping");
        return None;
    }

    let parsed: RawHeader = serde_yml::from_value(yaml.clone()).unwrap_or_default();
    let raw = serde_json::to_value(&yaml).unwrap_or(Value::Null);
    let tags = match parsed.tags {
        Some(RawTags::One(tag)) => vec![tag],
        Some(RawTags::Many(tags)) => tags.iter().filter_map(scalar_text).collect(),
        None => Vec::new(),
    }
    .into_iter()
    .map(|tag| tag.trim().to_string())
    .filter(|tag| !tag.is_empty())
    .collect();

    Some(Frontmatter {
        name: parsed.name.as_ref().and_then(scalar_text),
        description: parsed.description.as_ref().and_then(scalar_text),
        tags,
        raw,
    })
}

fn scalar_text(value: &serde_yml::Value) -> Option<String> {
    match value {
        serde_yml::Value::String(text) => Some(text.clone()),
        serde_yml::Value::Number(number) => Some(number.to_string()),
        serde_yml::Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
