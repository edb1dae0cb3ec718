//! Hugo front matter: `---` delimited YAML or `+++` delimited TOML.
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

const YAML_FENCE: &str = "---";
const TOML_FENCE: &str = "+++";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Yaml,
    Toml,
}

/// A document split into its metadata and remaining body lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub metadata: Mapping,
    pub body: Vec<String>,
}

/// Split `text` into front matter and body.
///
/// The first two `---` lines delimit YAML, the first two `+++` lines delimit
/// TOML; if both are present the block that opens first wins. Anything before
/// the opening fence is dropped. Without a fenced block the whole text is
/// tried as metadata (TOML, then YAML); if neither parses to a table it is
/// all body.
pub fn parse(text: &str) -> Result<Document> {
    let lines: Vec<&str> = text.lines().collect();
    let fences = |fence: &str| -> Vec<usize> {
        lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.trim_end() == fence)
            .map(|(i, _)| i)
            .take(2)
            .collect()
    };
    let yaml = fences(YAML_FENCE);
    let toml = fences(TOML_FENCE);

    let block = match (yaml.len() == 2, toml.len() == 2) {
        (true, true) if yaml[0] < toml[0] => Some((Format::Yaml, yaml[0], yaml[1])),
        (true, true) => Some((Format::Toml, toml[0], toml[1])),
        (true, false) => Some((Format::Yaml, yaml[0], yaml[1])),
        (false, true) => Some((Format::Toml, toml[0], toml[1])),
        (false, false) => None,
    };

    let Some((format, open, close)) = block else {
        return Ok(match parse_bare(text) {
            Some(metadata) => Document {
                metadata,
                body: Vec::new(),
            },
            None => Document {
                metadata: Mapping::new(),
                body: lines.iter().map(|l| l.to_string()).collect(),
            },
        });
    };

    let header = lines[open + 1..close].join("\n");
    let metadata = match format {
        Format::Yaml => parse_yaml(&header)?,
        Format::Toml => parse_toml(&header)?,
    };
    let body = lines[close + 1..].iter().map(|l| l.to_string()).collect();
    Ok(Document { metadata, body })
}

fn parse_yaml(header: &str) -> Result<Mapping> {
    if header.trim().is_empty() {
        return Ok(Mapping::new());
    }
    match serde_yaml::from_str::<Value>(header).wrap_err("Invalid YAML front matter")? {
        Value::Mapping(m) => Ok(m),
        Value::Null => Ok(Mapping::new()),
        other => Err(eyre!("YAML front matter is not a mapping: {:?}", other)),
    }
}

fn parse_toml(header: &str) -> Result<Mapping> {
    let table: toml::Table = toml::from_str(header).wrap_err("Invalid TOML front matter")?;
    Ok(toml_table_to_yaml(table))
}

fn parse_bare(text: &str) -> Option<Mapping> {
    if text.trim().is_empty() {
        return None;
    }
    if let Ok(table) = toml::from_str::<toml::Table>(text) {
        return Some(toml_table_to_yaml(table));
    }
    match serde_yaml::from_str::<Value>(text) {
        Ok(Value::Mapping(m)) => Some(m),
        _ => None,
    }
}

fn toml_table_to_yaml(table: toml::Table) -> Mapping {
    table
        .into_iter()
        .map(|(k, v)| (Value::String(k), toml_to_yaml(v)))
        .collect()
}

fn toml_to_yaml(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => Value::Number(f.into()),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Sequence(items.into_iter().map(toml_to_yaml).collect()),
        toml::Value::Table(t) => Value::Mapping(toml_table_to_yaml(t)),
    }
}

/// Serialize `metadata` as a fenced front-matter block, trailing newline included.
pub fn serialize(metadata: &Mapping, format: Format) -> Result<String> {
    let (fence, inner) = match format {
        Format::Yaml => (
            YAML_FENCE,
            if metadata.is_empty() {
                String::new()
            } else {
                serde_yaml::to_string(metadata).wrap_err("Failed to serialize YAML front matter")?
            },
        ),
        Format::Toml => (
            TOML_FENCE,
            toml::to_string(metadata).wrap_err("Failed to serialize TOML front matter")?,
        ),
    };
    let mut out = String::with_capacity(inner.len() + 8);
    out.push_str(fence);
    out.push('\n');
    out.push_str(&inner);
    if !inner.is_empty() && !inner.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(fence);
    out.push('\n');
    Ok(out)
}

/// Front matter followed by `body`, one line per entry.
pub fn render(metadata: &Mapping, body: &[String], format: Format) -> Result<String> {
    let mut out = serialize(metadata, format)?;
    for line in body {
        out.push_str(line);
        out.push('\n');
    }
    Ok(out)
}
