//! Annotation directives and the insert map.
//!
//! An annotation document is free prose interleaved with control comments:
//!
//! ```text
//! Intro shown before the first message.
//! <!-- skip 2 -->
//! Shown before message #2.
//! <!-- seek tail -->
//! Closing words.
//! ```
//!
//! Parsing walks the lines with two cursors. `key` names the slot the current
//! block will be stored under (a position, a message id or an anchor token);
//! `pos` is the numeric position that relative `skip`s are counted from.
use crate::graph::Message;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

pub const INFO_OPEN: &str = "{{< notice info >}}";
pub const NOTICE_CLOSE: &str = "{{< /notice >}}";

/// Slot in an [`InsertMap`].
///
/// Positions are indices into the rendered message sequence (`-1` is a valid
/// trailing slot). Tokens are message ids or one of the anchors `head`,
/// `first`, `tail`, `last`, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Index(i64),
    Token(String),
}

impl Key {
    pub fn token(s: impl Into<String>) -> Self {
        Self::Token(s.into())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Index(n) => write!(f, "{n}"),
            Key::Token(t) => f.write_str(t),
        }
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Index(n)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Token(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `<!-- skip N -->`
    Skip(i64),
    /// `<!-- seek N -->` or `<!-- seek TOKEN -->`
    Seek(Key),
}

impl Directive {
    /// Recognise a directive comment. Surrounding whitespace is ignored.
    pub fn parse(line: &str) -> Option<Self> {
        let inner = line
            .trim()
            .strip_prefix("<!--")?
            .strip_suffix("-->")?
            .trim();
        let mut words = inner.split_whitespace();
        let verb = words.next()?;
        let arg = words.next()?;
        if words.next().is_some() {
            return None;
        }
        match verb {
            "skip" => match arg.parse::<i64>() {
                Ok(n) => Some(Directive::Skip(n)),
                Err(_) => {
                    warn!(line, "skip count is not an integer, keeping line as text");
                    None
                }
            },
            "seek" => Some(Directive::Seek(match arg.parse::<i64>() {
                Ok(n) => Key::Index(n),
                Err(_) => Key::token(arg),
            })),
            _ => None,
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Skip(n) => write!(f, "<!-- skip {n} -->"),
            Directive::Seek(key) => write!(f, "<!-- seek {key} -->"),
        }
    }
}

/// Numeric position of a symbolic seek target within `messages`.
pub fn resolve_token(token: &str, messages: &[Message]) -> Option<i64> {
    match token {
        "head" | "first" => Some(0),
        "tail" | "last" => Some(messages.len() as i64),
        id => messages
            .iter()
            .position(|m| m.id() == Some(id))
            .map(|i| i as i64),
    }
}

// ---------------------------------------------------------------------------
// Insert map
// ---------------------------------------------------------------------------

/// Hand-written blocks waiting to be spliced into a rendered document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertMap {
    blocks: BTreeMap<Key, Vec<String>>,
}

impl InsertMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Key) -> Option<&[String]> {
        self.blocks.get(key).map(Vec::as_slice)
    }

    /// Remove and return the block at `key`.
    pub fn take(&mut self, key: &Key) -> Option<Vec<String>> {
        self.blocks.remove(key)
    }

    /// Append `block` to whatever is already stored at `key`.
    pub fn append(&mut self, key: Key, block: Vec<String>) {
        self.blocks.entry(key).or_default().extend(block);
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.blocks.keys()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Render back into annotation text: one `seek` per slot followed by its
    /// block. Parsing the result against the same messages yields `self`.
    pub fn to_annotation_lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (key, block) in &self.blocks {
            out.push(Directive::Seek(key.clone()).to_string());
            out.extend(block.iter().cloned());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Result of scanning an annotation body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedAnnotations {
    pub inserts: InsertMap,
    /// Every non-directive line, in order, before trimming or wrapping.
    pub prose: Vec<String>,
}

struct Cursor {
    key: Key,
    pos: i64,
}

impl Cursor {
    /// Cursor after `directive`, or `None` if a skip would overflow the
    /// position.
    fn advance(&self, directive: &Directive, messages: &[Message]) -> Option<Cursor> {
        match directive {
            Directive::Skip(n) => {
                let key = match &self.key {
                    Key::Index(k) => Key::Index(k.checked_add(*n)?),
                    token => token.clone(),
                };
                Some(Cursor {
                    key,
                    pos: self.pos.checked_add(*n)?,
                })
            }
            Directive::Seek(Key::Index(n)) => Some(Cursor {
                key: Key::Index(*n),
                pos: *n,
            }),
            Directive::Seek(Key::Token(token)) => {
                let pos = resolve_token(token, messages).unwrap_or_else(|| {
                    warn!(target = %token, "seek target not found in conversation");
                    self.pos
                });
                Some(Cursor {
                    key: Key::Token(token.clone()),
                    pos,
                })
            }
        }
    }
}

/// Split a previous document body into insert blocks, resolving symbolic
/// `seek` targets against `messages` (the freshly selected history path).
pub fn parse_annotations<S: AsRef<str>>(body: &[S], messages: &[Message]) -> ParsedAnnotations {
    let mut parsed = ParsedAnnotations::default();
    let mut cursor = Cursor {
        key: Key::Index(0),
        pos: 0,
    };
    let mut block: Vec<String> = Vec::new();

    for line in body {
        let line = line.as_ref().trim_end();
        let step = Directive::parse(line).and_then(|directive| {
            let next = cursor.advance(&directive, messages);
            if next.is_none() {
                warn!(line, "skip overflows the position, keeping line as text");
            }
            next.map(|next| (directive, next))
        });
        match step {
            Some((directive, next)) => {
                flush(&mut parsed.inserts, &cursor.key, std::mem::take(&mut block));
                debug!(%directive, key = %next.key, pos = next.pos, "directive");
                cursor = next;
            }
            None => {
                parsed.prose.push(line.to_string());
                block.push(line.to_string());
            }
        }
    }
    flush(&mut parsed.inserts, &cursor.key, block);
    parsed
}

/// Store `block` under `key`: blank edges trimmed, plain prose wrapped in an
/// info notice, always closed by one blank line. A block opening with `{` is
/// already a shortcode and is stored as-is.
fn flush(inserts: &mut InsertMap, key: &Key, block: Vec<String>) {
    let start = block.iter().position(|l| !l.trim().is_empty());
    let end = block.iter().rposition(|l| !l.trim().is_empty());
    let (Some(start), Some(end)) = (start, end) else {
        return;
    };
    let body = &block[start..=end];

    let mut stored = Vec::with_capacity(body.len() + 3);
    if body[0].starts_with('{') {
        stored.extend_from_slice(body);
    } else {
        stored.push(INFO_OPEN.to_string());
        stored.extend_from_slice(body);
        stored.push(NOTICE_CLOSE.to_string());
    }
    // raw blocks get the closing blank too, so a stored block reparses as itself
    stored.push(String::new());
    inserts.append(key.clone(), stored);
}
