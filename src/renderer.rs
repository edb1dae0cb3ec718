use crate::directive::{InsertMap, Key, NOTICE_CLOSE};
use crate::frontmatter::{self, Format};
use crate::graph::{Message, Role};
use chrono::{DateTime, FixedOffset, SecondsFormat};
use eyre::Result;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

pub const TIP_OPEN: &str = "{{< notice tip >}}";

const SKIP_ID: &str = "skip_id";
const SKIP_N: &str = "skip_n";
const HISTORY: &str = "history";
const AUTHORS_ADD: &str = "authors_add";
const AUTHORS: &str = "authors";

// ---------------------------------------------------------------------------
// Conversation-level fields
// ---------------------------------------------------------------------------

/// Everything about a conversation that is computed rather than recovered
/// from a previous document.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationFields {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub date: DateTime<FixedOffset>,
    pub slug: String,
}

impl ConversationFields {
    pub fn new(id: &str, title: &str, models: &[String], date: DateTime<FixedOffset>) -> Self {
        let title = title.trim().to_string();
        let slug = derive_slug(&title, id);
        let mut authors = Vec::new();
        for model in models {
            let name = participant(model);
            if !name.is_empty() && !authors.contains(&name) {
                authors.push(name);
            }
        }
        Self {
            id: id.to_string(),
            title,
            authors,
            date,
            slug,
        }
    }

    /// `YYYY-MM`, the directory a post is filed under.
    pub fn month_dir(&self) -> String {
        self.date.format("%Y-%m").to_string()
    }

    /// `YYYY-MM-DD-<slug>.md`
    pub fn file_name(&self) -> String {
        format!("{}-{}.md", self.date.format("%Y-%m-%d"), self.slug)
    }

    fn computed_metadata(&self) -> Mapping {
        let mut m = Mapping::new();
        m.insert("draft".into(), false.into());
        m.insert("title".into(), self.title.clone().into());
        m.insert(AUTHORS.into(), string_seq(&self.authors));
        m.insert("id".into(), self.id.clone().into());
        m.insert("slug".into(), self.slug.clone().into());
        m.insert(
            "date".into(),
            self.date.to_rfc3339_opts(SecondsFormat::AutoSi, false).into(),
        );
        m
    }
}

/// Model ids look like `provider/name:tag`; the author is `name`.
pub fn participant(model: &str) -> String {
    let base = model.rsplit('/').next().unwrap_or(model);
    base.split(':').next().unwrap_or(base).trim().to_string()
}

/// Hyphenated name of the first emoji in `title`, else `fallback`.
pub fn derive_slug(title: &str, fallback: &str) -> String {
    let mut buf = [0u8; 4];
    for c in title.chars() {
        if let Some(emoji) = emojis::get(c.encode_utf8(&mut buf)) {
            let slug = slug::slugify(emoji.name());
            if !slug.is_empty() {
                debug!(title, slug = %slug, "slug from emoji");
                return slug;
            }
        }
    }
    info!(title, fallback, "no emoji in title, using id as slug");
    fallback.to_string()
}

// ---------------------------------------------------------------------------
// Reserved metadata
// ---------------------------------------------------------------------------

/// Messages to leave out of the rendered body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipFilter {
    pub ids: BTreeSet<String>,
    pub positions: BTreeSet<i64>,
}

impl SkipFilter {
    pub fn skips(&self, idx: i64, id: &str) -> bool {
        self.positions.contains(&idx) || self.ids.contains(id)
    }
}

/// Controller state recovered from a previous document's front matter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reserved {
    pub skip: SkipFilter,
    /// Ids the selected history path must contain.
    pub history: BTreeSet<String>,
    pub authors_add: Vec<String>,
}

/// Pull the reserved keys out of `metadata`. `skip_id` and `skip_n` are
/// consumed; `history` and `authors_add` stay in the returned mapping.
pub fn split_reserved(mut metadata: Mapping) -> (Mapping, Reserved) {
    let skip = SkipFilter {
        ids: metadata
            .remove(SKIP_ID)
            .map(|v| strings(SKIP_ID, &v))
            .unwrap_or_default()
            .into_iter()
            .collect(),
        positions: metadata
            .remove(SKIP_N)
            .map(|v| integers(SKIP_N, &v))
            .unwrap_or_default()
            .into_iter()
            .collect(),
    };
    let history = metadata
        .get(HISTORY)
        .map(|v| strings(HISTORY, v))
        .unwrap_or_default()
        .into_iter()
        .collect();
    let authors_add = metadata
        .get(AUTHORS_ADD)
        .map(|v| strings(AUTHORS_ADD, v))
        .unwrap_or_default();
    (
        metadata,
        Reserved {
            skip,
            history,
            authors_add,
        },
    )
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn strings(key: &str, v: &Value) -> Vec<String> {
    match v {
        Value::Sequence(items) => items
            .iter()
            .filter_map(|item| {
                let s = scalar_string(item);
                if s.is_none() {
                    warn!(key, ?item, "ignoring non-scalar list entry");
                }
                s
            })
            .collect(),
        Value::Null => Vec::new(),
        other => scalar_string(other).into_iter().collect(),
    }
}

fn integers(key: &str, v: &Value) -> Vec<i64> {
    strings(key, v)
        .into_iter()
        .filter_map(|s| match s.trim().parse::<i64>() {
            Ok(n) => Some(n),
            Err(_) => {
                warn!(key, value = %s, "ignoring non-integer position");
                None
            }
        })
        .collect()
}

fn string_seq(items: &[String]) -> Value {
    Value::Sequence(items.iter().cloned().map(Value::String).collect())
}

// ---------------------------------------------------------------------------
// Metadata merge
// ---------------------------------------------------------------------------

/// Where a front-matter value can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Derived from the conversation itself.
    Computed,
    /// Configured defaults for posts that have no annotation file yet.
    Seed,
    /// Recovered from the annotation file.
    Prior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Copy every key of the source over what is already there.
    Overlay(Source),
    /// `authors` = computed participants, then `authors_add`, deduplicated.
    AuthorsUnion,
}

/// Applied in order; later rules win.
pub const MERGE_RULES: [Rule; 4] = [
    Rule::Overlay(Source::Computed),
    Rule::Overlay(Source::Seed),
    Rule::Overlay(Source::Prior),
    Rule::AuthorsUnion,
];

/// The inputs of a metadata merge, one per [`Source`].
#[derive(Debug, Clone, Default)]
pub struct MetadataSources {
    pub computed: Mapping,
    pub seed: Option<Mapping>,
    pub prior: Option<Mapping>,
    pub computed_authors: Vec<String>,
    pub authors_add: Vec<String>,
}

impl MetadataSources {
    fn layer(&self, source: Source) -> Option<&Mapping> {
        match source {
            Source::Computed => Some(&self.computed),
            Source::Seed => self.seed.as_ref(),
            Source::Prior => self.prior.as_ref(),
        }
    }

    pub fn merge(&self) -> Mapping {
        let mut out = Mapping::new();
        for rule in MERGE_RULES {
            match rule {
                Rule::Overlay(source) => {
                    if let Some(layer) = self.layer(source) {
                        for (k, v) in layer {
                            out.insert(k.clone(), v.clone());
                        }
                    }
                }
                Rule::AuthorsUnion => {
                    if let Some(edited) = self.discarded_authors() {
                        warn!(?edited, "annotation authors replaced, use authors_add instead");
                    }
                    out.insert(AUTHORS.into(), string_seq(&self.authors()));
                }
            }
        }
        out
    }

    /// Computed participants, then `authors_add`, deduplicated.
    pub fn authors(&self) -> Vec<String> {
        let mut authors = self.computed_authors.clone();
        for extra in &self.authors_add {
            if !authors.contains(extra) {
                authors.push(extra.clone());
            }
        }
        authors
    }

    /// A prior `authors` value that the union replaces.
    pub fn discarded_authors(&self) -> Option<&Value> {
        self.prior
            .as_ref()
            .and_then(|p| p.get(AUTHORS))
            .filter(|v| **v != string_seq(&self.authors()))
    }

    /// The rule that decides the final value of `key`, if any.
    pub fn origin(&self, key: &str) -> Option<Rule> {
        MERGE_RULES.into_iter().rev().find(|rule| match rule {
            Rule::Overlay(source) => self.layer(*source).is_some_and(|l| l.contains_key(key)),
            Rule::AuthorsUnion => key == AUTHORS,
        })
    }
}

// ---------------------------------------------------------------------------
// Body
// ---------------------------------------------------------------------------

fn emit(body: &mut Vec<String>, inserts: &mut InsertMap, key: Key) {
    if let Some(block) = inserts.take(&key) {
        debug!(%key, lines = block.len(), "splicing annotation");
        body.extend(block);
    }
}

/// Interleave `messages` with the annotation blocks in `inserts`.
///
/// Slot order: `head`, `first`, then per message its index and its id
/// followed by the message, then `len`, `-1`, `tail`, `last`. Blocks left
/// over once every slot is visited are reported and dropped.
pub fn render_body(messages: &[Message], mut inserts: InsertMap, skip: &SkipFilter) -> Vec<String> {
    let mut body = Vec::new();
    emit(&mut body, &mut inserts, Key::token("head"));
    emit(&mut body, &mut inserts, Key::token("first"));

    for (idx, msg) in messages.iter().enumerate() {
        let idx = idx as i64;
        let Some(id) = msg.id() else {
            warn!(idx, "message has no id, dropped");
            continue;
        };
        if skip.skips(idx, id) {
            debug!(idx, id, "message skipped");
            for key in [Key::Index(idx), Key::token(id)] {
                if inserts.take(&key).is_some() {
                    debug!(%key, "annotation for skipped message suppressed");
                }
            }
            continue;
        }

        emit(&mut body, &mut inserts, Key::Index(idx));
        emit(&mut body, &mut inserts, Key::token(id));
        match (msg.role, msg.content.as_deref()) {
            (Role::Other, _) => debug!(idx, id, "non-chat role, not rendered"),
            (_, None) => warn!(idx, id, "message has no content, dropped"),
            (Role::User, Some(text)) => {
                body.push(TIP_OPEN.to_string());
                body.extend(text.lines().map(String::from));
                body.push(NOTICE_CLOSE.to_string());
                body.push(String::new());
            }
            (Role::Assistant, Some(text)) => {
                body.extend(text.lines().map(String::from));
                body.push(String::new());
            }
        }
    }

    emit(&mut body, &mut inserts, Key::Index(messages.len() as i64));
    emit(&mut body, &mut inserts, Key::Index(-1));
    emit(&mut body, &mut inserts, Key::token("tail"));
    emit(&mut body, &mut inserts, Key::token("last"));

    for key in inserts.keys() {
        warn!(%key, "annotation block matches no slot, dropped");
    }
    body
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedDocument {
    pub metadata: Mapping,
    pub body: Vec<String>,
}

impl RenderedDocument {
    pub fn to_text(&self, format: Format) -> Result<String> {
        frontmatter::render(&self.metadata, &self.body, format)
    }
}

/// Build the output document for one conversation.
///
/// `prior` is the retained metadata of the annotation file (reserved keys
/// already split off) or `None` when there is no annotation file, in which
/// case `seed` supplies the defaults.
pub fn assemble(
    fields: &ConversationFields,
    messages: &[Message],
    inserts: InsertMap,
    reserved: &Reserved,
    prior: Option<Mapping>,
    seed: &Mapping,
) -> RenderedDocument {
    let sources = MetadataSources {
        computed: fields.computed_metadata(),
        seed: prior.is_none().then(|| seed.clone()),
        prior,
        computed_authors: fields.authors.clone(),
        authors_add: reserved.authors_add.clone(),
    };
    RenderedDocument {
        metadata: sources.merge(),
        body: render_body(messages, inserts, &reserved.skip),
    }
}
