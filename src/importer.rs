/// Type definitions and loaders for Open WebUI chat exports.
///
/// Two sources are supported:
///
/// - JSON files produced by "Export chats" in the Open WebUI settings. A file
///   holds either one chat record or an array of them; `.zst` files are
///   zstd-compressed JSON.
/// - The Open WebUI SQLite database (`webui.db`), read from the `chat` table:
///
/// ```sql
/// CREATE TABLE chat (
///     id         VARCHAR PRIMARY KEY,
///     user_id    VARCHAR,
///     title      TEXT,
///     chat       JSON,     -- the `ChatBody` below
///     created_at BIGINT,   -- epoch seconds
///     updated_at BIGINT,   -- epoch seconds
///     ...
/// );
/// ```
use crate::graph::{Forest, GraphError, Message, MessageGraph};
use crate::utils;
use chrono::{DateTime, FixedOffset, Local, TimeZone};
use eyre::{Context, Result, eyre};
use rusqlite::Connection;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One exported chat, as stored by Open WebUI.
///
/// The conversation itself lives under `chat`; exports that put `models`,
/// `messages` and `history` at the top level are accepted too.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<f64>,
    #[serde(default)]
    pub updated_at: Option<f64>,
    #[serde(default)]
    pub chat: Option<ChatBody>,
    #[serde(flatten)]
    pub inline: ChatBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatBody {
    #[serde(default)]
    pub title: Option<String>,
    /// Model ids, e.g. `llama3:latest` or `openai/gpt-4o`.
    #[serde(default)]
    pub models: Vec<String>,
    /// The currently displayed branch, flattened.
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
    /// Every message ever generated, including regenerated alternatives.
    #[serde(default)]
    pub history: Option<History>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct History {
    /// Leaf of the branch the user last looked at.
    #[serde(default, rename = "currentId")]
    pub current_id: Option<String>,
    #[serde(default)]
    pub messages: BTreeMap<String, Message>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<ChatRecord>),
    One(Box<ChatRecord>),
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A chat record that passed validation.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub models: Vec<String>,
    /// Epoch seconds: `updated_at`, else `created_at`.
    pub timestamp: Option<f64>,
    pub messages: Option<Vec<Message>>,
    pub history: Option<History>,
}

impl ChatRecord {
    /// `None` (with a warning) when the record has no usable id.
    pub fn into_conversation(self) -> Option<Conversation> {
        let id = match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                warn!(title = ?self.title, "chat record without id, skipped");
                return None;
            }
        };
        let body = self.chat.unwrap_or(self.inline);
        let title = body
            .title
            .or(self.title)
            .map(|t| t.trim().to_string())
            .unwrap_or_default();
        Some(Conversation {
            id,
            title,
            models: body.models,
            timestamp: self.updated_at.or(self.created_at),
            messages: body.messages,
            history: body.history,
        })
    }
}

impl Conversation {
    /// Local time of the conversation; now if it carries no timestamp.
    pub fn date(&self) -> DateTime<FixedOffset> {
        let local = self.timestamp.and_then(|ts| {
            let secs = ts.trunc() as i64;
            let nanos = (ts.fract() * 1e9).round() as u32;
            Local.timestamp_opt(secs, nanos.min(999_999_999)).single()
        });
        if local.is_none() && self.timestamp.is_some() {
            warn!(id = %self.id, ts = ?self.timestamp, "timestamp out of range, using now");
        }
        local.unwrap_or_else(Local::now).fixed_offset()
    }

    /// The graph to search for a path containing `required`.
    ///
    /// With nothing required the conversation's default ordering is used:
    /// the flat message list, else the lineage of `history.currentId`.
    pub fn graph(&self, required: &BTreeSet<String>) -> Result<MessageGraph, GraphError> {
        if required.is_empty()
            && let Some(messages) = &self.messages
        {
            return Ok(MessageGraph::Flat(messages.clone()));
        }
        if let Some(history) = &self.history {
            let forest = Forest::new(history.messages.clone())?;
            if required.is_empty()
                && let Some(current) = history.current_id.as_deref()
                && let Some(lineage) = forest.lineage(current)
            {
                return Ok(MessageGraph::Flat(lineage));
            }
            debug!(
                id = %self.id,
                nodes = forest.len(),
                roots = forest.roots().len(),
                "searching history forest"
            );
            return Ok(MessageGraph::Forest(forest));
        }
        Ok(MessageGraph::Flat(self.messages.clone().unwrap_or_default()))
    }
}

// ---------------------------------------------------------------------------
// Loaders
// ---------------------------------------------------------------------------

/// Parse JSON holding one chat record or an array of them.
pub fn parse_records(json_bytes: &[u8]) -> Result<Vec<ChatRecord>> {
    match serde_json::from_slice::<OneOrMany>(json_bytes)
        .wrap_err("Input is neither a chat object nor an array of chats")?
    {
        OneOrMany::Many(records) => Ok(records),
        OneOrMany::One(record) => Ok(vec![*record]),
    }
}

/// Read one export file, decompressing `.zst`.
pub fn load_file(path: &Path) -> Result<Vec<ChatRecord>> {
    let raw = fs::read(path).wrap_err_with(|| format!("Failed to read: {}", path.display()))?;
    let data_type = match path.extension().and_then(|e| e.to_str()) {
        Some("zst") => "zstd",
        _ => "json",
    };
    let json_bytes = utils::decompress(data_type, &raw)
        .wrap_err_with(|| format!("Failed to decompress: {}", path.display()))?;
    let records = parse_records(&json_bytes)
        .wrap_err_with(|| format!("Failed to parse: {}", path.display()))?;
    info!(path = %path.display(), chats = records.len(), "loaded export file");
    Ok(records)
}

/// Read every chat from an Open WebUI database, newest first. The database is
/// snapshotted first so a running Open WebUI instance is never blocked.
pub fn load_db(db_path: &Path, quiet: bool) -> Result<Vec<ChatRecord>> {
    if !db_path.exists() {
        return Err(eyre!("Database not found at: {}", db_path.display()));
    }
    let snapshot = utils::backup_database(db_path, quiet)?;
    let conn = Connection::open(snapshot.path()).wrap_err("Failed to open snapshot database")?;

    let mut stmt = conn
        .prepare("SELECT id, title, chat, created_at, updated_at FROM chat ORDER BY updated_at DESC")
        .wrap_err("Failed to prepare query")?;
    let mut rows = stmt.query([]).wrap_err("Failed to execute query")?;

    let mut records = Vec::new();
    while let Some(row) = rows.next().wrap_err("Failed to read row")? {
        let id: String = row.get(0)?;
        let title: Option<String> = row.get(1)?;
        let chat_json: Option<String> = row.get(2)?;
        let created_at: Option<i64> = row.get(3)?;
        let updated_at: Option<i64> = row.get(4)?;

        let chat = match chat_json.as_deref().map(|s| serde_json::from_str::<ChatBody>(s)) {
            Some(Ok(body)) => Some(body),
            Some(Err(e)) => {
                warn!(id = %id, error = %e, "chat column is not valid JSON, skipped");
                continue;
            }
            None => None,
        };
        records.push(ChatRecord {
            id: Some(id),
            title,
            created_at: created_at.map(|t| t as f64),
            updated_at: updated_at.map(|t| t as f64),
            chat,
            inline: ChatBody::default(),
        });
    }
    info!(path = %db_path.display(), chats = records.len(), "loaded database");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NESTED: &str = r#"[{
        "id": "id1",
        "user_id": "user1",
        "title": "outer",
        "updated_at": 1704110400,
        "created_at": 1704000000,
        "chat": {
            "id": "cid1",
            "title": "hello🍺🍖  \n",
            "models": ["model1:latest", "prefix/model2:latest"],
            "params": {},
            "history": {
                "currentId": "uuid3",
                "messages": {
                    "uuid1": {"id": "uuid1", "childrenIds": ["uuid2", "uuid3"], "role": "user", "content": "content 1"},
                    "uuid2": {"id": "uuid2", "parentId": "uuid1", "role": "assistant", "content": "response 1"},
                    "uuid3": {"id": "uuid3", "parentId": "uuid1", "role": "assistant", "content": "response 2"}
                }
            }
        }
    }]"#;

    fn keys(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_array_with_history() {
        let records = parse_records(NESTED.as_bytes()).unwrap();
        assert_eq!(records.len(), 1);
        let conv = records.into_iter().next().unwrap().into_conversation().unwrap();
        assert_eq!(conv.id, "id1");
        assert_eq!(conv.title, "hello🍺🍖");
        assert_eq!(conv.timestamp, Some(1704110400.0));
        assert_eq!(conv.models.len(), 2);
        let history = conv.history.as_ref().unwrap();
        assert_eq!(history.messages["uuid2"].parent_id.as_deref(), Some("uuid1"));
        assert_eq!(history.messages["uuid1"].children_ids, vec!["uuid2", "uuid3"]);
    }

    #[test]
    fn test_default_graph_follows_current_id() {
        let conv = parse_records(NESTED.as_bytes()).unwrap().remove(0).into_conversation().unwrap();
        match conv.graph(&BTreeSet::new()).unwrap() {
            MessageGraph::Flat(msgs) => {
                let ids: Vec<_> = msgs.iter().filter_map(Message::id).collect();
                assert_eq!(ids, vec!["uuid1", "uuid3"]);
            }
            other => panic!("expected flat graph, got {other:?}"),
        }
        assert!(matches!(conv.graph(&keys(&["uuid2"])).unwrap(), MessageGraph::Forest(_)));
    }

    #[test]
    fn test_single_object_with_flat_messages() {
        let json = r#"{"id": "x", "chat": {"title": "t", "models": [],
            "messages": [{"id": "m1", "role": "user", "content": "hi"},
                         {"id": "m2", "role": "system", "content": "sys"}]}}"#;
        let conv = parse_records(json.as_bytes()).unwrap().remove(0).into_conversation().unwrap();
        let MessageGraph::Flat(msgs) = conv.graph(&BTreeSet::new()).unwrap() else {
            panic!("expected flat graph");
        };
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].role, crate::graph::Role::Other);
    }

    #[test]
    fn test_top_level_conversation_fields() {
        let json = r#"{"id": "x", "title": "top", "models": ["m"],
            "messages": [{"id": "m1", "role": "assistant", "content": "a"}]}"#;
        let conv = parse_records(json.as_bytes()).unwrap().remove(0).into_conversation().unwrap();
        assert_eq!(conv.title, "top");
        assert_eq!(conv.models, vec!["m"]);
        assert_eq!(conv.messages.map(|m| m.len()), Some(1));
    }

    #[test]
    fn test_record_without_id_is_rejected() {
        let json = r#"[{"id": "", "chat": {}}, {"chat": {}}]"#;
        let records = parse_records(json.as_bytes()).unwrap();
        assert!(records.into_iter().all(|r| r.into_conversation().is_none()));
    }

    #[test]
    fn test_dangling_parent_surfaces_from_graph() {
        let json = r#"{"id": "x", "chat": {"history": {"messages": {
            "a": {"id": "a", "parentId": "ghost", "role": "user", "content": "?"}}}}}"#;
        let conv = parse_records(json.as_bytes()).unwrap().remove(0).into_conversation().unwrap();
        assert!(conv.graph(&BTreeSet::new()).is_err());
    }

    #[test]
    fn test_date_uses_updated_then_created() {
        let mut conv = Conversation {
            id: "x".into(),
            title: String::new(),
            models: vec![],
            timestamp: Some(1704110400.0),
            messages: None,
            history: None,
        };
        assert_eq!(conv.date().timestamp(), 1704110400);
        conv.timestamp = None;
        assert!((Local::now().timestamp() - conv.date().timestamp()).abs() < 5);
    }

    #[test]
    fn test_load_zst_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chats.json.zst");
        fs::write(&path, zstd::encode_all(NESTED.as_bytes(), 3).unwrap()).unwrap();
        let records = load_file(&path).unwrap();
        assert_eq!(records.len(), 1);
    }
}
