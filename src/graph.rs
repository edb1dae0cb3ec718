//! Conversation message graphs and branch selection.
//!
//! Open WebUI keeps every regenerated reply, so a conversation's history is a
//! forest: each root is a user turn without a parent, and every alternative
//! answer is another child. A rendered post shows exactly one linear branch of
//! that forest. The branch is named on disk by a *partial* set of message ids
//! (the `history` list in the annotation front matter) and must map to exactly
//! one root-to-leaf path.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Author of a message. Anything other than a user or assistant turn
/// (system prompts, tool output) is kept as `Other` and never rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[default]
    #[serde(other)]
    Other,
}

/// A single chat message as exported by Open WebUI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Messages without an id cannot be addressed and are dropped at render time.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children_ids: Vec<String>,
}

impl Message {
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The input violates the forest invariant. The conversation cannot be
/// rendered, but other conversations are unaffected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("message {id} names parent {parent}, which is not in the history")]
    DanglingParent { id: String, parent: String },
}

/// No single branch matches the requested history. Always fatal: guessing a
/// branch would silently detach the annotations written against another one.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no history path contains all of {required:?}")]
    Missing { required: Vec<String> },

    #[error("{candidates} history paths contain all of {required:?}; add more ids to `history`")]
    Ambiguous {
        required: Vec<String>,
        candidates: usize,
    },
}

// ---------------------------------------------------------------------------
// Forest
// ---------------------------------------------------------------------------

/// Arena of messages keyed by id. Parent/child links are ids into the arena,
/// never references, so traversal needs no shared ownership.
#[derive(Debug, Clone, Default)]
pub struct Forest {
    nodes: BTreeMap<String, Message>,
    roots: Vec<String>,
}

impl Forest {
    /// Build a forest from an id → message mapping, checking that every
    /// `parentId` resolves.
    pub fn new(nodes: BTreeMap<String, Message>) -> Result<Self, GraphError> {
        let mut nodes = nodes;
        for (key, msg) in nodes.iter_mut() {
            if msg.id.is_none() {
                msg.id = Some(key.clone());
            }
        }

        let mut roots = Vec::new();
        for (key, msg) in &nodes {
            match msg.parent_id.as_deref() {
                None => roots.push(key.clone()),
                Some(parent) if nodes.contains_key(parent) => {}
                Some(parent) => {
                    return Err(GraphError::DanglingParent {
                        id: key.clone(),
                        parent: parent.to_string(),
                    });
                }
            }
        }

        Ok(Self { nodes, roots })
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Root-to-`leaf` sequence following `parentId` links upwards.
    /// `None` if `leaf` is unknown or the parent chain loops.
    pub fn lineage(&self, leaf: &str) -> Option<Vec<Message>> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut cursor = Some(leaf);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                warn!(id, "parent chain loops back on itself");
                return None;
            }
            let msg = self.nodes.get(id)?;
            chain.push(msg.clone());
            cursor = msg.parent_id.as_deref();
        }
        chain.reverse();
        Some(chain)
    }

    /// Lazily enumerate every root-to-leaf path, depth first, roots and
    /// children in their stored order.
    pub fn paths(&self) -> Paths<'_> {
        let stack = self
            .roots
            .iter()
            .rev()
            .filter_map(|id| self.nodes.get(id))
            .map(|msg| (0, msg))
            .collect();
        Paths {
            forest: self,
            stack,
            trail: Vec::new(),
        }
    }
}

/// One-shot depth-first walk over a [`Forest`]. Each leaf yields the path
/// that reached it; the walk keeps an explicit stack of `(depth, node)`
/// instead of recursing, so deep conversations cannot overflow.
pub struct Paths<'a> {
    forest: &'a Forest,
    stack: Vec<(usize, &'a Message)>,
    trail: Vec<&'a Message>,
}

impl Iterator for Paths<'_> {
    type Item = HistoryPath;

    fn next(&mut self) -> Option<HistoryPath> {
        while let Some((depth, node)) = self.stack.pop() {
            self.trail.truncate(depth);
            self.trail.push(node);

            let mut children = Vec::with_capacity(node.children_ids.len());
            for child_id in &node.children_ids {
                match self.forest.get(child_id) {
                    None => debug!(parent = ?node.id, child = %child_id, "unknown child id"),
                    Some(child) if self.trail.iter().any(|m| m.id == child.id) => {
                        warn!(parent = ?node.id, child = %child_id, "child already on path")
                    }
                    Some(child) => children.push(child),
                }
            }

            if children.is_empty() {
                return Some(HistoryPath::new(
                    self.trail.iter().map(|m| (*m).clone()).collect(),
                ));
            }
            for child in children.into_iter().rev() {
                self.stack.push((depth + 1, child));
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Graph & path selection
// ---------------------------------------------------------------------------

/// One conversation's messages, as exported.
#[derive(Debug, Clone)]
pub enum MessageGraph {
    /// Already linear; no branching exposed.
    Flat(Vec<Message>),
    Forest(Forest),
}

/// A linear run of messages plus the set of ids on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPath {
    pub messages: Vec<Message>,
    pub keys: BTreeSet<String>,
}

impl HistoryPath {
    pub fn new(messages: Vec<Message>) -> Self {
        let keys = messages.iter().filter_map(|m| m.id.clone()).collect();
        Self { messages, keys }
    }

    pub fn ids(&self) -> Vec<&str> {
        self.messages.iter().filter_map(Message::id).collect()
    }

    /// Position of the message with `id`, if it is on this path.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id() == Some(id))
    }
}

/// Pick the single path of `graph` whose key set covers `required`.
///
/// A flat graph with nothing required is returned as-is. A flat graph with
/// required keys is treated as the only candidate path.
pub fn select_path(
    graph: &MessageGraph,
    required: &BTreeSet<String>,
) -> Result<HistoryPath, SelectionError> {
    match graph {
        MessageGraph::Flat(messages) => {
            let path = HistoryPath::new(messages.clone());
            if path.keys.is_superset(required) {
                Ok(path)
            } else {
                Err(SelectionError::Missing {
                    required: required.iter().cloned().collect(),
                })
            }
        }
        MessageGraph::Forest(forest) => {
            let mut matching = forest.paths().filter(|p| p.keys.is_superset(required));
            let Some(first) = matching.next() else {
                return Err(SelectionError::Missing {
                    required: required.iter().cloned().collect(),
                });
            };
            let extra = matching.count();
            if extra > 0 {
                return Err(SelectionError::Ambiguous {
                    required: required.iter().cloned().collect(),
                    candidates: extra + 1,
                });
            }
            debug!(len = first.messages.len(), "selected history path");
            Ok(first)
        }
    }
}
