use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::ids;

pub type BranchId = String;
pub type MessageId = String;

/// Id given to the lazily created root branch.
pub const ROOT_BRANCH_ID: &str = "main";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of the flat, append-only message log.
///
/// `branch` is the single branch tag. Older documents stored a list under
/// `branches`; those are accepted on read and written back single-valued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Empty only between deserialization and [`ConversationDocument::from_value`].
    #[serde(default)]
    pub id: MessageId,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(
        default,
        alias = "branches",
        deserialize_with = "deserialize_branch_tag",
        skip_serializing_if = "Option::is_none"
    )]
    pub branch: Option<BranchId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// RFC 3339 strings, or epoch seconds as older documents wrote them.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Stamp {
        Text(DateTime<Utc>),
        Epoch(f64),
    }

    match Option::<Stamp>::deserialize(deserializer)? {
        Some(Stamp::Text(at)) => Ok(at),
        Some(Stamp::Epoch(secs)) => from_epoch_secs(secs).ok_or_else(|| {
            serde::de::Error::custom(format!("timestamp out of range: {}", secs))
        }),
        None => Ok(Utc::now()),
    }
}

fn from_epoch_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

fn deserialize_branch_tag<'de, D>(deserializer: D) -> Result<Option<BranchId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Tag {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Tag>::deserialize(deserializer)? {
        Some(Tag::One(id)) if !id.is_empty() => Some(id),
        Some(Tag::Many(ids)) => ids.into_iter().find(|id| !id.is_empty()),
        _ => None,
    })
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: ids::uuid(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            branch: None,
            extra: Map::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn is_tagged_to(&self, branch_id: &str) -> bool {
        self.branch.as_deref() == Some(branch_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    #[serde(default)]
    pub id: BranchId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, alias = "source_branch")]
    pub parent_branch: Option<BranchId>,
    #[serde(default)]
    pub parent_message_id: Option<MessageId>,
}

impl Branch {
    pub fn root(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            created_at,
            parent_branch: None,
            parent_message_id: None,
        }
    }

    pub fn child(
        id: impl Into<String>,
        parent_branch: impl Into<String>,
        parent_message_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            created_at,
            parent_branch: Some(parent_branch.into()),
            parent_message_id: Some(parent_message_id.into()),
        }
    }

    pub fn with_display_name(mut self, name: Option<String>) -> Self {
        self.display_name = name;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_branch.is_none()
    }
}

/// Everything persisted for one chat session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationDocument {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub branches: BTreeMap<BranchId, Branch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_branch: Option<BranchId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConversationDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts both the document shape and the legacy bare message array.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        let mut document = match value {
            Value::Array(_) => Self {
                messages: serde_json::from_value(value)?,
                ..Self::default()
            },
            other => serde_json::from_value(other)?,
        };
        document.normalize();
        Ok(document)
    }

    /// Repairs what older documents leave inconsistent.
    ///
    /// Branch records take the id of the key they are stored under. Exactly
    /// one branch stays parentless: `main` when it is, otherwise the oldest.
    /// Every other parentless or dangling branch hangs off that root.
    /// Messages stored without an id get one derived from their position,
    /// so the same file yields the same ids until it is next written.
    pub fn normalize(&mut self) {
        for (key, branch) in self.branches.iter_mut() {
            if branch.id != *key {
                branch.id = key.clone();
            }
        }
        self.demote_extra_roots();
        self.fill_missing_ids();
    }

    fn demote_extra_roots(&mut self) {
        let root = match self.branches.get(ROOT_BRANCH_ID) {
            Some(main) if main.is_root() => Some(main.id.clone()),
            _ => self
                .branches
                .values()
                .filter(|b| b.is_root())
                .min_by(|left, right| {
                    left.created_at
                        .cmp(&right.created_at)
                        .then_with(|| left.id.cmp(&right.id))
                })
                .map(|b| b.id.clone()),
        };
        let Some(root) = root else {
            return;
        };

        let known: Vec<BranchId> = self.branches.keys().cloned().collect();
        for branch in self.branches.values_mut() {
            if branch.id == root {
                continue;
            }
            let attached = matches!(
                branch.parent_branch.as_deref(),
                Some(parent) if parent != branch.id && known.iter().any(|k| k == parent)
            );
            if !attached {
                log::debug!("Attaching branch '{}' under root '{}'", branch.id, root);
                branch.parent_branch = Some(root.clone());
            }
        }
    }

    fn fill_missing_ids(&mut self) {
        if self.messages.iter().all(|m| !m.id.is_empty()) {
            return;
        }
        let mut taken: HashSet<MessageId> =
            self.messages.iter().map(|m| m.id.clone()).collect();
        for (index, message) in self.messages.iter_mut().enumerate() {
            if !message.id.is_empty() {
                continue;
            }
            let mut candidate = format!("msg-{:04}", index);
            let mut attempt = 1;
            while taken.contains(&candidate) {
                candidate = format!("msg-{:04}-{}", index, attempt);
                attempt += 1;
            }
            taken.insert(candidate.clone());
            message.id = candidate;
        }
    }

    pub fn is_rooted(&self) -> bool {
        !self.branches.is_empty()
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn message_index(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn root_branch(&self) -> Option<&Branch> {
        self.branches.values().find(|b| b.is_root())
    }

    /// Children of `branch_id`, oldest first.
    pub fn children_of(&self, branch_id: &str) -> Vec<&Branch> {
        let mut children: Vec<&Branch> = self
            .branches
            .values()
            .filter(|b| b.parent_branch.as_deref() == Some(branch_id))
            .collect();
        children.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        children
    }

    pub fn has_children(&self, branch_id: &str) -> bool {
        self.branches
            .values()
            .any(|b| b.parent_branch.as_deref() == Some(branch_id))
    }

    pub fn messages_tagged(&self, branch_id: &str) -> usize {
        self.messages.iter().filter(|m| m.is_tagged_to(branch_id)).count()
    }

    /// Creation time for a new branch, strictly after every existing one.
    pub fn next_branch_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.branches.values().map(|b| b.created_at).max() {
            Some(latest) if latest >= now => latest + chrono::Duration::milliseconds(1),
            _ => now,
        }
    }
}

/// Payload published on the pipeline output topic after a chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub chat_id: String,
    pub user_message: Message,
    pub assistant_message: Message,
    #[serde(default = "default_true")]
    pub save_to_memory: bool,
}

fn default_true() -> bool {
    true
}

impl TurnRecord {
    pub fn message_ids(&self) -> [&str; 2] {
        [&self.user_message.id, &self.assistant_message.id]
    }
}
