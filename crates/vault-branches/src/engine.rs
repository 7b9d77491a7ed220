use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use vault_core::{
    Branch, BranchId, ConversationDocument, ConversationStore, MessageId, StoreError, TurnRecord,
};

use crate::tree;

/// Label given to a continuation split off the unnamed root.
pub const DEFAULT_CONTINUATION_LABEL: &str = "Main";

#[derive(Error, Debug)]
pub enum BranchError {
    #[error("chat_id required")]
    MissingChatId,

    #[error("chat '{0}' not found")]
    ChatNotFound(String),

    #[error("message '{0}' not found")]
    MessageNotFound(String),

    #[error("branch '{0}' not found")]
    BranchNotFound(String),

    #[error("branch '{0}' already exists")]
    BranchExists(String),

    #[error("cannot delete root branch '{0}'")]
    CannotDeleteRoot(String),

    #[error("branch '{0}' has child branches")]
    BranchHasChildren(String),

    #[error("branch name cannot be empty")]
    InvalidName,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type BranchResult<T> = std::result::Result<T, BranchError>;

#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub branch: Branch,
    pub continuation: Option<Branch>,
    pub history: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchOutcome {
    pub branch: BranchId,
    pub history: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub deleted: BranchId,
    pub removed_messages: usize,
    pub active_branch: Option<BranchId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchSummary {
    pub id: BranchId,
    pub display_name: Option<String>,
    pub parent_branch: Option<BranchId>,
    pub parent_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub children: Vec<BranchId>,
    pub message_count: usize,
    pub is_leaf: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchListing {
    pub branches: Vec<BranchSummary>,
    pub active_branch: Option<BranchId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryOutcome {
    pub history: Vec<Value>,
    pub active_branch: Option<BranchId>,
}

/// Tree-structured history over the flat message log of each chat.
///
/// Every mutation runs inside [`ConversationStore::update`], so it holds the
/// chat's document lock and is written back only if it succeeds.
pub struct BranchEngine {
    store: ConversationStore,
    active_cache: DashMap<String, BranchId>,
}

impl BranchEngine {
    pub fn new(store: ConversationStore) -> Self {
        Self {
            store,
            active_cache: DashMap::new(),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn cached_active(&self, chat_id: &str) -> Option<BranchId> {
        self.active_cache.get(chat_id).map(|id| id.clone())
    }

    pub async fn create_branch(
        &self,
        chat_id: &str,
        message_id: &str,
        branch_id: Option<&str>,
        name: Option<&str>,
    ) -> BranchResult<CreateOutcome> {
        require_chat(chat_id)?;
        let name = non_empty(name).map(str::to_string);
        let requested = non_empty(branch_id)
            .map(str::to_string)
            .or_else(|| name.clone());

        let outcome = self
            .store
            .update(chat_id, |doc| {
                split_and_branch(doc, message_id, requested, name)
            })
            .await
            .map_err(|e| not_found_as_chat(e, chat_id))?;

        self.active_cache
            .insert(chat_id.to_string(), outcome.branch.id.clone());
        log::info!(
            "Created branch '{}' from message '{}' in chat '{}'",
            outcome.branch.id,
            message_id,
            chat_id
        );
        Ok(outcome)
    }

    pub async fn delete_branch(&self, chat_id: &str, branch_id: &str) -> BranchResult<DeleteOutcome> {
        require_chat(chat_id)?;
        let outcome = self
            .store
            .update(chat_id, |doc| remove_leaf(doc, branch_id))
            .await
            .map_err(|e| not_found_as_chat(e, chat_id))?;

        let cached_is_deleted = self
            .active_cache
            .get(chat_id)
            .map(|cached| *cached == outcome.deleted)
            .unwrap_or(false);
        if cached_is_deleted {
            match &outcome.fallback {
                Some(fallback) => {
                    self.active_cache
                        .insert(chat_id.to_string(), fallback.clone());
                }
                None => {
                    self.active_cache.remove(chat_id);
                }
            }
        }

        log::info!("Deleted branch '{}' in chat '{}'", branch_id, chat_id);
        Ok(DeleteOutcome {
            deleted: outcome.deleted,
            removed_messages: outcome.removed_messages,
            active_branch: outcome.active_branch,
        })
    }

    /// Points the chat at `branch` exactly as requested; an empty id means
    /// the root.
    pub async fn switch_branch(
        &self,
        chat_id: &str,
        branch: Option<&str>,
    ) -> BranchResult<SwitchOutcome> {
        require_chat(chat_id)?;
        let requested = non_empty(branch).map(str::to_string);

        let outcome = self
            .store
            .update(chat_id, |doc| {
                let target = match requested {
                    Some(id) => {
                        if !doc.branches.contains_key(&id) {
                            return Err(BranchError::BranchNotFound(id));
                        }
                        id
                    }
                    None => {
                        tree::ensure_rooted(doc);
                        tree::root_id(doc)
                            .ok_or_else(|| BranchError::BranchNotFound(String::new()))?
                    }
                };
                doc.active_branch = Some(target.clone());
                Ok(SwitchOutcome {
                    history: tree::filter_history(doc, &target),
                    branch: target,
                })
            })
            .await
            .map_err(|e| not_found_as_chat(e, chat_id))?;

        self.active_cache
            .insert(chat_id.to_string(), outcome.branch.clone());
        Ok(outcome)
    }

    pub async fn rename_branch(
        &self,
        chat_id: &str,
        branch_id: &str,
        name: &str,
    ) -> BranchResult<Branch> {
        require_chat(chat_id)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(BranchError::InvalidName);
        }

        self.store
            .update(chat_id, |doc| {
                let branch = doc
                    .branches
                    .get_mut(branch_id)
                    .ok_or_else(|| BranchError::BranchNotFound(branch_id.to_string()))?;
                branch.display_name = Some(name.to_string());
                Ok(branch.clone())
            })
            .await
            .map_err(|e| not_found_as_chat(e, chat_id))
    }

    /// Sets the display name only while the branch is still unnamed.
    pub async fn name_if_unnamed(
        &self,
        chat_id: &str,
        branch_id: &str,
        name: &str,
    ) -> BranchResult<bool> {
        self.store
            .update(chat_id, |doc| {
                let branch = doc
                    .branches
                    .get_mut(branch_id)
                    .ok_or_else(|| BranchError::BranchNotFound(branch_id.to_string()))?;
                if branch.display_name.is_some() {
                    return Ok(false);
                }
                branch.display_name = Some(name.to_string());
                Ok(true)
            })
            .await
    }

    pub async fn list_branches(&self, chat_id: &str) -> BranchResult<BranchListing> {
        require_chat(chat_id)?;
        let doc = self
            .store
            .load(chat_id)
            .await?
            .ok_or_else(|| BranchError::ChatNotFound(chat_id.to_string()))?;

        let mut branches: Vec<BranchSummary> = doc
            .branches
            .values()
            .map(|branch| {
                let children: Vec<BranchId> = doc
                    .children_of(&branch.id)
                    .into_iter()
                    .map(|child| child.id.clone())
                    .collect();
                BranchSummary {
                    id: branch.id.clone(),
                    display_name: branch.display_name.clone(),
                    parent_branch: branch.parent_branch.clone(),
                    parent_message_id: branch.parent_message_id.clone(),
                    created_at: branch.created_at,
                    is_leaf: children.is_empty(),
                    children,
                    message_count: doc.messages_tagged(&branch.id),
                }
            })
            .collect();
        branches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let cached = self.cached_active(chat_id);
        Ok(BranchListing {
            branches,
            active_branch: tree::resolve_active(&doc, None, cached.as_deref()),
        })
    }

    /// History as seen from the leaf reached from `branch`. An unknown or
    /// absent `branch` falls back to the document's active branch, then the
    /// cached one, then the root. A missing chat has an empty history.
    pub async fn get_history(
        &self,
        chat_id: &str,
        branch: Option<&str>,
    ) -> BranchResult<HistoryOutcome> {
        require_chat(chat_id)?;
        let doc = match self.store.load(chat_id).await? {
            Some(doc) => doc,
            None => {
                return Ok(HistoryOutcome {
                    history: Vec::new(),
                    active_branch: None,
                })
            }
        };

        if !doc.is_rooted() {
            return Ok(HistoryOutcome {
                history: tree::linear_history(&doc),
                active_branch: None,
            });
        }

        let cached = self.cached_active(chat_id);
        let target = tree::resolve_active(&doc, non_empty(branch), cached.as_deref())
            .ok_or_else(|| BranchError::BranchNotFound(branch.unwrap_or_default().to_string()))?;

        Ok(HistoryOutcome {
            history: tree::filter_history(&doc, &target),
            active_branch: Some(target),
        })
    }

    /// Tags a freshly produced turn with the resolved active leaf. Linear
    /// chats are left alone. Returns the branch used, if any.
    pub async fn annotate_turn(&self, turn: &TurnRecord) -> BranchResult<Option<BranchId>> {
        let cached = self.cached_active(&turn.chat_id);
        let ids = turn.message_ids();

        let tagged = self
            .store
            .update(&turn.chat_id, |doc| {
                if !doc.is_rooted() {
                    return Ok(None);
                }
                let leaf = match tree::resolve_active(doc, None, cached.as_deref()) {
                    Some(leaf) => leaf,
                    None => return Ok(None),
                };
                for message in doc
                    .messages
                    .iter_mut()
                    .filter(|m| ids.contains(&m.id.as_str()))
                {
                    message.branch = Some(leaf.clone());
                }
                doc.active_branch = Some(leaf.clone());
                Ok(Some(leaf))
            })
            .await;

        let tagged = match tagged {
            Ok(tagged) => tagged,
            Err(BranchError::Store(StoreError::NotFound(_))) => None,
            Err(e) => return Err(e),
        };
        if let Some(leaf) = &tagged {
            self.active_cache
                .insert(turn.chat_id.clone(), leaf.clone());
            log::debug!("Tagged turn in chat '{}' with '{}'", turn.chat_id, leaf);
        }
        Ok(tagged)
    }
}

struct RemovedLeaf {
    deleted: BranchId,
    removed_messages: usize,
    active_branch: Option<BranchId>,
    fallback: Option<BranchId>,
}

fn split_and_branch(
    doc: &mut ConversationDocument,
    message_id: &str,
    requested_id: Option<String>,
    name: Option<String>,
) -> BranchResult<CreateOutcome> {
    let index = doc
        .message_index(message_id)
        .ok_or_else(|| BranchError::MessageNotFound(message_id.to_string()))?;

    let new_id = match requested_id {
        Some(id) if doc.branches.contains_key(&id) => return Err(BranchError::BranchExists(id)),
        Some(id) if id == vault_core::ROOT_BRANCH_ID && !doc.is_rooted() => {
            return Err(BranchError::BranchExists(id))
        }
        Some(id) => id,
        None => tree::fresh_branch_id(doc),
    };

    tree::ensure_rooted(doc);
    let root = tree::root_id(doc).ok_or_else(|| BranchError::BranchNotFound(String::new()))?;

    let source = doc.messages[index]
        .branch
        .clone()
        .filter(|tag| doc.branches.contains_key(tag))
        .unwrap_or(root);

    let tail: Vec<usize> = (index + 1..doc.messages.len())
        .filter(|i| doc.messages[*i].is_tagged_to(&source))
        .collect();

    let continuation = if tail.is_empty() {
        None
    } else {
        let source_branch = &doc.branches[&source];
        let label = match &source_branch.display_name {
            Some(name) => Some(name.clone()),
            None if source_branch.is_root() => Some(DEFAULT_CONTINUATION_LABEL.to_string()),
            None => None,
        };

        let continuation_id = loop {
            let candidate = tree::fresh_branch_id(doc);
            if candidate != new_id {
                break candidate;
            }
        };
        let continuation = Branch::child(
            continuation_id.clone(),
            source.clone(),
            message_id,
            doc.next_branch_timestamp(),
        )
        .with_display_name(label);
        doc.branches
            .insert(continuation_id.clone(), continuation.clone());

        let moved: HashSet<MessageId> = tail
            .iter()
            .map(|i| doc.messages[*i].id.clone())
            .collect();
        for i in &tail {
            doc.messages[*i].branch = Some(continuation_id.clone());
        }
        for branch in doc.branches.values_mut() {
            let diverges_in_tail = branch
                .parent_message_id
                .as_ref()
                .map(|m| moved.contains(m))
                .unwrap_or(false);
            if branch.parent_branch.as_deref() == Some(source.as_str()) && diverges_in_tail {
                branch.parent_branch = Some(continuation_id.clone());
            }
        }
        Some(continuation)
    };

    let branch = Branch::child(
        new_id.clone(),
        source,
        message_id,
        doc.next_branch_timestamp(),
    )
    .with_display_name(name);
    doc.branches.insert(new_id.clone(), branch.clone());
    doc.active_branch = Some(new_id.clone());

    Ok(CreateOutcome {
        history: tree::filter_history(doc, &new_id),
        branch,
        continuation,
    })
}

fn remove_leaf(doc: &mut ConversationDocument, branch_id: &str) -> BranchResult<RemovedLeaf> {
    let branch = doc
        .branches
        .get(branch_id)
        .cloned()
        .ok_or_else(|| BranchError::BranchNotFound(branch_id.to_string()))?;
    if branch.is_root() {
        return Err(BranchError::CannotDeleteRoot(branch_id.to_string()));
    }
    if doc.has_children(branch_id) {
        return Err(BranchError::BranchHasChildren(branch_id.to_string()));
    }

    let before = doc.messages.len();
    doc.messages.retain(|m| !m.is_tagged_to(branch_id));
    let removed_messages = before - doc.messages.len();
    doc.branches.remove(branch_id);

    let fallback = branch
        .parent_branch
        .filter(|parent| doc.branches.contains_key(parent))
        .or_else(|| tree::root_id(doc));
    if doc.active_branch.as_deref() == Some(branch_id) {
        doc.active_branch = fallback.clone();
    }

    Ok(RemovedLeaf {
        deleted: branch_id.to_string(),
        removed_messages,
        active_branch: doc.active_branch.clone(),
        fallback,
    })
}

fn require_chat(chat_id: &str) -> BranchResult<()> {
    if chat_id.trim().is_empty() {
        return Err(BranchError::MissingChatId);
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn not_found_as_chat(error: BranchError, chat_id: &str) -> BranchError {
    match error {
        BranchError::Store(StoreError::NotFound(_)) => BranchError::ChatNotFound(chat_id.to_string()),
        other => other,
    }
}
