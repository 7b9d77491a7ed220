//! Pure tree queries over a [`ConversationDocument`].
//!
//! Nothing here touches storage; the engine loads a document, runs these
//! functions and writes the result back.

use std::collections::HashSet;

use serde_json::Value;
use vault_core::{Branch, BranchId, ConversationDocument, ROOT_BRANCH_ID};

/// Mints the root branch on a linear document and tags every untagged
/// message with it. Returns whether anything changed.
pub fn ensure_rooted(doc: &mut ConversationDocument) -> bool {
    if doc.is_rooted() {
        return false;
    }
    let created_at = doc.next_branch_timestamp();
    doc.branches.insert(
        ROOT_BRANCH_ID.to_string(),
        Branch::root(ROOT_BRANCH_ID, created_at),
    );
    for message in doc.messages.iter_mut().filter(|m| m.branch.is_none()) {
        message.branch = Some(ROOT_BRANCH_ID.to_string());
    }
    true
}

pub fn root_id(doc: &ConversationDocument) -> Option<BranchId> {
    doc.root_branch().map(|b| b.id.clone())
}

/// `branch_id` followed by each parent up to the root.
pub fn ancestry(doc: &ConversationDocument, branch_id: &str) -> Vec<BranchId> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = doc.branches.get(branch_id);

    while let Some(branch) = current {
        if !seen.insert(branch.id.clone()) {
            log::warn!("Cycle in branch ancestry at '{}'", branch.id);
            break;
        }
        chain.push(branch.id.clone());
        current = branch
            .parent_branch
            .as_deref()
            .and_then(|parent| doc.branches.get(parent));
    }
    chain
}

/// Follows the oldest child until a leaf is reached.
pub fn descend_to_leaf(doc: &ConversationDocument, branch_id: &str) -> BranchId {
    let mut current = branch_id.to_string();
    let mut seen = HashSet::new();
    seen.insert(current.clone());

    loop {
        let next = doc.children_of(&current).first().map(|b| b.id.clone());
        match next {
            Some(child) if seen.insert(child.clone()) => current = child,
            Some(child) => {
                log::warn!("Cycle in branch tree at '{}'", child);
                return current;
            }
            None => return current,
        }
    }
}

/// Explicit argument, then the document pointer, then the session cache,
/// then the root; the winner is descended to a leaf. `None` for linear
/// documents.
pub fn resolve_active(
    doc: &ConversationDocument,
    explicit: Option<&str>,
    cached: Option<&str>,
) -> Option<BranchId> {
    let exists = |id: &&str| !id.is_empty() && doc.branches.contains_key(*id);

    let nominal = explicit
        .filter(exists)
        .or_else(|| doc.active_branch.as_deref().filter(exists))
        .or_else(|| cached.filter(exists))
        .map(str::to_string)
        .or_else(|| root_id(doc))?;

    Some(descend_to_leaf(doc, &nominal))
}

/// Messages visible from `branch_id`: untagged ones plus those tagged to
/// any ancestor. Tagged entries carry `matched_branch` in the returned copy.
pub fn filter_history(doc: &ConversationDocument, branch_id: &str) -> Vec<Value> {
    if !doc.is_rooted() {
        return linear_history(doc);
    }

    let chain = ancestry(doc, branch_id);
    doc.messages
        .iter()
        .filter_map(|message| {
            let mut value = serde_json::to_value(message).ok()?;
            match message.branch.as_deref() {
                None => Some(value),
                Some(tag) if chain.iter().any(|id| id == tag) => {
                    if let Value::Object(map) = &mut value {
                        map.insert("matched_branch".to_string(), Value::String(tag.to_string()));
                    }
                    Some(value)
                }
                Some(_) => None,
            }
        })
        .collect()
}

pub fn linear_history(doc: &ConversationDocument) -> Vec<Value> {
    doc.messages
        .iter()
        .filter_map(|m| serde_json::to_value(m).ok())
        .collect()
}

/// Unused 8-hex branch id.
pub fn fresh_branch_id(doc: &ConversationDocument) -> BranchId {
    loop {
        let id = vault_core::ids::short_id();
        if !doc.branches.contains_key(&id) {
            return id;
        }
    }
}
