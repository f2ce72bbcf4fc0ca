//! Artifact Store (C1): persists nodes and their attachments in-process.
//!
//! Persistent storage backends are out of scope for this core (see
//! SPEC_FULL.md §1/§4.1); this keeps the CRUD surface of a RocksDB-backed
//! state store (typed create/get/list helpers, ownership checks surfacing
//! as typed errors) but backs it with an in-memory map instead, since
//! durable cross-restart resumption is an explicit non-goal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::model::{
    Attachment, AttachmentId, Conversation, ConversationId, FileType, Method, Node, NodeId,
    NodeType, UserId,
};

/// Errors surfaced by the artifact store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("attachment too large: {0}")]
    AttachmentTooLarge(String),

    #[error("unsupported file type: {0}")]
    UnsupportedType(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Default)]
struct Inner {
    conversations: HashMap<ConversationId, Conversation>,
    nodes: HashMap<NodeId, Node>,
    /// Node creation order per conversation, for `list_nodes`.
    node_order: HashMap<ConversationId, Vec<NodeId>>,
    attachments: HashMap<AttachmentId, Attachment>,
    attachments_by_node: HashMap<NodeId, Vec<AttachmentId>>,
    next_conversation_id: ConversationId,
    next_node_id: NodeId,
    next_attachment_id: AttachmentId,
}

/// In-memory, thread-safe artifact store. Cheaply cloneable (`Arc` inside).
#[derive(Clone, Default)]
pub struct ArtifactStore {
    inner: Arc<Mutex<Inner>>,
}

pub type SharedArtifactStore = ArtifactStore;

#[allow(clippy::too_many_arguments)]
impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_conversation(&self, user_id: UserId, title: String, method: Method) -> Conversation {
        let mut inner = self.inner.lock().unwrap();
        inner.next_conversation_id += 1;
        let id = inner.next_conversation_id;
        let conversation = Conversation {
            id,
            user_id,
            title,
            method,
            created_at: chrono::Utc::now(),
        };
        inner.conversations.insert(id, conversation.clone());
        conversation
    }

    pub fn get_conversation(
        &self,
        conversation_id: ConversationId,
        user_id: &str,
    ) -> StoreResult<Conversation> {
        let inner = self.inner.lock().unwrap();
        let conversation = inner
            .conversations
            .get(&conversation_id)
            .ok_or(StoreError::NotFound)?;
        if conversation.user_id != user_id {
            return Err(StoreError::NotFound);
        }
        Ok(conversation.clone())
    }

    pub fn list_conversations(&self, user_id: &str) -> Vec<Conversation> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// `create_node` contract from SPEC_FULL.md §4.1.
    pub fn create_node(
        &self,
        conversation_id: ConversationId,
        parent_id: Option<NodeId>,
        node_type: NodeType,
        content: String,
        model_name: Option<String>,
        prompt_sent: Option<String>,
        attachment_filenames: Option<String>,
        actual_cost: f64,
        warnings: Option<Vec<String>>,
    ) -> StoreResult<Node> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.conversations.contains_key(&conversation_id) {
            return Err(StoreError::NotFound);
        }
        if let Some(pid) = parent_id {
            match inner.nodes.get(&pid) {
                Some(parent) if parent.conversation_id == conversation_id => {}
                Some(_) => return Err(StoreError::Forbidden),
                None => return Err(StoreError::NotFound),
            }
        }
        inner.next_node_id += 1;
        let id = inner.next_node_id;
        let node = Node {
            id,
            conversation_id,
            parent_id,
            node_type,
            content,
            model_name,
            prompt_sent,
            attachment_filenames,
            actual_cost,
            warnings,
            created_at: chrono::Utc::now(),
        };
        inner.nodes.insert(id, node.clone());
        inner.node_order.entry(conversation_id).or_default().push(id);
        Ok(node)
    }

    pub fn get_node(&self, node_id: NodeId) -> StoreResult<Node> {
        let inner = self.inner.lock().unwrap();
        inner.nodes.get(&node_id).cloned().ok_or(StoreError::NotFound)
    }

    /// `update_node_cost` contract: ownership is checked by conversation owner.
    pub fn update_node_cost(&self, node_id: NodeId, user_id: &str, cost: f64) -> StoreResult<Node> {
        let mut inner = self.inner.lock().unwrap();
        let conversation_id = {
            let node = inner.nodes.get(&node_id).ok_or(StoreError::NotFound)?;
            node.conversation_id
        };
        let owner_matches = inner
            .conversations
            .get(&conversation_id)
            .map(|c| c.user_id == user_id)
            .unwrap_or(false);
        if !owner_matches {
            return Err(StoreError::NotFound);
        }
        let node = inner.nodes.get_mut(&node_id).ok_or(StoreError::NotFound)?;
        node.actual_cost = cost;
        Ok(node.clone())
    }

    /// Ordered by id ascending (creation order).
    pub fn list_nodes(&self, conversation_id: ConversationId) -> Vec<Node> {
        let inner = self.inner.lock().unwrap();
        inner
            .node_order
            .get(&conversation_id)
            .map(|ids| ids.iter().filter_map(|id| inner.nodes.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn attach(
        &self,
        node_id: NodeId,
        filename: String,
        mime_type: String,
        file_type: FileType,
        file_data: Vec<u8>,
    ) -> StoreResult<Attachment> {
        let file_size = file_data.len() as u64;
        if file_size > file_type.max_size() {
            return Err(StoreError::AttachmentTooLarge(filename));
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.nodes.contains_key(&node_id) {
            return Err(StoreError::NotFound);
        }
        inner.next_attachment_id += 1;
        let id = inner.next_attachment_id;
        let attachment = Attachment {
            id,
            node_id,
            filename,
            file_type,
            mime_type,
            file_size,
            file_data,
        };
        inner.attachments.insert(id, attachment.clone());
        inner.attachments_by_node.entry(node_id).or_default().push(id);
        Ok(attachment)
    }

    pub fn attachments_of(&self, node_id: NodeId) -> Vec<Attachment> {
        let inner = self.inner.lock().unwrap();
        inner
            .attachments_by_node
            .get(&node_id)
            .map(|ids| ids.iter().filter_map(|id| inner.attachments.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn get_attachment(&self, attachment_id: AttachmentId) -> StoreResult<Attachment> {
        let inner = self.inner.lock().unwrap();
        inner
            .attachments
            .get(&attachment_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    /// Owner check used by `/attachments/{id}` — prefers `NotFound` over
    /// `Forbidden` to avoid existence leaks, per §7.
    pub fn get_attachment_owned(
        &self,
        attachment_id: AttachmentId,
        user_id: &str,
    ) -> StoreResult<Attachment> {
        let inner = self.inner.lock().unwrap();
        let attachment = inner
            .attachments
            .get(&attachment_id)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        let node = inner.nodes.get(&attachment.node_id).ok_or(StoreError::NotFound)?;
        let owns = inner
            .conversations
            .get(&node.conversation_id)
            .map(|c| c.user_id == user_id)
            .unwrap_or(false);
        if !owns {
            return Err(StoreError::NotFound);
        }
        Ok(attachment)
    }

    pub fn total_cost(&self, conversation_id: ConversationId) -> f64 {
        let inner = self.inner.lock().unwrap();
        inner
            .node_order
            .get(&conversation_id)
            .map(|ids| ids.iter().filter_map(|id| inner.nodes.get(id)).map(|n| n.actual_cost).sum())
            .unwrap_or(0.0)
    }
}
