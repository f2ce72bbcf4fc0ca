//! Core data model: Conversation, Node (reasoning artifact), and Attachment.
//!
//! Mirrors the schema described in the deliberation spec: a conversation owns
//! a tree of nodes linked by `parent_id`, and each node may own attachments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ConversationId = i64;
pub type NodeId = i64;
pub type AttachmentId = i64;
pub type UserId = String;

/// How a deliberation is run end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Dag,
    Ensemble,
    Dxo,
    Superchat,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Method::Dag => "dag",
            Method::Ensemble => "ensemble",
            Method::Dxo => "dxo",
            Method::Superchat => "superchat",
        };
        write!(f, "{s}")
    }
}

/// A reasoning artifact's position in the deliberation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Root,
    Plan,
    Research,
    Critique,
    Synthesis,
    Proposal,
    Refinement,
    TestCases,
    Verdict,
}

/// Category a file attachment falls under, used for size limits and
/// multimodal wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Image,
    Pdf,
    Audio,
    Video,
    Text,
    File,
}

impl FileType {
    /// Per-type maximum size in bytes (invariant 3-6).
    pub fn max_size(self) -> u64 {
        match self {
            FileType::Image => 10 * 1024 * 1024,
            FileType::Pdf => 20 * 1024 * 1024,
            FileType::Text => 5 * 1024 * 1024,
            FileType::Audio => 25 * 1024 * 1024,
            FileType::Video => 50 * 1024 * 1024,
            FileType::File => 20 * 1024 * 1024,
        }
    }

    pub fn from_mime(mime: &str) -> Option<FileType> {
        match mime {
            "image/jpeg" | "image/png" | "image/gif" | "image/webp" | "image/svg+xml" => {
                Some(FileType::Image)
            }
            "application/pdf" => Some(FileType::Pdf),
            "audio/mpeg" | "audio/wav" | "audio/ogg" => Some(FileType::Audio),
            "video/mp4" | "video/webm" => Some(FileType::Video),
            "text/plain"
            | "text/markdown"
            | "text/x-markdown"
            | "text/x-python"
            | "text/x-java"
            | "text/x-c"
            | "text/x-c++"
            | "text/javascript"
            | "application/javascript"
            | "application/x-javascript"
            | "text/typescript"
            | "application/typescript"
            | "text/html"
            | "text/css"
            | "application/json"
            | "application/xml"
            | "text/xml"
            | "application/yaml"
            | "text/yaml"
            | "application/x-yaml"
            | "text/x-yaml"
            | "text/csv"
            | "application/csv"
            | "text/x-log"
            | "application/octet-stream" => Some(FileType::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: UserId,
    pub title: String,
    pub method: Method,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Mirrors the source's `title = prompt[:50]` truncation, at a char boundary.
    pub fn derive_title(prompt: &str) -> String {
        prompt.chars().take(50).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub conversation_id: ConversationId,
    pub parent_id: Option<NodeId>,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub content: String,
    pub model_name: Option<String>,
    pub prompt_sent: Option<String>,
    pub attachment_filenames: Option<String>,
    pub actual_cost: f64,
    pub warnings: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub node_id: NodeId,
    pub filename: String,
    pub file_type: FileType,
    pub mime_type: String,
    pub file_size: u64,
    #[serde(skip)]
    pub file_data: Vec<u8>,
}

/// Wire shape for a node plus its attachment metadata, used on both the SSE
/// `node` event and the `/history/{id}` response. The `model` key
/// deliberately differs from the storage field name `model_name`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub conversation_id: ConversationId,
    pub parent_id: Option<NodeId>,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub content: String,
    pub model: Option<String>,
    pub attachment_filenames: Option<String>,
    pub prompt_sent: Option<String>,
    pub actual_cost: f64,
    pub warnings: Vec<String>,
    pub attachments: Vec<AttachmentView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentView {
    pub id: AttachmentId,
    pub filename: String,
    pub file_type: FileType,
    pub file_size: u64,
    pub mime_type: String,
}

impl From<&Attachment> for AttachmentView {
    fn from(a: &Attachment) -> Self {
        AttachmentView {
            id: a.id,
            filename: a.filename.clone(),
            file_type: a.file_type,
            file_size: a.file_size,
            mime_type: a.mime_type.clone(),
        }
    }
}

impl NodeView {
    pub fn new(node: &Node, attachments: &[Attachment]) -> Self {
        NodeView {
            id: node.id,
            conversation_id: node.conversation_id,
            parent_id: node.parent_id,
            node_type: node.node_type,
            content: node.content.clone(),
            model: node.model_name.clone(),
            attachment_filenames: node.attachment_filenames.clone(),
            prompt_sent: node.prompt_sent.clone(),
            actual_cost: node.actual_cost,
            warnings: node.warnings.clone().unwrap_or_default(),
            attachments: attachments.iter().map(AttachmentView::from).collect(),
        }
    }
}
