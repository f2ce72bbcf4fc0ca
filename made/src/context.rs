//! Context Assembler (C3): walks the artifact DAG upward from a node to
//! collect inherited attachments, bounded by depth.

use crate::model::Attachment;
use crate::store::ArtifactStore;

/// `ancestor_attachments(node, max_depth=3)` from SPEC_FULL.md §4.3.
///
/// Walks parent pointers starting at `node_id`, accumulating each visited
/// node's own attachments in encountered order (self first, then parent,
/// then grandparent...), stopping once `max_depth` nodes have been visited
/// or `parent_id` is `NULL`. The parent graph is acyclic by invariant, so no
/// visited-set is required; a depth counter alone bounds the walk.
pub fn ancestor_attachments(store: &ArtifactStore, node_id: i64, max_depth: usize) -> Vec<Attachment> {
    let mut attachments = Vec::new();
    let mut current_id = Some(node_id);
    let mut depth = 0;

    while let Some(id) = current_id {
        if depth >= max_depth {
            break;
        }
        let Ok(node) = store.get_node(id) else {
            break;
        };
        attachments.extend(store.attachments_of(id));
        current_id = node.parent_id;
        depth += 1;
    }

    attachments
}

/// Comma-joined filename manifest, in ancestor-walk order — the value
/// persisted as a node's `attachment_filenames` field.
pub fn filenames_manifest(attachments: &[Attachment]) -> Option<String> {
    if attachments.is_empty() {
        return None;
    }
    Some(
        attachments
            .iter()
            .map(|a| a.filename.as_str())
            .collect::<Vec<_>>()
            .join(","),
    )
}
